//! Populate a builder from a directory tree on the host.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use walkdir::WalkDir;

use crate::builder::{FilesystemBuilder, PERMISSION_MASK};

/// Map a path relative to the import root to an image path.
fn image_path(relative: &Path) -> Result<String> {
    let mut out = String::new();
    for component in relative.components() {
        let name = component
            .as_os_str()
            .to_str()
            .with_context(|| format!("non UTF-8 file name in '{}'", relative.display()))?;
        out.push('/');
        out.push_str(name);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Walk `dir` (sorted by name, symlinks not followed) and create one node
/// per entry, starting with the root directory. Ownership, permissions and
/// device numbers are taken from the host. Returns the number of nodes.
pub fn populate_from_directory(builder: &mut dyn FilesystemBuilder, dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        bail!("source directory '{}' does not exist", dir.display());
    }
    info!("importing '{}'", dir.display());

    let mut count = 0;
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("'{}' is outside the source", entry.path().display()))?;
        let path = image_path(relative)?;
        let meta = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("reading metadata of '{}'", entry.path().display()))?;
        let (uid, gid, mode) = (meta.uid(), meta.gid(), meta.mode() & PERMISSION_MASK);
        let file_type = meta.file_type();

        if file_type.is_dir() {
            builder.directory(&path, uid, gid, mode)
        } else if file_type.is_file() {
            let content = fs::read(entry.path())
                .with_context(|| format!("reading '{}'", entry.path().display()))?;
            builder.file(&path, &content, uid, gid, mode)
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("reading link '{}'", entry.path().display()))?;
            let target = target
                .to_str()
                .with_context(|| format!("non UTF-8 link target in '{}'", entry.path().display()))?;
            builder.symlink(&path, target, uid, gid, mode)
        } else if file_type.is_block_device() {
            let rdev = meta.rdev();
            builder.block_device(&path, libc::major(rdev), libc::minor(rdev), uid, gid, mode)
        } else if file_type.is_char_device() {
            let rdev = meta.rdev();
            builder.char_device(&path, libc::major(rdev), libc::minor(rdev), uid, gid, mode)
        } else if file_type.is_fifo() {
            builder.fifo(&path, uid, gid, mode)
        } else if file_type.is_socket() {
            builder.socket(&path, uid, gid, mode)
        } else {
            bail!("unsupported file type at '{}'", entry.path().display());
        }
        .with_context(|| format!("adding '{path}' from '{}'", entry.path().display()))?;
        count += 1;
    }
    Ok(count)
}

/// Total size of the regular files under `dir`.
pub fn directory_content_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("reading metadata of '{}'", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpio::CpioFsBuilder;
    use crate::error::FsBuildError;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::TempDir;

    /// Records the calls a builder receives.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl FilesystemBuilder for Recorder {
        fn directory(&mut self, path: &str, _: u32, _: u32, mode: u32) -> crate::error::Result<()> {
            self.calls.push(format!("dir {path} {mode:o}"));
            Ok(())
        }

        fn file(&mut self, path: &str, content: &[u8], _: u32, _: u32, mode: u32) -> crate::error::Result<()> {
            self.calls
                .push(format!("file {path} {mode:o} {}", String::from_utf8_lossy(content)));
            Ok(())
        }

        fn symlink(&mut self, path: &str, target: &str, _: u32, _: u32, _: u32) -> crate::error::Result<()> {
            self.calls.push(format!("link {path} -> {target}"));
            Ok(())
        }

        fn block_device(&mut self, path: &str, _: u32, _: u32, _: u32, _: u32, _: u32) -> crate::error::Result<()> {
            self.calls.push(format!("block {path}"));
            Ok(())
        }

        fn char_device(&mut self, path: &str, _: u32, _: u32, _: u32, _: u32, _: u32) -> crate::error::Result<()> {
            self.calls.push(format!("char {path}"));
            Ok(())
        }

        fn fifo(&mut self, path: &str, _: u32, _: u32, _: u32) -> crate::error::Result<()> {
            self.calls.push(format!("fifo {path}"));
            Ok(())
        }

        fn socket(&mut self, path: &str, _: u32, _: u32, _: u32) -> crate::error::Result<()> {
            self.calls.push(format!("socket {path}"));
            Ok(())
        }

        fn get_filesystem_image(&mut self) -> crate::error::Result<Vec<u8>> {
            Err(FsBuildError::AlreadyBuilt)
        }
    }

    fn sample_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::set_permissions(root, fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(root.join("etc")).unwrap();
        fs::set_permissions(root.join("etc"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::write(root.join("etc/hostname"), "node1").unwrap();
        fs::set_permissions(root.join("etc/hostname"), fs::Permissions::from_mode(0o640)).unwrap();
        fs::create_dir(root.join("bin")).unwrap();
        fs::set_permissions(root.join("bin"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(root.join("bin/busybox"), "elf").unwrap();
        fs::set_permissions(root.join("bin/busybox"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("busybox", root.join("bin/sh")).unwrap();
        temp
    }

    #[test]
    fn import_visits_tree_sorted_parents_first() {
        let temp = sample_tree();
        let mut recorder = Recorder::default();
        let count = populate_from_directory(&mut recorder, temp.path()).unwrap();

        assert_eq!(count, 6);
        assert_eq!(
            recorder.calls,
            vec![
                "dir / 755",
                "dir /bin 755",
                "file /bin/busybox 755 elf",
                "link /bin/sh -> busybox",
                "dir /etc 750",
                "file /etc/hostname 640 node1",
            ]
        );
    }

    #[test]
    fn import_into_real_builder() {
        let temp = sample_tree();
        let mut cpio = CpioFsBuilder::with_timestamp(0);
        populate_from_directory(&mut cpio, temp.path()).unwrap();
        let archive = cpio.get_filesystem_image().unwrap();

        let text = String::from_utf8_lossy(&archive);
        assert!(text.contains("etc/hostname"));
        assert!(text.contains("bin/sh"));
        assert!(text.contains("TRAILER!!!"));
    }

    #[test]
    fn missing_source_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut recorder = Recorder::default();
        let err = populate_from_directory(&mut recorder, &temp.path().join("nope")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn content_size_counts_regular_files() {
        let temp = sample_tree();
        assert_eq!(directory_content_size(temp.path()).unwrap(), 5 + 3);
    }

    #[test]
    fn image_path_mapping() {
        assert_eq!(image_path(Path::new("")).unwrap(), "/");
        assert_eq!(image_path(Path::new("etc/hostname")).unwrap(), "/etc/hostname");
    }
}
