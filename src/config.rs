//! Image manifests.
//!
//! A manifest is a TOML file with one `[image]` table and any number of
//! `[[node]]` entries:
//!
//! ```toml
//! [image]
//! format = "squashfs"
//! compression = "xz"
//! timestamp = 0
//! source = "rootfs"          # optional host directory, imported first
//!
//! [[node]]
//! kind = "char"
//! path = "/dev/console"
//! major = 5
//! minor = 1
//! mode = 0o600
//! ```
//!
//! Relative `source` and `host_file` paths resolve against the manifest's
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;
use serde::Deserialize;

use crate::builder::FilesystemBuilder;
use crate::compression::CompressionKind;
use crate::source::{directory_content_size, populate_from_directory};
use crate::writer::{create_builder, BuildOptions, FsType};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    image: ImageToml,
    #[serde(default)]
    node: Vec<NodeToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    format: String,
    compression: Option<String>,
    block_size: Option<u32>,
    disk_size: Option<u64>,
    timestamp: Option<u32>,
    source: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeToml {
    kind: String,
    path: String,
    #[serde(default)]
    uid: u32,
    #[serde(default)]
    gid: u32,
    mode: Option<u32>,
    content: Option<String>,
    host_file: Option<PathBuf>,
    target: Option<String>,
    major: Option<u32>,
    minor: Option<u32>,
}

/// What a manifest node creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSource {
    Directory,
    File(Vec<u8>),
    HostFile(PathBuf),
    SymLink(String),
    BlockDevice { major: u32, minor: u32 },
    CharDevice { major: u32, minor: u32 },
    Fifo,
    Socket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestNode {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub source: NodeSource,
}

impl ManifestNode {
    /// Issue the builder call for this node.
    pub fn apply(&self, builder: &mut dyn FilesystemBuilder) -> Result<()> {
        let (path, uid, gid, mode) = (self.path.as_str(), self.uid, self.gid, self.mode);
        match &self.source {
            NodeSource::Directory => builder.directory(path, uid, gid, mode),
            NodeSource::File(content) => builder.file(path, content, uid, gid, mode),
            NodeSource::HostFile(host) => {
                let content = fs::read(host)
                    .with_context(|| format!("reading host file '{}'", host.display()))?;
                builder.file(path, &content, uid, gid, mode)
            }
            NodeSource::SymLink(target) => builder.symlink(path, target, uid, gid, mode),
            NodeSource::BlockDevice { major, minor } => {
                builder.block_device(path, *major, *minor, uid, gid, mode)
            }
            NodeSource::CharDevice { major, minor } => {
                builder.char_device(path, *major, *minor, uid, gid, mode)
            }
            NodeSource::Fifo => builder.fifo(path, uid, gid, mode),
            NodeSource::Socket => builder.socket(path, uid, gid, mode),
        }
        .with_context(|| format!("adding manifest node '{}'", self.path))
    }

    fn content_size(&self) -> Result<u64> {
        Ok(match &self.source {
            NodeSource::File(content) => content.len() as u64,
            NodeSource::HostFile(host) => fs::metadata(host)
                .with_context(|| format!("reading metadata of '{}'", host.display()))?
                .len(),
            _ => 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageManifest {
    pub fs_type: FsType,
    pub options: BuildOptions,
    pub source_dir: Option<PathBuf>,
    pub nodes: Vec<ManifestNode>,
}

impl ImageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading image manifest '{}'", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base)
            .with_context(|| format!("parsing image manifest '{}'", path.display()))
    }

    /// Parse manifest text; relative paths are resolved against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let raw: ManifestToml = toml::from_str(text)?;
        let image = raw.image;

        let fs_type: FsType = image
            .format
            .parse()
            .with_context(|| format!("invalid image format '{}'", image.format))?;
        let mut options = BuildOptions {
            block_size: image.block_size.unwrap_or(BuildOptions::default().block_size),
            disk_size: image.disk_size,
            timestamp: image.timestamp,
            ..Default::default()
        };
        if let Some(name) = &image.compression {
            options.compression = name
                .parse::<CompressionKind>()
                .with_context(|| format!("invalid compression '{name}'"))?;
        }

        let nodes = raw
            .node
            .into_iter()
            .map(|node| parse_node(node, base))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fs_type,
            options,
            source_dir: image.source.map(|dir| base.join(dir)),
            nodes,
        })
    }

    /// Payload bytes the image will carry; sizes ext2 disks.
    pub fn content_size(&self) -> Result<u64> {
        let mut total = match &self.source_dir {
            Some(dir) => directory_content_size(dir)?,
            None => 0,
        };
        for node in &self.nodes {
            total += node.content_size()?;
        }
        Ok(total)
    }

    /// Create the builder, import the source directory, add the listed
    /// nodes and return the finished image. Without a source directory or an
    /// explicit `/` node, a root owned by 0:0 with mode 0755 is created.
    pub fn build_image(&self) -> Result<Vec<u8>> {
        let content_size = self.content_size()?;
        let mut builder = create_builder(self.fs_type, &self.options, content_size)
            .with_context(|| format!("creating {} builder", self.fs_type))?;

        match &self.source_dir {
            Some(dir) => {
                populate_from_directory(builder.as_mut(), dir)?;
            }
            None if self.nodes.iter().any(|n| n.path == "/") => {}
            None => builder.directory("/", 0, 0, 0o755)?,
        }
        for node in &self.nodes {
            node.apply(builder.as_mut())?;
        }

        let image = builder
            .get_filesystem_image()
            .with_context(|| format!("finishing {} image", self.fs_type))?;
        info!(
            "{} image: {} nodes from manifest, {} bytes",
            self.fs_type,
            self.nodes.len(),
            image.len()
        );
        Ok(image)
    }
}

fn parse_node(node: NodeToml, base: &Path) -> Result<ManifestNode> {
    let kind = node.kind.trim().to_ascii_lowercase();
    let device = |node: &NodeToml| -> Result<(u32, u32)> {
        match (node.major, node.minor) {
            (Some(major), Some(minor)) => Ok((major, minor)),
            _ => bail!("invalid node '{}': devices need major and minor", node.path),
        }
    };

    let (source, default_mode) = match kind.as_str() {
        "dir" | "directory" => (NodeSource::Directory, 0o755),
        "file" => {
            let source = match (&node.content, &node.host_file) {
                (Some(content), None) => NodeSource::File(content.as_bytes().to_vec()),
                (None, Some(host)) => NodeSource::HostFile(base.join(host)),
                (None, None) => NodeSource::File(Vec::new()),
                (Some(_), Some(_)) => bail!(
                    "invalid node '{}': content and host_file are mutually exclusive",
                    node.path
                ),
            };
            (source, 0o644)
        }
        "symlink" | "link" => match &node.target {
            Some(target) => (NodeSource::SymLink(target.clone()), 0o777),
            None => bail!("invalid node '{}': symlink needs a target", node.path),
        },
        "block" => {
            let (major, minor) = device(&node)?;
            (NodeSource::BlockDevice { major, minor }, 0o600)
        }
        "char" => {
            let (major, minor) = device(&node)?;
            (NodeSource::CharDevice { major, minor }, 0o600)
        }
        "fifo" => (NodeSource::Fifo, 0o644),
        "socket" => (NodeSource::Socket, 0o755),
        other => bail!("invalid node '{}': unsupported kind '{}'", node.path, other),
    };

    let uses_payload = matches!(source, NodeSource::File(_) | NodeSource::HostFile(_));
    if !uses_payload && (node.content.is_some() || node.host_file.is_some()) {
        bail!("invalid node '{}': only files carry content", node.path);
    }
    if !matches!(source, NodeSource::SymLink(_)) && node.target.is_some() {
        bail!("invalid node '{}': only symlinks have a target", node.path);
    }

    Ok(ManifestNode {
        path: node.path,
        uid: node.uid,
        gid: node.gid,
        mode: node.mode.unwrap_or(default_mode),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squashfs::superblock::SQUASHFS_MAGIC;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = ImageManifest::parse(
            r##"
[image]
format = "SquashFS"
compression = "zstd"
block_size = 65536
timestamp = 7

[[node]]
kind = "dir"
path = "/dev"

[[node]]
kind = "char"
path = "/dev/console"
major = 5
minor = 1

[[node]]
kind = "file"
path = "/init"
content = "#!/bin/sh\n"
mode = 0o755
uid = 1000
gid = 100

[[node]]
kind = "symlink"
path = "/sh"
target = "/bin/busybox"
"##,
            Path::new("/manifests"),
        )
        .unwrap();

        assert_eq!(manifest.fs_type, FsType::SquashFs);
        assert_eq!(manifest.options.compression, CompressionKind::Zstd);
        assert_eq!(manifest.options.block_size, 65536);
        assert_eq!(manifest.options.timestamp, Some(7));
        assert_eq!(manifest.source_dir, None);
        assert_eq!(manifest.nodes.len(), 4);
        assert_eq!(manifest.nodes[0].mode, 0o755);
        assert_eq!(
            manifest.nodes[1].source,
            NodeSource::CharDevice { major: 5, minor: 1 }
        );
        assert_eq!(manifest.nodes[1].mode, 0o600);
        assert_eq!(manifest.nodes[2].source, NodeSource::File(b"#!/bin/sh\n".to_vec()));
        assert_eq!((manifest.nodes[2].uid, manifest.nodes[2].gid), (1000, 100));
        assert_eq!(manifest.nodes[3].mode, 0o777);
    }

    #[test]
    fn test_defaults_and_relative_paths() {
        let manifest = ImageManifest::parse(
            r#"
[image]
format = "ext2"
source = "rootfs"

[[node]]
kind = "file"
path = "/etc/motd"
host_file = "files/motd"
"#,
            Path::new("/work"),
        )
        .unwrap();

        assert_eq!(manifest.options, BuildOptions::default());
        assert_eq!(manifest.source_dir, Some(PathBuf::from("/work/rootfs")));
        assert_eq!(
            manifest.nodes[0].source,
            NodeSource::HostFile(PathBuf::from("/work/files/motd"))
        );
    }

    #[test]
    fn test_rejects_bad_manifests() {
        let cases = [
            ("[image]\nformat = \"ntfs\"\n", "invalid image format"),
            (
                "[image]\nformat = \"squashfs\"\ncompression = \"brotli\"\n",
                "invalid compression",
            ),
            ("[image]\nformat = \"cpio\"\nlabel = \"x\"\n", "unknown field"),
            (
                "[image]\nformat = \"cpio\"\n[[node]]\nkind = \"pipe\"\npath = \"/p\"\n",
                "unsupported kind",
            ),
            (
                "[image]\nformat = \"cpio\"\n[[node]]\nkind = \"char\"\npath = \"/c\"\nmajor = 1\n",
                "major and minor",
            ),
            (
                "[image]\nformat = \"cpio\"\n[[node]]\nkind = \"symlink\"\npath = \"/l\"\n",
                "needs a target",
            ),
            (
                "[image]\nformat = \"cpio\"\n[[node]]\nkind = \"dir\"\npath = \"/d\"\ncontent = \"x\"\n",
                "only files carry content",
            ),
        ];
        for (text, expected) in cases {
            let err = ImageManifest::parse(text, Path::new(".")).unwrap_err();
            let message = format!("{err:#}");
            assert!(message.contains(expected), "{message}");
        }
    }

    #[test]
    fn test_load_and_build_with_source_dir() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("rootfs/etc")).unwrap();
        fs::write(temp.path().join("rootfs/etc/hostname"), "node1\n").unwrap();
        fs::write(temp.path().join("motd"), "hello\n").unwrap();
        let manifest_path = temp.path().join("image.toml");
        fs::write(
            &manifest_path,
            r#"
[image]
format = "squashfs"
compression = "gzip"
timestamp = 0
source = "rootfs"

[[node]]
kind = "file"
path = "/etc/motd"
host_file = "motd"
mode = 0o644
"#,
        )
        .unwrap();

        let manifest = ImageManifest::load(&manifest_path).unwrap();
        assert_eq!(manifest.content_size().unwrap(), 12);

        let image = manifest.build_image().unwrap();
        assert_eq!(&image[0..4], &SQUASHFS_MAGIC.to_le_bytes());
        assert_eq!(image.len() % 4096, 0);
    }

    #[test]
    fn test_build_creates_default_root() {
        let manifest = ImageManifest::parse(
            "[image]\nformat = \"cpio\"\ntimestamp = 0\n[[node]]\nkind = \"fifo\"\npath = \"/fifo\"\n",
            Path::new("."),
        )
        .unwrap();
        let archive = manifest.build_image().unwrap();
        let text = String::from_utf8_lossy(&archive);
        assert!(text.contains("fifo"));
        assert!(text.contains("TRAILER!!!"));
        // root entry comes first
        assert_eq!(&archive[110..112], b".\0");
    }

    #[test]
    fn test_explicit_root_node() {
        let manifest = ImageManifest::parse(
            "[image]\nformat = \"ext2\"\ntimestamp = 0\n[[node]]\nkind = \"dir\"\npath = \"/\"\nmode = 0o700\n",
            Path::new("."),
        )
        .unwrap();
        let image = manifest.build_image().unwrap();
        assert_eq!(image.len(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let err = ImageManifest::load(&temp.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("reading image manifest"));
    }
}
