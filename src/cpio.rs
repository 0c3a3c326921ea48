//! cpio "newc" archive writer (the initramfs format).
//!
//! Entries are emitted in call order. Directory link counts are only known
//! once all children exist, so entries are buffered until the archive is
//! requested.

use std::collections::HashMap;

use log::{debug, info};

use crate::builder::{full_mode, now_timestamp, FilesystemBuilder, NodeKind};
use crate::codec::align_up;
use crate::error::{FsBuildError, Result};
use crate::path;

const MAGIC: &str = "070701";
const HEADER_SIZE: usize = 110;
const TRAILER: &str = "TRAILER!!!";

#[derive(Debug)]
struct CpioEntry {
    name: String,
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    data: Vec<u8>,
    rdev_major: u32,
    rdev_minor: u32,
    subdirs: u32,
}

pub struct CpioFsBuilder {
    entries: Vec<CpioEntry>,
    /// Normalized path to entry index.
    by_path: HashMap<String, usize>,
    timestamp: u32,
    built: bool,
}

impl CpioFsBuilder {
    pub fn new() -> Self {
        Self::with_timestamp(now_timestamp())
    }

    pub fn with_timestamp(timestamp: u32) -> Self {
        Self {
            entries: Vec::new(),
            by_path: HashMap::new(),
            timestamp,
            built: false,
        }
    }

    fn add(&mut self, path: &str, kind: NodeKind, user: u32, group: u32, mode: u32) -> Result<&mut CpioEntry> {
        if self.built {
            return Err(FsBuildError::AlreadyBuilt);
        }
        let path = path::normalize(path)?;

        let name = match path::parent_dir_path(&path) {
            None => {
                if kind != NodeKind::Directory {
                    return Err(FsBuildError::InvalidPath { path });
                }
                if self.by_path.contains_key("/") {
                    return Err(FsBuildError::RootAlreadyExists);
                }
                ".".to_string()
            }
            Some(parent_path) => {
                let parent = match self.by_path.get(parent_path) {
                    Some(idx) if self.entries[*idx].kind == NodeKind::Directory => *idx,
                    _ => return Err(FsBuildError::no_parent(&path)),
                };
                if self.by_path.contains_key(&path) {
                    return Err(FsBuildError::AlreadyExists { path });
                }
                if kind == NodeKind::Directory {
                    self.entries[parent].subdirs += 1;
                }
                path.trim_start_matches('/').to_string()
            }
        };

        debug!("cpio entry {}: {} {name}", self.entries.len(), kind.name());
        let idx = self.entries.len();
        self.by_path.insert(path, idx);
        self.entries.push(CpioEntry {
            name,
            kind,
            mode: full_mode(kind, mode),
            uid: user,
            gid: group,
            data: Vec::new(),
            rdev_major: 0,
            rdev_minor: 0,
            subdirs: 0,
        });
        Ok(&mut self.entries[idx])
    }
}

impl Default for CpioFsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one newc entry: header, NUL-terminated name, data, each of the
/// last two padded to 4 bytes.
#[allow(clippy::too_many_arguments)]
fn write_entry(
    archive: &mut Vec<u8>,
    name: &str,
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    data: &[u8],
    rdev_major: u32,
    rdev_minor: u32,
) {
    let namesize = name.len() + 1;
    let fields = [
        ino,
        mode,
        uid,
        gid,
        nlink,
        mtime,
        data.len() as u32,
        // devmajor, devminor of the archive itself
        0,
        0,
        rdev_major,
        rdev_minor,
        namesize as u32,
        // check
        0,
    ];
    archive.extend_from_slice(MAGIC.as_bytes());
    for field in fields {
        archive.extend_from_slice(format!("{field:08X}").as_bytes());
    }
    archive.extend_from_slice(name.as_bytes());
    archive.push(0);
    let padded = align_up(archive.len(), 4);
    archive.resize(padded, 0);

    archive.extend_from_slice(data);
    let padded = align_up(archive.len(), 4);
    archive.resize(padded, 0);
}

impl FilesystemBuilder for CpioFsBuilder {
    fn directory(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.add(path, NodeKind::Directory, user, group, mode)?;
        Ok(())
    }

    fn file(&mut self, path: &str, content: &[u8], user: u32, group: u32, mode: u32) -> Result<()> {
        if content.len() as u64 > u32::MAX as u64 {
            return Err(FsBuildError::FileTooLarge {
                path: path.to_string(),
                size: content.len() as u64,
            });
        }
        let entry = self.add(path, NodeKind::File, user, group, mode)?;
        entry.data = content.to_vec();
        Ok(())
    }

    fn symlink(&mut self, path: &str, target: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        let entry = self.add(path, NodeKind::SymLink, user, group, mode)?;
        entry.data = target.as_bytes().to_vec();
        Ok(())
    }

    fn block_device(
        &mut self,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()> {
        let entry = self.add(path, NodeKind::BlockDevice, user, group, mode)?;
        entry.rdev_major = major;
        entry.rdev_minor = minor;
        Ok(())
    }

    fn char_device(
        &mut self,
        path: &str,
        major: u32,
        minor: u32,
        user: u32,
        group: u32,
        mode: u32,
    ) -> Result<()> {
        let entry = self.add(path, NodeKind::CharDevice, user, group, mode)?;
        entry.rdev_major = major;
        entry.rdev_minor = minor;
        Ok(())
    }

    fn fifo(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.add(path, NodeKind::Fifo, user, group, mode)?;
        Ok(())
    }

    fn socket(&mut self, path: &str, user: u32, group: u32, mode: u32) -> Result<()> {
        self.add(path, NodeKind::Socket, user, group, mode)?;
        Ok(())
    }

    fn get_filesystem_image(&mut self) -> Result<Vec<u8>> {
        if self.built {
            return Err(FsBuildError::AlreadyBuilt);
        }
        self.built = true;

        let mut archive = Vec::with_capacity(
            self.entries
                .iter()
                .map(|e| HEADER_SIZE + e.name.len() + e.data.len() + 8)
                .sum(),
        );
        for (idx, entry) in self.entries.iter().enumerate() {
            let nlink = if entry.kind == NodeKind::Directory {
                2 + entry.subdirs
            } else {
                1
            };
            write_entry(
                &mut archive,
                &entry.name,
                idx as u32 + 1,
                entry.mode,
                entry.uid,
                entry.gid,
                nlink,
                self.timestamp,
                &entry.data,
                entry.rdev_major,
                entry.rdev_minor,
            );
        }
        write_entry(&mut archive, TRAILER, 0, 0, 0, 0, 1, 0, &[], 0, 0);

        info!(
            "cpio: {} entries, {} bytes",
            self.entries.len(),
            archive.len()
        );
        Ok(archive)
    }
}
