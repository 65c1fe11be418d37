//! C10: virtual filesystem view (spec §4.10).
//!
//! No OS-specific mount primitive is assumed (§9, Design Notes): this
//! exposes the archive set as a plain `list/stat/open/read` trait that a
//! transport layer (FUSE, NFS, an HTTP range handler, ...) can drive
//! directly. Grounded on the read-only tar-backed index lookup in
//! `other_examples/.../geropl-tarfs__...tar-index.rs`, adapted from
//! "index into one big tar" to "index into many small self-describing
//! archives".

use std::collections::HashMap;
use std::sync::Mutex;

use crate::archive::ArchiveReader;
use crate::error::{Error, Result};
use crate::index::{reader, FormatVersion};
use crate::model::{Archive, ArchiveKind, Entry, EntryId};
use crate::path::Interner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Archive,
    Index,
}

#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: NodeKind,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
}

/// A single in-memory model of one backup run: every collection dir's
/// entries and archives, keyed for `getattr`/`readdir`/`read` lookups.
pub struct Snapshot {
    pub entries: Vec<Entry>,
    pub archives: Vec<Archive>,
    pub interner: Interner,
    /// Compressed index bytes, per collection dir, served directly by
    /// `read()` instead of through `ArchiveReader` (the index isn't a tar).
    pub index_bytes: HashMap<EntryId, Vec<u8>>,
    pub header_style: crate::tarcodec::HeaderStyle,
}

/// Guards `Snapshot` lookups with a single recursive-in-spirit mutex
/// (spec §4.10/§5): short critical sections for metadata, byte I/O runs
/// outside the lock.
pub struct VirtualFs {
    inner: Mutex<Snapshot>,
}

impl VirtualFs {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { inner: Mutex::new(snapshot) }
    }

    /// Resolve a `/`-joined path to its attributes.
    pub fn getattr(&self, path: &str) -> Result<Attr> {
        let snap = self.inner.lock().expect("vfs mutex poisoned");
        self.getattr_locked(&snap, path)
    }

    fn getattr_locked(&self, snap: &Snapshot, path: &str) -> Result<Attr> {
        if let Some((archive, part)) = self.lookup_archive(snap, path) {
            let kind = if archive.kind == ArchiveKind::Index { NodeKind::Index } else { NodeKind::Archive };
            return Ok(Attr {
                kind,
                size: archive.part_size(part),
                mtime_sec: archive.mtime_sec,
                mtime_nsec: archive.mtime_nsec,
            });
        }
        if self.lookup_dir(snap, path).is_some() {
            return Ok(Attr { kind: NodeKind::Directory, size: 0, mtime_sec: 0, mtime_nsec: 0 });
        }
        Err(Error::ArchiveMissing { name: path.to_string() })
    }

    /// List the directory entries (child collection dirs plus one
    /// filename per archive part) living at `path`.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let snap = self.inner.lock().expect("vfs mutex poisoned");
        let dir_id = self
            .lookup_dir(&snap, path)
            .ok_or_else(|| Error::ArchiveMissing { name: path.to_string() })?;

        let mut names = Vec::new();
        for archive in snap.archives.iter().filter(|a| a.collection_dir == dir_id) {
            for part in 0..archive.num_parts() {
                names.push(self.archive_filename(&snap, archive, part));
            }
        }
        for &child in &snap.entries[dir_id].entries {
            if snap.entries[child].is_collection {
                let name = snap.interner.name(snap.entries[child].source_path).to_string();
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Read `len` bytes at `off` from the archive named by `path`. Takes
    /// the capability-rooted source directory needed to stream payload
    /// bytes, matching the materializer's contract (§4.7). Only the
    /// lookup runs under the lock (§5): the matched archive and entry
    /// table are cloned out before it's released, so the blocking
    /// `pread` underneath `ArchiveReader::read` never holds the mutex.
    pub fn read(
        &self,
        path: &str,
        off: u64,
        buf: &mut [u8],
        source_root: &cap_std_ext::cap_std::fs_utf8::Dir,
    ) -> Result<usize> {
        let (archive, part, entries, interner, header_style, index_bytes) = {
            let snap = self.inner.lock().expect("vfs mutex poisoned");
            let (archive, part) = self
                .lookup_archive(&snap, path)
                .ok_or_else(|| Error::ArchiveMissing { name: path.to_string() })?;
            let index_bytes = if archive.kind == ArchiveKind::Index {
                Some(snap.index_bytes.get(&archive.collection_dir).cloned().unwrap_or_default())
            } else {
                None
            };
            (archive.clone(), part, snap.entries.clone(), snap.interner.clone(), snap.header_style, index_bytes)
        };

        if let Some(bytes) = index_bytes {
            let off = off as usize;
            if off >= bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(bytes.len() - off);
            buf[..n].copy_from_slice(&bytes[off..off + n]);
            return Ok(n);
        }

        let reader = ArchiveReader {
            archive: &archive,
            entries: &entries,
            interner: &interner,
            source_root,
            header_style,
        };
        reader.read(part, off, buf)
    }

    pub fn load_index(&self, gz_bytes: &[u8]) -> Result<reader::ParsedIndex> {
        use std::io::Read as _;
        let mut decoder = flate2::read::GzDecoder::new(gz_bytes);
        let mut text = Vec::new();
        decoder
            .read_to_end(&mut text)
            .map_err(|e| Error::MalformedIndex { path: "<index>".into(), reason: e.to_string() })?;
        reader::parse(&text)
    }

    fn lookup_dir(&self, snap: &Snapshot, path: &str) -> Option<usize> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return snap.entries.iter().position(|e| e.parent.is_none());
        }
        let mut cur = snap.entries.iter().position(|e| e.parent.is_none())?;
        for seg in trimmed.split('/') {
            cur = snap.entries[cur]
                .entries
                .iter()
                .copied()
                .find(|&id| snap.entries[id].is_collection && snap.interner.name(snap.entries[id].source_path) == seg)?;
        }
        Some(cur)
    }

    fn lookup_archive<'s>(&self, snap: &'s Snapshot, path: &str) -> Option<(&'s Archive, usize)> {
        let filename = path.rsplit('/').next()?;
        for archive in &snap.archives {
            for part in 0..archive.num_parts() {
                if self.archive_filename(snap, archive, part) == filename {
                    return Some((archive, part));
                }
            }
        }
        None
    }

    fn archive_filename(&self, snap: &Snapshot, archive: &Archive, part: usize) -> String {
        let max_part_nr = archive.num_parts().saturating_sub(1);
        let hex_width = format!("{max_part_nr:x}").len();
        format!(
            "{kind}01_{sec:012}.{nsec:09}_{size}_{hash}_{part:0width$x}.{ext}",
            kind = archive.kind.letter(),
            sec = archive.mtime_sec.max(0),
            nsec = archive.mtime_nsec,
            size = archive.total_size,
            hash = hex::encode(archive.fingerprint),
            part = part,
            width = hex_width,
            ext = archive.kind.extension(),
        )
    }
}

/// True if `kind` ever emits a `gz`-suffixed archive, i.e. is the index
/// archive itself — used by transports that special-case the catalog.
pub fn is_index_kind(kind: ArchiveKind) -> bool {
    kind == ArchiveKind::Index
}

pub fn supported_format(version: FormatVersion) -> bool {
    matches!(version, FormatVersion::V0_7 | FormatVersion::V0_8 | FormatVersion::V0_81)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileKind, FileStat, LinkKind};

    fn root_snapshot() -> Snapshot {
        let mut interner = Interner::new();
        let root_path = interner.root();
        let root = Entry {
            id: 0,
            source_path: root_path,
            tar_path: None,
            stat: FileStat {
                kind: FileKind::Directory,
                mode: 0o755,
                uid: 0,
                gid: 0,
                size: 0,
                rdev: 0,
                mtime_sec: 0,
                mtime_nsec: 0,
                ino: 1,
                nlink: 1,
            },
            link_kind: LinkKind::None,
            symlink_target: None,
            hardlink_canonical: None,
            tarpath_hash: 0,
            blocked_size: 512,
            header_size: 512,
            should_content_split: false,
            parent: None,
            archive: None,
            archive_offset: 0,
            is_collection: true,
            children_size: 0,
            entries: Vec::new(),
        };
        let archive = Archive {
            id: 0,
            kind: ArchiveKind::Dir,
            collection_dir: 0,
            members: Vec::new(),
            total_size: 1024,
            mtime_sec: 1_600_000_000,
            mtime_nsec: 0,
            fingerprint: [0u8; 32],
            part_sizes: Vec::new(),
        };
        Snapshot {
            entries: vec![root],
            archives: vec![archive],
            interner,
            index_bytes: HashMap::new(),
            header_style: crate::tarcodec::HeaderStyle::Simple,
        }
    }

    #[test]
    fn root_dir_resolves() {
        let fs = VirtualFs::new(root_snapshot());
        let attr = fs.getattr("/").unwrap();
        assert_eq!(attr.kind, NodeKind::Directory);
    }

    #[test]
    fn dir_archive_is_listed_and_resolvable() {
        let fs = VirtualFs::new(root_snapshot());
        let names = fs.readdir("/").unwrap();
        assert_eq!(names.len(), 1);
        let attr = fs.getattr(&names[0]).unwrap();
        assert_eq!(attr.kind, NodeKind::Archive);
        assert_eq!(attr.size, 1024);
    }

    #[test]
    fn missing_path_is_an_error() {
        let fs = VirtualFs::new(root_snapshot());
        assert!(matches!(fs.getattr("/nope"), Err(Error::ArchiveMissing { .. })));
    }
}
