//! Shared data model: entries, archives, collection dirs (spec §3).
//!
//! Entries and archives reference each other by index (`EntryId`,
//! `ArchiveId`) into the session's arenas rather than through owning
//! pointers, so the graph has no lifetime cycles (§9, Design Notes).

use crate::path::PathId;

pub type EntryId = usize;
pub type ArchiveId = usize;

/// Kind of filesystem object an [`Entry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    None,
    Symbolic,
    Hard,
}

/// Metadata captured at scan time, independent of where the entry ends up
/// living in the archive graph.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub ino: u64,
    pub nlink: u64,
}

/// One scanned source object (spec §3, "Entry").
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: EntryId,
    /// Absolute path in the source tree.
    pub source_path: PathId,
    /// Path relative to the owning collection dir, `/`-joined. Set once
    /// §4.5 runs. Kept as a plain `String` (not interned) since it is
    /// meaningful only relative to one collection dir and is itself the
    /// bucket-hashing key (§4.6), not a navigable tree node.
    pub tar_path: Option<String>,
    pub stat: FileStat,
    pub link_kind: LinkKind,
    /// Symlink target (raw string, not necessarily resolvable) or, for a
    /// hard link, the canonical entry's id.
    pub symlink_target: Option<String>,
    pub hardlink_canonical: Option<EntryId>,
    /// 32-bit hash of the *tar path*, the bucket assignment key (§4.6).
    pub tarpath_hash: u32,
    /// header + payload rounded up to 512; invariant: multiple of 512.
    pub blocked_size: u64,
    pub header_size: u64,
    pub should_content_split: bool,
    pub parent: Option<EntryId>,
    /// Which archive this entry is materialized into, once §4.6 runs.
    pub archive: Option<ArchiveId>,
    /// Byte offset of this entry's header within its archive.
    pub archive_offset: u64,

    // --- collection-dir bookkeeping (directories only) ---
    pub is_collection: bool,
    /// Running size of the subtree rooted here, used by the two-pass
    /// selector (§4.5) and zeroed out once a dir is marked a collection.
    pub children_size: u64,
    /// For a collection dir: every descendant entry that lives in an
    /// archive rooted here, in tar order.
    pub entries: Vec<EntryId>,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.stat.kind == FileKind::Directory
    }

    /// Only regular, non-hard-link files contribute payload bytes (§3).
    pub fn payload_size(&self) -> u64 {
        if self.stat.kind == FileKind::Regular && self.link_kind != LinkKind::Hard {
            self.stat.size
        } else {
            0
        }
    }
}

/// A directory distinguished as rooting its own set of archives (§3,
/// "Collection dir"). Collection-dir-ness lives on the `Entry` itself
/// (`is_collection`); this type is a read-only view used once the two
/// passes of §4.5 have finished.
#[derive(Debug, Clone, Copy)]
pub struct CollectionDir(pub EntryId);

/// Archive classification (spec §3/§6). `split-large` is represented as
/// `Large` with `num_parts() > 1`, not a separate variant: the filename
/// `kind` letter is the same (`l`) either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Index,
    Dir,
    Small,
    Medium,
    Large,
    ContentSplitLarge,
}

impl ArchiveKind {
    /// Filename `kind` letter per spec §6.
    pub fn letter(self) -> char {
        match self {
            ArchiveKind::Index => 'z',
            ArchiveKind::Dir => 'y',
            ArchiveKind::Small => 's',
            ArchiveKind::Medium => 'm',
            ArchiveKind::Large => 'l',
            ArchiveKind::ContentSplitLarge => 'p',
        }
    }

    /// Filename extension: `gz` only for the index, `tar` otherwise.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Index => "gz",
            _ => "tar",
        }
    }
}

/// A deterministic, on-demand tar byte stream grouping a subset of a
/// collection dir's entries (spec §3, §4.7).
#[derive(Debug, Clone)]
pub struct Archive {
    pub id: ArchiveId,
    pub kind: ArchiveKind,
    /// The collection dir this archive belongs to.
    pub collection_dir: EntryId,
    /// Members in storage (= tar) order.
    pub members: Vec<EntryId>,
    pub total_size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    /// 256-bit (32-byte) content fingerprint, SHA-256 over member
    /// meta-hashes in storage order (§4.8).
    pub fingerprint: [u8; 32],
    /// Exact byte boundaries of each part; `tar_split_size`-bounded.
    pub part_sizes: Vec<u64>,
}

impl Archive {
    pub fn num_parts(&self) -> usize {
        self.part_sizes.len().max(1)
    }

    pub fn size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self, part: usize) -> u64 {
        if self.part_sizes.is_empty() {
            self.total_size
        } else {
            self.part_sizes[part]
        }
    }
}
