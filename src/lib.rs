//! `beak`: a deduplication-friendly backup engine. A source tree is
//! scanned once, partitioned into deterministic virtual tar archives
//! grouped by "collection dir", and described by a gzip-compressed index
//! (spec §2-§4). The archives are never written to disk as a blob ahead
//! of time — `vfs::VirtualFs` materializes their bytes on demand from the
//! in-memory plan, the way `archive::ArchiveReader` streams a range of a
//! tar on read.
//!
//! Components, grounded per `DESIGN.md`:
//! C1 [`path`], C2 [`tarcodec`], C3 [`scan`], C4 [`hardlink`],
//! C5 [`collect`], C6 [`partition`], C7 [`archive`], C8/C9 [`index`],
//! C10 [`vfs`], C11 [`restore`].

pub mod archive;
pub mod collect;
pub mod error;
pub mod hardlink;
pub mod index;
pub mod model;
pub mod partition;
pub mod path;
pub mod restore;
pub mod scan;
pub mod tarcodec;
pub mod vfs;

use crate::error::Result;
use crate::model::{Archive, ArchiveId, ArchiveKind, EntryId};
use crate::path::Interner;

/// Every knob a `backup` run exposes, gathering the options of the
/// component stages it drives (§4.3, §4.5, §4.6, §4.7).
pub struct BackupOptions {
    pub scan: scan::ScanOptions,
    pub collect: collect::CollectOptions,
    pub partition: partition::PartitionOptions,
    pub index: index::writer::WriteOptions,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            scan: scan::ScanOptions::default(),
            collect: collect::CollectOptions::default(),
            partition: partition::PartitionOptions::default(),
            index: index::writer::WriteOptions { config_line: String::new() },
        }
    }
}

/// One backup run's complete output: the in-memory plan
/// ([`vfs::Snapshot`]) plus, per collection dir, that collection's own
/// gzip-compressed index bytes (§4.8 — every collection dir gets its own
/// index, per its own `entries` list).
pub struct BackupResult {
    pub snapshot: vfs::Snapshot,
    pub hard_link_stats: hardlink::HardLinkStats,
    pub indexes: Vec<(EntryId, Vec<u8>)>,
}

/// Run the full pipeline (§2): scan, resolve hard links, select
/// collection dirs, partition each one into archives, then build and
/// compress each collection dir's index.
///
/// This is the library-level equivalent of
/// `cmd_build::run`, generalized from "build one OCI layer set" to "build
/// one backup run's archive set plus index".
pub fn backup(root: &cap_std_ext::cap_std::fs_utf8::Dir, opts: &BackupOptions) -> Result<BackupResult> {
    let mut interner = Interner::new();
    let scan_result = scan::scan(&mut interner, root, &opts.scan)?;
    let mut entries = scan_result.entries;

    let hard_link_stats = hardlink::resolve_hard_links(&interner, &mut entries, &scan_result.depth_first_order);

    collect::select_collection_dirs(
        &interner,
        &mut entries,
        &scan_result.depth_first_order,
        scan_result.root_entry,
        &opts.collect,
    )?;

    let collection_dirs: Vec<EntryId> = scan_result
        .depth_first_order
        .iter()
        .copied()
        .filter(|&id| entries[id].is_collection)
        .collect();

    let mut archives: Vec<Archive> = Vec::new();
    let mut archive_ids_by_dir: Vec<(EntryId, Vec<ArchiveId>)> = Vec::new();
    for &dir_id in &collection_dirs {
        let members = entries[dir_id].entries.clone();
        let ids = partition::partition_collection_dir(&mut entries, &members, dir_id, &opts.partition, &mut archives);
        archive_ids_by_dir.push((dir_id, ids));
    }

    // Fingerprints depend on the final tar path / archive assignment, so
    // they're filled in once partitioning for every collection dir has
    // finished (§4.8).
    for archive in &mut archives {
        archive.fingerprint = index::writer::archive_fingerprint(&archive.members, &entries);
    }

    let split_size = archive::default_split_size(opts.partition.target_size);
    for archive in &mut archives {
        archive.part_sizes = archive::compute_part_sizes(archive.total_size, split_size);
    }

    let mut indexes = Vec::new();
    let mut index_bytes: std::collections::HashMap<EntryId, Vec<u8>> = std::collections::HashMap::new();
    for (dir_id, archive_ids) in &archive_ids_by_dir {
        let members = entries[*dir_id].entries.clone();
        let dir_archives: Vec<Archive> = archive_ids.iter().map(|&id| archives[id].clone()).collect();
        let text = index::writer::build_index_text(&entries, &members, &dir_archives, &interner, &opts.index);
        let compressed = index::writer::compress(&text)?;

        // The index file is a real archive in its own right (§4.8/§4.10):
        // give it a content-addressed name and its own fingerprint so it
        // shows up in `readdir`/`getattr` like any other archive.
        let entry_text = index::writer::entries_text(&entries, &members, &dir_archives, &interner);
        let fingerprint = index::writer::index_fingerprint(&dir_archives, &entry_text);
        let mtime_sec = dir_archives.iter().map(|a| a.mtime_sec).max().unwrap_or(0);
        let mtime_nsec = dir_archives
            .iter()
            .filter(|a| a.mtime_sec == mtime_sec)
            .map(|a| a.mtime_nsec)
            .max()
            .unwrap_or(0);
        let index_archive = Archive {
            id: archives.len(),
            kind: ArchiveKind::Index,
            collection_dir: *dir_id,
            members: Vec::new(),
            total_size: compressed.len() as u64,
            mtime_sec,
            mtime_nsec,
            fingerprint,
            part_sizes: Vec::new(),
        };
        archives.push(index_archive);

        index_bytes.insert(*dir_id, compressed.clone());
        indexes.push((*dir_id, compressed));
    }

    let snapshot = vfs::Snapshot {
        entries,
        archives,
        interner,
        index_bytes,
        header_style: opts.collect.header_style,
    };

    Ok(BackupResult { snapshot, hard_link_stats, indexes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std::ambient_authority;
    use cap_std_ext::cap_std::fs_utf8::Dir;
    use std::fs;

    #[test]
    fn backup_a_small_tree_produces_one_index_per_collection_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let sub = dir.path().join("project");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("b.txt"), b"world").unwrap();

        let root = Dir::open_ambient_dir(dir.path(), ambient_authority()).unwrap();
        let result = backup(&root, &BackupOptions::default()).unwrap();

        assert!(!result.snapshot.archives.is_empty());
        assert!(!result.indexes.is_empty());
    }
}
