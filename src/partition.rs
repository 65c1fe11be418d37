//! C6: bucket/partitioner (spec §4.6).
//!
//! Grounded on the bucket-count-from-size-sum idea in
//! `pack_components`/`calculate_packing` (`marcoh00-chunkah/src/cmd_build.rs`):
//! round the number of buckets up to the nearest power of two that keeps
//! each bucket close to the target size, rather than picking an exact
//! bucket count from the byte sum directly.

use std::collections::HashMap;

use crate::model::{Archive, ArchiveId, ArchiveKind, Entry, EntryId, FileKind, LinkKind};

pub struct PartitionOptions {
    /// Target archive size S (spec §4.6 default 10 MiB).
    pub target_size: u64,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            target_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Small,
    Medium,
    Large,
}

fn classify(blocked_size: u64, target: u64) -> SizeClass {
    let small_threshold = target / 100;
    if blocked_size < small_threshold {
        SizeClass::Small
    } else if blocked_size < target {
        SizeClass::Medium
    } else {
        SizeClass::Large
    }
}

/// Smallest `k` such that `target * 2^k >= sum`, i.e. the number of
/// power-of-2 buckets needed to keep each bucket under roughly `target`.
fn num_buckets_for_sum(sum: u64, target: u64) -> u64 {
    if sum == 0 {
        return 1;
    }
    let mut buckets: u64 = 1;
    while target.saturating_mul(buckets) < sum {
        buckets *= 2;
    }
    buckets
}

/// Partition one collection dir's entries into archives. `entries` is the
/// full arena; `members` is the collection dir's `entries` list (§4.5's
/// attach pass); `collection_dir` is that collection dir's own entry id
/// (members are attached *to* it, not necessarily direct children of it,
/// so it cannot be inferred from `members[0].parent`). Appends newly
/// built archives to `archives` and returns their ids, and stamps
/// `archive`/`archive_offset` on every entry assigned to one.
pub fn partition_collection_dir(
    entries: &mut [Entry],
    members: &[EntryId],
    collection_dir: EntryId,
    opts: &PartitionOptions,
    archives: &mut Vec<Archive>,
) -> Vec<ArchiveId> {
    let mut dirs: Vec<EntryId> = Vec::new();
    let mut hard_links: Vec<EntryId> = Vec::new();
    let mut small: Vec<EntryId> = Vec::new();
    let mut medium: Vec<EntryId> = Vec::new();
    let mut large: Vec<EntryId> = Vec::new();
    let mut content_split_large: Vec<EntryId> = Vec::new();

    for &id in members {
        let e = &entries[id];
        if e.stat.kind == FileKind::Directory {
            dirs.push(id);
            continue;
        }
        if e.link_kind == LinkKind::Hard {
            hard_links.push(id);
            continue;
        }
        match classify(e.blocked_size, opts.target_size) {
            SizeClass::Small => small.push(id),
            SizeClass::Medium => medium.push(id),
            SizeClass::Large => {
                if e.should_content_split {
                    content_split_large.push(id);
                } else {
                    large.push(id);
                }
            }
        }
    }

    let small_sum: u64 = small.iter().map(|&id| entries[id].blocked_size).sum();
    let medium_sum: u64 = medium.iter().map(|&id| entries[id].blocked_size).sum();

    // Merge small+medium into small if either sum alone would leave an
    // undersized bucket (§4.6: "one bucket is better than two undersized
    // ones").
    let (small, medium, small_sum) = if small_sum < opts.target_size || medium_sum < opts.target_size
    {
        let mut merged = small;
        merged.extend(medium);
        (merged, Vec::new(), small_sum + medium_sum)
    } else {
        (small, medium, small_sum)
    };
    let medium_sum: u64 = medium.iter().map(|&id| entries[id].blocked_size).sum();

    let mut out = Vec::new();

    if !dirs.is_empty() || !hard_links.is_empty() {
        // Hard links go at the front so a naive tar-extract restores
        // targets before the links that point at them.
        let mut dir_members = hard_links;
        dir_members.extend(dirs);
        out.push(make_single_archive(
            entries,
            archives,
            ArchiveKind::Dir,
            collection_dir,
            dir_members,
        ));
    }

    if !small.is_empty() {
        let num = num_buckets_for_sum(small_sum, opts.target_size);
        out.extend(bucket_and_build(
            entries,
            archives,
            ArchiveKind::Small,
            collection_dir,
            small,
            num,
        ));
    }

    if !medium.is_empty() {
        let num = num_buckets_for_sum(medium_sum, opts.target_size);
        out.extend(bucket_and_build(
            entries,
            archives,
            ArchiveKind::Medium,
            collection_dir,
            medium,
            num,
        ));
    }

    for id in large {
        out.push(make_single_archive(
            entries,
            archives,
            ArchiveKind::Large,
            collection_dir,
            vec![id],
        ));
    }

    for id in content_split_large {
        out.push(make_single_archive(
            entries,
            archives,
            ArchiveKind::ContentSplitLarge,
            collection_dir,
            vec![id],
        ));
    }

    out
}

fn bucket_and_build(
    entries: &mut [Entry],
    archives: &mut Vec<Archive>,
    kind: ArchiveKind,
    collection_dir: EntryId,
    ids: Vec<EntryId>,
    num_buckets: u64,
) -> Vec<ArchiveId> {
    let mut buckets: HashMap<u64, Vec<EntryId>> = HashMap::new();
    for id in ids {
        let slot = entries[id].tarpath_hash as u64 % num_buckets;
        buckets.entry(slot).or_default().push(id);
    }

    let mut slots: Vec<u64> = buckets.keys().copied().collect();
    slots.sort_unstable();

    slots
        .into_iter()
        .map(|slot| {
            let members = buckets.remove(&slot).unwrap();
            make_single_archive(entries, archives, kind, collection_dir, members)
        })
        .collect()
}

fn make_single_archive(
    entries: &mut [Entry],
    archives: &mut Vec<Archive>,
    kind: ArchiveKind,
    collection_dir: EntryId,
    members: Vec<EntryId>,
) -> ArchiveId {
    let id = archives.len();
    let mut total_size = 0u64;
    let mut mtime_sec = 0i64;
    let mut mtime_nsec = 0u32;

    for &member in members.iter() {
        let e = &mut entries[member];
        e.archive = Some(id);
        e.archive_offset = total_size;
        total_size += e.blocked_size;
        if e.stat.mtime_sec > mtime_sec
            || (e.stat.mtime_sec == mtime_sec && e.stat.mtime_nsec > mtime_nsec)
        {
            mtime_sec = e.stat.mtime_sec;
            mtime_nsec = e.stat.mtime_nsec;
        }
    }
    total_size += 1024; // two trailing zero blocks (§4.7)

    archives.push(Archive {
        id,
        kind,
        collection_dir,
        members,
        total_size,
        mtime_sec,
        mtime_nsec,
        fingerprint: [0u8; 32], // filled in by the index writer (§4.8)
        part_sizes: Vec::new(),
    });
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileStat;

    fn entry(id: EntryId, kind: FileKind, link: LinkKind, blocked: u64, hash: u32) -> Entry {
        Entry {
            id,
            source_path: crate::path::Interner::new().root(),
            tar_path: Some(format!("f{id}")),
            stat: FileStat {
                kind,
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: blocked.saturating_sub(512),
                rdev: 0,
                mtime_sec: 0,
                mtime_nsec: 0,
                ino: id as u64 + 1,
                nlink: 1,
            },
            link_kind: link,
            symlink_target: None,
            hardlink_canonical: None,
            tarpath_hash: hash,
            blocked_size: blocked,
            header_size: 512,
            should_content_split: false,
            parent: None,
            archive: None,
            archive_offset: 0,
            is_collection: false,
            children_size: 0,
            entries: Vec::new(),
        }
    }

    #[test]
    fn small_files_are_bucketed_by_tarpath_hash() {
        let opts = PartitionOptions { target_size: 1024 };
        let mut entries = vec![
            entry(0, FileKind::Regular, LinkKind::None, 512, 1),
            entry(1, FileKind::Regular, LinkKind::None, 512, 2),
        ];
        let members = vec![0, 1];
        let mut archives = Vec::new();
        let ids = partition_collection_dir(&mut entries, &members, 0, &opts, &mut archives);
        assert!(!ids.is_empty());
        assert!(entries[0].archive.is_some());
        assert!(entries[1].archive.is_some());
    }

    #[test]
    fn large_files_each_get_their_own_archive() {
        let opts = PartitionOptions::default();
        let mut entries = vec![
            entry(0, FileKind::Regular, LinkKind::None, 20 * 1024 * 1024, 1),
            entry(1, FileKind::Regular, LinkKind::None, 20 * 1024 * 1024, 2),
        ];
        let members = vec![0, 1];
        let mut archives = Vec::new();
        let ids = partition_collection_dir(&mut entries, &members, 0, &opts, &mut archives);
        assert_eq!(ids.len(), 2);
        assert_ne!(entries[0].archive, entries[1].archive);
    }

    #[test]
    fn directories_and_hard_links_share_the_dir_archive() {
        let opts = PartitionOptions::default();
        let mut entries = vec![
            entry(0, FileKind::Directory, LinkKind::None, 512, 0),
            entry(1, FileKind::Regular, LinkKind::Hard, 512, 0),
        ];
        let members = vec![0, 1];
        let mut archives = Vec::new();
        let ids = partition_collection_dir(&mut entries, &members, 0, &opts, &mut archives);
        assert_eq!(ids.len(), 1);
        assert_eq!(archives[0].kind, ArchiveKind::Dir);
        // hard link placed before the directory
        assert_eq!(archives[0].members, vec![1, 0]);
    }

    #[test]
    fn small_plus_medium_merge_when_either_sum_is_undersized() {
        let opts = PartitionOptions { target_size: 10_000 };
        // one small file (< 100 bytes), one medium file (between 100 and 10000)
        let mut entries = vec![
            entry(0, FileKind::Regular, LinkKind::None, 50, 1),
            entry(1, FileKind::Regular, LinkKind::None, 5_000, 2),
        ];
        let members = vec![0, 1];
        let mut archives = Vec::new();
        let ids = partition_collection_dir(&mut entries, &members, 0, &opts, &mut archives);
        // both sums are below target, so they merge into one small archive
        assert_eq!(ids.len(), 1);
        assert_eq!(archives[0].kind, ArchiveKind::Small);
    }
}
