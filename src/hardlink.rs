//! C4: hard-link resolver (spec §4.4).
//!
//! Grounded on the `inode_to_path` bookkeeping in
//! `write_files_to_tar` (`marcoh00-chunkah/src/tar.rs`), generalized from
//! "rewrite on the fly while streaming a tar" to "rewrite the entry graph
//! up front so later passes (partitioning, index writing) see the final
//! shape".
//!
//! The depth-first scan order visits deeper files first, so the first
//! occurrence of a given inode *is* the deepest one — the canonical,
//! content-bearing copy, per the resolved open question (§9).

use std::collections::HashMap;

use crate::model::{Entry, EntryId, FileKind, LinkKind};
use crate::path::Interner;

/// Total bytes saved by degrading duplicate copies to header-only hard
/// link records, summed across every dedup'd entry (§4.4).
pub struct HardLinkStats {
    pub savings_bytes: u64,
    pub canonicalized: usize,
}

/// Rewrite every later occurrence of a multi-linked inode as a hard link
/// pointing at the first (= deepest, thanks to depth-first order)
/// occurrence. `depth_first_order` must be the order `scan` produced.
pub fn resolve_hard_links(
    interner: &Interner,
    entries: &mut [Entry],
    depth_first_order: &[EntryId],
) -> HardLinkStats {
    let mut canonical_by_inode: HashMap<u64, EntryId> = HashMap::new();
    let mut stats = HardLinkStats {
        savings_bytes: 0,
        canonicalized: 0,
    };

    for &id in depth_first_order {
        let (kind, nlink, ino) = {
            let e = &entries[id];
            (e.stat.kind, e.stat.nlink, e.stat.ino)
        };
        if kind == FileKind::Directory || nlink <= 1 {
            continue;
        }

        match canonical_by_inode.get(&ino) {
            None => {
                canonical_by_inode.insert(ino, id);
            }
            Some(&canonical_id) => {
                let path = interner.to_string(entries[id].source_path);
                let header = crate::tarcodec::calculate_header_size(
                    &path,
                    entries[id].symlink_target.as_deref(),
                );
                let full_blocked = round_up_512(header + entries[id].stat.size);
                let header_blocked = round_up_512(header);
                stats.savings_bytes += full_blocked.saturating_sub(header_blocked);
                stats.canonicalized += 1;

                let e = &mut entries[id];
                e.link_kind = LinkKind::Hard;
                e.hardlink_canonical = Some(canonical_id);
                e.symlink_target = None;
            }
        }
    }

    stats
}

fn round_up_512(n: u64) -> u64 {
    n.div_ceil(512) * 512
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileStat;
    use crate::path::Interner;

    fn stat(kind: FileKind, ino: u64, nlink: u64, size: u64) -> crate::model::FileStat {
        FileStat {
            kind,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size,
            rdev: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
            ino,
            nlink,
        }
    }

    fn make_entry(id: EntryId, path: crate::path::PathId, s: FileStat) -> Entry {
        Entry {
            id,
            source_path: path,
            tar_path: None,
            stat: s,
            link_kind: LinkKind::None,
            symlink_target: None,
            hardlink_canonical: None,
            tarpath_hash: 0,
            blocked_size: 1536, // header(512) + 1MiB rounds differently in real life; kept simple here
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
    fn deepest_occurrence_becomes_canonical() {
        let mut interner = Interner::new();
        let deep = interner.append_relative(interner.root(), "x/deep/hard");
        let shallow = interner.append_relative(interner.root(), "x/hard");

        let mut entries = vec![
            make_entry(0, deep, stat(FileKind::Regular, 42, 2, 1_048_576)),
            make_entry(1, shallow, stat(FileKind::Regular, 42, 2, 1_048_576)),
        ];
        // depth-first order puts the deeper path first, as scan() would.
        let order = vec![0, 1];

        let stats = resolve_hard_links(&interner, &mut entries, &order);

        assert_eq!(entries[0].link_kind, LinkKind::None);
        assert_eq!(entries[1].link_kind, LinkKind::Hard);
        assert_eq!(entries[1].hardlink_canonical, Some(0));
        assert_eq!(stats.canonicalized, 1);
        // path "x/hard" is short (header = 512); payload 1 MiB rounds to
        // itself; savings = round_up_512(512 + 1_048_576) - round_up_512(512).
        assert_eq!(stats.savings_bytes, 1_048_576);
    }

    #[test]
    fn single_link_entries_are_left_alone() {
        let mut interner = Interner::new();
        let p = interner.append_relative(interner.root(), "solo");
        let mut entries = vec![make_entry(0, p, stat(FileKind::Regular, 1, 1, 10))];
        let stats = resolve_hard_links(&interner, &mut entries, &[0]);
        assert_eq!(entries[0].link_kind, LinkKind::None);
        assert_eq!(stats.canonicalized, 0);
    }
}
