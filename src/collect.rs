//! C5: collection-dir selector (spec §4.5).
//!
//! Grounded on the two-pass component-claiming logic
//! (`marcoh00-chunkah/src/components/mod.rs`: load all claimants, then
//! resolve effective ownership per path) generalized from "which component
//! claims this file" to "which directory roots this file's archives".
//!
//! Resolved ambiguity (recorded in `DESIGN.md`): §4.5's final
//! paragraph attaches only *non*-collection-dir entries to their nearest
//! collection-dir ancestor, leaving open how a nested collection dir's own
//! metadata (permissions, mtime) is restored, since it never becomes a tar
//! member anywhere. This implementation attaches *every* non-root entry —
//! including collection dirs — to its nearest *strict* collection-dir
//! ancestor. A nested collection dir therefore shows up twice: once as an
//! ordinary directory record inside its parent collection's `dir` archive
//! (carrying its restorable metadata), and once more as the root of its
//! own independent archive set. This keeps restore (§4.11) uniform — every
//! entry has exactly one index record with real metadata — without
//! changing the archive-locality invariants P1/P2.

use std::collections::{HashMap, HashSet};

use globset::Glob;

use crate::error::{Error, Result};
use crate::model::{Entry, EntryId, FileKind};
use crate::path::Interner;
use crate::tarcodec::{self, HeaderStyle};

pub struct CollectOptions {
    /// §4.5(b): every directory at this depth is forced to be its own
    /// collection. Default 2 (root's immediate children).
    pub forced_depth: u32,
    /// §4.5(c): directories matching any of these globs are forced
    /// collections regardless of size.
    pub trigger_globs: Vec<Glob>,
    /// §4.5(d): a directory whose accumulated descendant size exceeds this
    /// becomes a collection. Default is `2 * target_archive_size`.
    pub trigger_size: u64,
    pub header_style: HeaderStyle,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            forced_depth: 2,
            trigger_globs: Vec::new(),
            trigger_size: 2 * 10 * 1024 * 1024,
            header_style: HeaderStyle::Simple,
        }
    }
}

fn provisional_header_size(interner: &Interner, e: &Entry) -> u64 {
    let path_str = interner.to_string(e.source_path);
    let link = e.symlink_target.as_deref();
    tarcodec::calculate_header_size(&path_str, link)
}

fn round_up_512(n: u64) -> u64 {
    n.div_ceil(512) * 512
}

/// Run both passes of §4.5, then prune/attach as described there.
pub fn select_collection_dirs(
    interner: &Interner,
    entries: &mut [Entry],
    depth_first_order: &[EntryId],
    root_entry: EntryId,
    opts: &CollectOptions,
) -> Result<()> {
    // --- Pass 1: size accumulation ---
    // A provisional header size (based on the full source path) over-
    // estimates the eventual tar-relative header only in the boundary
    // case where a long-name record is needed for the absolute path but
    // not the relative one; it never under-estimates, so the trigger_size
    // comparison in pass 2 stays conservative.
    for &id in depth_first_order {
        let header_size = provisional_header_size(interner, &entries[id]);
        let payload = entries[id].payload_size();
        let blocked = round_up_512(header_size + payload);
        entries[id].header_size = header_size;
        entries[id].blocked_size = blocked;

        let mut ancestor = entries[id].parent;
        while let Some(a) = ancestor {
            entries[a].children_size += blocked;
            ancestor = entries[a].parent;
        }
    }

    // --- Pass 2: mark, deepest directories first ---
    for &id in depth_first_order {
        if entries[id].stat.kind != FileKind::Directory {
            continue;
        }
        let is_root = id == root_entry;
        let at_forced_depth = interner.depth(entries[id].source_path) == opts.forced_depth;
        let matches_trigger = {
            let path_str = interner.to_string(entries[id].source_path);
            opts.trigger_globs
                .iter()
                .any(|g| g.compile_matcher().is_match(&path_str))
        };
        let oversized = entries[id].children_size > opts.trigger_size;

        if is_root || at_forced_depth || matches_trigger || oversized {
            entries[id].is_collection = true;
            let size = entries[id].children_size;
            let mut ancestor = entries[id].parent;
            while let Some(a) = ancestor {
                entries[a].children_size = entries[a].children_size.saturating_sub(size);
                ancestor = entries[a].parent;
            }
        }
    }

    // --- Retained directories: collection dirs + their ancestors ---
    let mut retained: HashSet<EntryId> = HashSet::new();
    for &id in depth_first_order {
        if entries[id].is_collection {
            let mut cur = Some(id);
            while let Some(c) = cur {
                if !retained.insert(c) {
                    break; // already walked this ancestor chain
                }
                cur = entries[c].parent;
            }
        }
    }

    check_case_insensitive_collisions(interner, entries, &retained)?;

    // --- Attach every non-root entry to its nearest strict collection-dir
    //     ancestor, and assign its tar path relative to that ancestor. ---
    for &id in depth_first_order {
        if id == root_entry {
            continue;
        }
        let mut cur = entries[id]
            .parent
            .expect("every non-root entry has a parent");
        while !entries[cur].is_collection {
            cur = entries[cur]
                .parent
                .expect("walking up from any entry must reach the collection root");
        }
        let tar_path_str = interner
            .relative_to(entries[id].source_path, entries[cur].source_path)
            .expect("cur is an ancestor of id by construction");
        entries[cur].entries.push(id);

        // Recompute the authoritative header/blocked size now that the
        // real (shorter) tar path is known.
        let link = entries[id].symlink_target.clone();
        let header_size = tarcodec::calculate_header_size(&tar_path_str, link.as_deref());
        let payload = entries[id].payload_size();
        entries[id].header_size = header_size;
        entries[id].blocked_size = round_up_512(header_size + payload);
        // Bucket assignment (§4.6) hashes the final tar path, not the
        // scan-time source-relative path scan() used as a placeholder.
        entries[id].tarpath_hash = crate::scan::tarpath_hash(&tar_path_str);
        entries[id].tar_path = Some(tar_path_str);
    }

    Ok(())
}

fn check_case_insensitive_collisions(
    interner: &Interner,
    entries: &[Entry],
    retained: &HashSet<EntryId>,
) -> Result<()> {
    let mut seen: HashMap<String, EntryId> = HashMap::new();
    let mut ids: Vec<&EntryId> = retained.iter().collect();
    ids.sort();
    for &id in ids {
        let path = interner.to_string(entries[*id].source_path);
        let key = path.to_lowercase();
        if let Some(&other) = seen.get(&key) {
            let a = interner.to_string(entries[other].source_path);
            return Err(Error::CollectionDirCaseCollision {
                a: a.into(),
                b: path.into(),
            });
        }
        seen.insert(key, *id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileStat, LinkKind};
    use crate::path::{Interner, PathId};

    fn mk(interner: &mut Interner, entries: &mut Vec<Entry>, parent: Option<EntryId>, path: PathId, kind: FileKind, size: u64) -> EntryId {
        let id = entries.len();
        entries.push(Entry {
            id,
            source_path: path,
            tar_path: None,
            stat: FileStat {
                kind,
                mode: if kind == FileKind::Directory { 0o755 } else { 0o644 },
                uid: 0,
                gid: 0,
                size,
                rdev: 0,
                mtime_sec: 0,
                mtime_nsec: 0,
                ino: id as u64 + 1,
                nlink: 1,
            },
            link_kind: LinkKind::None,
            symlink_target: None,
            hardlink_canonical: None,
            tarpath_hash: 0,
            blocked_size: 0,
            header_size: 0,
            should_content_split: false,
            parent,
            archive: None,
            archive_offset: 0,
            is_collection: false,
            children_size: 0,
            entries: Vec::new(),
        });
        let _ = interner;
        id
    }

    #[test]
    fn root_is_always_a_collection_dir() {
        let mut interner = Interner::new();
        let mut entries = Vec::new();
        let root = mk(&mut interner, &mut entries, None, interner.root(), FileKind::Directory, 0);
        let order = vec![root];
        select_collection_dirs(&interner, &mut entries, &order, root, &CollectOptions::default()).unwrap();
        assert!(entries[root].is_collection);
    }

    #[test]
    fn forced_depth_marks_top_level_dirs() {
        let mut interner = Interner::new();
        let mut entries = Vec::new();
        let root_path = interner.root();
        let root = mk(&mut interner, &mut entries, None, root_path, FileKind::Directory, 0);
        let sub_path = interner.append(root_path, "project");
        let sub = mk(&mut interner, &mut entries, Some(root), sub_path, FileKind::Directory, 0);
        let file_path = interner.append(sub_path, "a.txt");
        let file = mk(&mut interner, &mut entries, Some(sub), file_path, FileKind::Regular, 10);

        let order = vec![file, sub, root]; // deepest first
        select_collection_dirs(&interner, &mut entries, &order, root, &CollectOptions::default()).unwrap();

        assert!(entries[sub].is_collection);
        assert_eq!(entries[sub].entries, vec![file]);
        assert_eq!(entries[file].tar_path.as_deref(), Some("a.txt"));
    }

    #[test]
    fn oversized_directory_becomes_its_own_collection() {
        let mut interner = Interner::new();
        let mut entries = Vec::new();
        let root_path = interner.root();
        let root = mk(&mut interner, &mut entries, None, root_path, FileKind::Directory, 0);
        // depth 2 would normally be forced anyway; use depth 3 to isolate rule (d).
        let lvl1 = interner.append(root_path, "lvl1");
        let lvl1_id = mk(&mut interner, &mut entries, Some(root), lvl1, FileKind::Directory, 0);
        let big_dir = interner.append(lvl1, "big");
        let big_id = mk(&mut interner, &mut entries, Some(lvl1_id), big_dir, FileKind::Directory, 0);
        let big_file = interner.append(big_dir, "payload.bin");
        let big_file_id = mk(&mut interner, &mut entries, Some(big_id), big_file, FileKind::Regular, 100);

        let order = vec![big_file_id, big_id, lvl1_id, root];
        let opts = CollectOptions {
            forced_depth: 1, // disable the depth rule so only (d) applies to `big`
            trigger_size: 50,
            ..Default::default()
        };
        select_collection_dirs(&interner, &mut entries, &order, root, &opts).unwrap();

        assert!(entries[big_id].is_collection);
        assert!(!entries[lvl1_id].is_collection);
    }

    #[test]
    fn case_insensitive_collision_is_rejected() {
        let mut interner = Interner::new();
        let mut entries = Vec::new();
        let root_path = interner.root();
        let root = mk(&mut interner, &mut entries, None, root_path, FileKind::Directory, 0);
        let a_path = interner.append(root_path, "Docs");
        let a = mk(&mut interner, &mut entries, Some(root), a_path, FileKind::Directory, 0);
        let b_path = interner.append(root_path, "docs");
        let b = mk(&mut interner, &mut entries, Some(root), b_path, FileKind::Directory, 0);

        let order = vec![a, b, root];
        let opts = CollectOptions {
            forced_depth: 2,
            ..Default::default()
        };
        let result = select_collection_dirs(&interner, &mut entries, &order, root, &opts);
        assert!(matches!(result, Err(Error::CollectionDirCaseCollision { .. })));
    }
}
