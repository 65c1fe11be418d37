//! C3: recursive source-tree scanner (spec §4.3).
//!
//! Walks via `cap_std_ext::dirext::CapStdExtDirExt::walk` over a
//! capability-rooted `Dir` rather than raw `std::fs` calls, so a scan can
//! never escape `root` through a `..` component or a symlink. Grounded on
//! the `Scanner` in `marcoh00-chunkah/src/scan.rs`, generalized from
//! "build a `FileMap` for one OCI layer" to "build the full entry table a
//! backup run needs".

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::MetadataExt;
use cap_std_ext::cap_std::fs_utf8::Dir;
use cap_std_ext::dirext::{CapStdExtDirExt, WalkConfiguration};
use globset::Glob;

use crate::error::{Error, Result};
use crate::model::{Entry, EntryId, FileKind, FileStat, LinkKind};
use crate::path::{Interner, PathId};

/// One ordered include/exclude rule. The *last* rule whose glob matches a
/// candidate path wins (§4.3); default is include.
pub struct GlobRule {
    pub glob: Glob,
    pub include: bool,
}

#[derive(Default)]
pub struct ScanOptions {
    /// Ordered include/exclude rules, evaluated last-match-wins.
    pub rules: Vec<GlobRule>,
    /// Entries whose relative path matches any of these are flagged
    /// `should_content_split` (§3, §4.3).
    pub content_split_globs: Vec<Glob>,
    /// If unset (the default) a future-dated file fails the whole scan
    /// (§4.3, §7). The original's `--relax-time-checks` escape hatch
    /// (`original_source/src/backup.cc`).
    pub relax_time_checks: bool,
}

/// Result of one scan: every entry, plus a depth-first visiting order for
/// the bottom-up passes that follow (§4.3).
pub struct ScanResult {
    pub entries: Vec<Entry>,
    /// Depth-first order (deepest first) over indices into `entries`.
    pub depth_first_order: Vec<EntryId>,
    pub root_entry: EntryId,
}

impl ScanResult {
    pub fn directories(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_directory())
    }
}

fn glob_matches(glob: &Glob, rel: &str) -> bool {
    glob.compile_matcher().is_match(rel)
}

fn is_included(rules: &[GlobRule], rel: &str) -> bool {
    let mut included = true;
    for rule in rules {
        if glob_matches(&rule.glob, rel) {
            included = rule.include;
        }
    }
    included
}

fn should_content_split(globs: &[Glob], rel: &str) -> bool {
    globs.iter().any(|g| glob_matches(g, rel))
}

/// Classify from the raw `st_mode` bits rather than trusting a `FileType`
/// wrapper to expose fifo/char/block predicates, since only dir/file/
/// symlink are guaranteed across `cap_std`'s two `Dir` flavors.
fn classify(mode: u32) -> Option<FileKind> {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => Some(FileKind::Directory),
        m if m == libc::S_IFREG as u32 => Some(FileKind::Regular),
        m if m == libc::S_IFLNK as u32 => Some(FileKind::Symlink),
        m if m == libc::S_IFIFO as u32 => Some(FileKind::Fifo),
        m if m == libc::S_IFCHR as u32 => Some(FileKind::CharDevice),
        m if m == libc::S_IFBLK as u32 => Some(FileKind::BlockDevice),
        _ => None, // socket, or anything else unsupported (§4.3 step 1)
    }
}

fn stat_of(meta: &cap_std_ext::cap_std::fs::Metadata, kind: FileKind) -> FileStat {
    FileStat {
        kind,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
        rdev: meta.rdev(),
        mtime_sec: meta.mtime(),
        mtime_nsec: meta.mtime_nsec() as u32,
        ino: meta.ino(),
        nlink: meta.nlink(),
    }
}

/// FNV-1a 32-bit: simple, deterministic, and stable across runs/platforms,
/// which is the only property the bucket assignment (§4.6) requires of it.
/// Also used by `collect` to recompute the hash once the final,
/// collection-dir-relative tar path is known.
pub(crate) fn tarpath_hash(rel: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in rel.as_bytes() {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Every directory that directly contains a file literally named
/// `.beak`, found by a first pass over the whole tree (§4.3 step 2): the
/// marker directory's own entry is kept, but none of its children are.
fn find_beak_markers(root: &Dir) -> Result<HashSet<Utf8PathBuf>> {
    let mut blocked = HashSet::new();
    let config = WalkConfiguration::default().sort_by_file_name();
    root.walk(&config, |component| -> Result<ControlFlow<()>> {
        if component.filename == ".beak" {
            let parent = component.path.parent().map(|p| p.to_owned()).unwrap_or_default();
            blocked.insert(parent);
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(blocked)
}

fn is_blocked(path: &Utf8Path, blocked: &HashSet<Utf8PathBuf>) -> bool {
    let mut cur = Some(path);
    while let Some(p) = cur {
        if blocked.contains(p) {
            return true;
        }
        cur = p.parent();
    }
    false
}

/// Scan `root` into a [`ScanResult`]. `root` is a capability-rooted
/// directory already opened by the caller; it becomes path depth 1 (the
/// interner's root).
pub fn scan(interner: &mut Interner, root: &Dir, opts: &ScanOptions) -> Result<ScanResult> {
    let scan_start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_secs() as i64;

    let blocked = find_beak_markers(root)?;

    let mut entries: Vec<Entry> = Vec::new();
    let root_id = interner.root();

    let root_meta = root.dir_metadata().map_err(|e| Error::UnreadableSource {
        path: Utf8PathBuf::new(),
        source: e,
    })?;
    let root_kind = classify(root_meta.mode()).ok_or_else(|| Error::UnsupportedSocket {
        path: Utf8PathBuf::new(),
    })?;
    let root_entry_id = push_entry(&mut entries, root_id, None, stat_of(&root_meta, root_kind), "");

    let mut path_to_entry: HashMap<Utf8PathBuf, EntryId> = HashMap::new();
    path_to_entry.insert(Utf8PathBuf::new(), root_entry_id);

    let config = WalkConfiguration::default().sort_by_file_name();
    root.walk(&config, |component| -> Result<ControlFlow<()>> {
        let path = component.path;

        if is_blocked(path, &blocked) {
            return Ok(ControlFlow::Continue(()));
        }

        let parent_path = path.parent().map(|p| p.to_owned()).unwrap_or_default();
        let parent_entry = *path_to_entry
            .get(&parent_path)
            .expect("a directory's own component is visited before its children");

        let meta = component
            .dir
            .symlink_metadata(component.filename)
            .map_err(|e| Error::UnreadableSource { path: path.to_owned(), source: e })?;

        let Some(kind) = classify(meta.mode()) else {
            return Ok(ControlFlow::Continue(())); // socket: silently skip (§4.3 step 1)
        };

        let child_id = interner.append_relative(root_id, path.as_str());
        let rel = interner
            .relative_to(child_id, root_id)
            .expect("child was just interned under root");

        if !is_included(&opts.rules, &rel) {
            if kind == FileKind::Directory {
                // An excluded directory still needs a placeholder so its
                // (potentially included) descendants can resolve a parent;
                // record it without pushing an Entry for it.
                path_to_entry.insert(path.to_owned(), parent_entry);
            }
            return Ok(ControlFlow::Continue(()));
        }

        let stat = stat_of(&meta, kind);
        if stat.mtime_sec > scan_start && !opts.relax_time_checks {
            return Err(Error::FutureDatedFile { path: path.to_owned() });
        }

        let entry_id = push_entry(&mut entries, child_id, Some(parent_entry), stat, &rel);
        entries[entry_id].should_content_split = should_content_split(&opts.content_split_globs, &rel);

        if kind == FileKind::Symlink {
            let target = component
                .dir
                .read_link(component.filename)
                .map_err(|e| Error::UnreadableSource { path: path.to_owned(), source: e })?;
            entries[entry_id].link_kind = LinkKind::Symbolic;
            entries[entry_id].symlink_target = Some(target.to_string());
        }

        if kind == FileKind::Directory {
            path_to_entry.insert(path.to_owned(), entry_id);
        }

        Ok(ControlFlow::Continue(()))
    })?;

    let depth_first_order = depth_first_order(interner, &entries);

    Ok(ScanResult {
        entries,
        depth_first_order,
        root_entry: root_entry_id,
    })
}

fn push_entry(
    entries: &mut Vec<Entry>,
    source_path: PathId,
    parent: Option<EntryId>,
    stat: FileStat,
    rel: &str,
) -> EntryId {
    let id = entries.len();
    entries.push(Entry {
        id,
        source_path,
        tar_path: None,
        stat,
        link_kind: LinkKind::None,
        symlink_target: None,
        hardlink_canonical: None,
        tarpath_hash: tarpath_hash(rel),
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
    id
}

fn depth_first_order(interner: &Interner, entries: &[Entry]) -> Vec<EntryId> {
    let mut order: Vec<EntryId> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| interner.depth_first_cmp(entries[a].source_path, entries[b].source_path));
    order
}

/// String-keyed view of the scan for diagnostics and tests; the engine
/// itself works off `ScanResult::entries` directly.
pub fn to_path_map<'a>(interner: &Interner, result: &'a ScanResult) -> BTreeMap<String, &'a Entry> {
    result
        .entries
        .iter()
        .map(|e| (interner.to_string(e.source_path), e))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std::ambient_authority;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn scan_tmp(
        setup: impl FnOnce(&Dir),
    ) -> (tempfile::TempDir, Dir, Interner, ScanResult) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        setup(&root);
        let mut interner = Interner::new();
        let result = scan(&mut interner, &root, &ScanOptions::default()).unwrap();
        (tmp, root, interner, result)
    }

    #[test]
    fn scans_nested_structure() {
        let (_tmp, _root, interner, result) = scan_tmp(|root| {
            root.create_dir_all("a/b").unwrap();
            root.write("a/b/file", "hi").unwrap();
        });
        let map = to_path_map(&interner, &result);
        assert!(map.keys().any(|k| k.ends_with("/a/b/file")));
    }

    #[test]
    fn skips_dot_beak_subtrees() {
        let (_tmp, _root, interner, result) = scan_tmp(|root| {
            root.create_dir("skip").unwrap();
            root.write("skip/.beak", "").unwrap();
            root.write("skip/file", "x").unwrap();
            root.write("kept", "y").unwrap();
        });
        let map = to_path_map(&interner, &result);
        assert!(!map.keys().any(|k| k.ends_with("skip/file")));
        assert!(map.keys().any(|k| k.ends_with("/kept")));
    }

    #[test]
    fn does_not_follow_symlinks() {
        let (_tmp, _root, interner, result) = scan_tmp(|root| {
            root.create_dir("real").unwrap();
            root.write("real/file", "x").unwrap();
            root.symlink("real", "link").unwrap();
        });
        let map = to_path_map(&interner, &result);
        let link_entry = map
            .values()
            .find(|e| interner.name(e.source_path) == "link")
            .unwrap();
        assert_eq!(link_entry.link_kind, LinkKind::Symbolic);
    }

    fn set_mtime_future(path: &std::path::Path, secs_from_now: i64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let target = now + secs_from_now;
        let cpath = CString::new(path.as_os_str().as_bytes()).unwrap();
        let spec = libc::timespec {
            tv_sec: target as libc::time_t,
            tv_nsec: 0,
        };
        let times = [spec, spec];
        unsafe {
            libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0);
        }
    }

    #[test]
    fn future_dated_file_fails_scan_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("future");
        std::fs::write(&path, "x").unwrap();
        set_mtime_future(&path, 3600);

        let mut interner = Interner::new();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let err = scan(&mut interner, &root, &ScanOptions::default());
        assert!(matches!(err, Err(Error::FutureDatedFile { .. })));
    }

    #[test]
    fn relax_time_checks_allows_future_dated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("future");
        std::fs::write(&path, "x").unwrap();
        set_mtime_future(&path, 3600);

        let mut interner = Interner::new();
        let root = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        let opts = ScanOptions {
            relax_time_checks: true,
            ..Default::default()
        };
        let result = scan(&mut interner, &root, &opts).unwrap();
        assert!(result.entries.len() >= 2);
    }
}
