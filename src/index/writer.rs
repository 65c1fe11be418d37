//! C8: index writer (spec §4.8).
//!
//! Grounded on `tarentry.cc::cookEntry`/`cookColumns` for the column
//! layout and on `mikesmullin-tcow/src/lib.rs` for pairing `sha2` +
//! `hex` digests with a gzip-compressed catalog the way this crate's
//! ambient stack does it (SPEC_FULL.md §1).

use std::io::Write;

use sha2::{Digest, Sha256};

use crate::index::FormatVersion;
use crate::model::{Archive, ArchiveKind, Entry, EntryId, FileKind, LinkKind};
use crate::path::Interner;

pub struct WriteOptions {
    pub config_line: String,
}

fn permission_string(entry: &Entry) -> String {
    let type_char = match entry.stat.kind {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Fifo => 'p',
        FileKind::CharDevice => 'c',
        FileKind::BlockDevice => 'b',
        FileKind::Regular => '-',
    };
    let mode = entry.stat.mode;
    let bits = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    let mut s = String::with_capacity(10);
    s.push(type_char);
    for (mask, ch) in bits {
        s.push(if mode & mask != 0 { ch } else { '-' });
    }
    s
}

/// `tarpath ∥ size ∥ mtime.sec ∥ mtime.nsec`, SHA-256 (§4.8).
pub fn meta_sha256(tar_path: &str, size: u64, mtime_sec: i64, mtime_nsec: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tar_path.as_bytes());
    hasher.update(size.to_le_bytes());
    hasher.update(mtime_sec.to_le_bytes());
    hasher.update(mtime_nsec.to_le_bytes());
    hasher.finalize().into()
}

/// SHA-256 over the concatenated `meta-sha256` of an archive's members in
/// storage order (§4.8): the archive's own content fingerprint.
pub fn archive_fingerprint(members: &[EntryId], entries: &[Entry]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for &id in members {
        let e = &entries[id];
        let tar_path = e.tar_path.as_deref().unwrap_or("");
        hasher.update(meta_sha256(tar_path, e.stat.size, e.stat.mtime_sec, e.stat.mtime_nsec));
    }
    hasher.finalize().into()
}

/// SHA-256 over (all other archives' fingerprints ∥ full entry-column
/// text) (§4.8): the index file's own content fingerprint. `archives`
/// must be the collection dir's *data* archives, not the index archive
/// itself.
pub fn index_fingerprint(archives: &[Archive], entry_column_text: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for archive in archives {
        hasher.update(archive.fingerprint);
    }
    hasher.update(entry_column_text);
    hasher.finalize().into()
}

/// `<kind>01_<sec:12>.<nsec:9>_<size:dec>_<hash:64-hex>_<partnr:hex>.<ext>`
/// (spec §6). `partnr`'s hex width equals the hex width of
/// `num_parts - 1`, so lexicographic sort order matches part order.
fn archive_filename(archive: &Archive, entries: &[Entry], interner: &Interner, part: Option<usize>) -> String {
    let collection = interner.to_string(entries[archive.collection_dir].source_path);
    let prefix = if collection.is_empty() { String::new() } else { format!("{collection}/") };
    let part_nr = part.unwrap_or(0);
    let max_part_nr = archive.num_parts().saturating_sub(1);
    let hex_width = format!("{max_part_nr:x}").len();
    format!(
        "{prefix}{kind}01_{sec:012}.{nsec:09}_{size}_{hash}_{part:0width$x}.{ext}",
        kind = archive.kind.letter(),
        sec = archive.mtime_sec.max(0),
        nsec = archive.mtime_nsec,
        size = archive.total_size,
        hash = hex::encode(archive.fingerprint),
        part = part_nr,
        width = hex_width,
        ext = archive.kind.extension(),
    )
}

fn write_entry_line(out: &mut Vec<u8>, entry: &Entry, entries: &[Entry], interner: &Interner, archives: &[Archive]) {
    out.extend(permission_string(entry).as_bytes());
    out.push(0);

    out.extend(format!("{}/{}", entry.stat.uid, entry.stat.gid).as_bytes());
    out.push(0);

    let size_field = match entry.stat.kind {
        FileKind::Regular => entry.stat.size,
        FileKind::CharDevice | FileKind::BlockDevice => entry.stat.rdev,
        _ => 0,
    };
    out.extend(size_field.to_string().as_bytes());
    out.push(0);

    out.extend(format!("{:012}.{:09}", entry.stat.mtime_sec.max(0), entry.stat.mtime_nsec).as_bytes());
    out.push(0);

    out.extend(entry.tar_path.as_deref().unwrap_or("").as_bytes());
    out.push(0);

    match entry.link_kind {
        LinkKind::Symbolic => {
            out.extend(b" -> ");
            out.extend(entry.symlink_target.as_deref().unwrap_or("").as_bytes());
        }
        LinkKind::Hard => {
            out.extend(b" link to ");
            if let Some(canonical) = entry.hardlink_canonical {
                out.extend(entries[canonical].tar_path.as_deref().unwrap_or("").as_bytes());
            }
        }
        LinkKind::None => {}
    }
    out.push(0);

    if let Some(archive_id) = entry.archive {
        let archive = &archives[archive_id];
        out.extend(archive_filename(archive, entries, interner, None).as_bytes());
    }
    out.push(0);

    out.extend(entry.archive_offset.to_string().as_bytes());
    out.push(0);

    if let Some(archive_id) = entry.archive {
        let archive = &archives[archive_id];
        if archive.num_parts() == 1 {
            out.extend(b"1");
        } else {
            let np = archive.num_parts();
            let header = entry.header_size;
            out.extend(
                format!("{np},{header},{part0},{last}",
                    part0 = archive.part_size(0),
                    last = archive.part_size(np - 1))
                .as_bytes(),
            );
        }
    } else {
        out.extend(b"1");
    }
    out.push(0);

    let meta = meta_sha256(
        entry.tar_path.as_deref().unwrap_or(""),
        entry.stat.size,
        entry.stat.mtime_sec,
        entry.stat.mtime_nsec,
    );
    out.extend(hex::encode(meta).as_bytes());
    out.push(b'\n');
    out.push(0);
}

/// The `#files` section's entry lines only, with no header/footer —
/// reused as-is for the index file's own fingerprint (§4.8).
pub fn entries_text(entries: &[Entry], members: &[EntryId], archives: &[Archive], interner: &Interner) -> Vec<u8> {
    let mut out = Vec::new();
    for &id in members {
        write_entry_line(&mut out, &entries[id], entries, interner, archives);
    }
    out
}

/// Build the uncompressed index text for one collection dir's worth of
/// entries and archives.
pub fn build_index_text(
    entries: &[Entry],
    members: &[EntryId],
    archives: &[Archive],
    interner: &Interner,
    opts: &WriteOptions,
) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend(format!("#beak {}\n", FormatVersion::current().as_str()).as_bytes());
    out.extend(format!("#config {}\n", opts.config_line).as_bytes());

    let total_size: u64 = archives.iter().map(|a| a.total_size).sum();
    out.extend(format!("#size {total_size}\n").as_bytes());

    let mut uids: Vec<u32> = members.iter().map(|&id| entries[id].stat.uid).collect();
    uids.sort_unstable();
    uids.dedup();
    out.extend(format!("#uids {}\n", uids.iter().map(u32::to_string).collect::<Vec<_>>().join(" ")).as_bytes());

    let mut gids: Vec<u32> = members.iter().map(|&id| entries[id].stat.gid).collect();
    gids.sort_unstable();
    gids.dedup();
    out.extend(format!("#gids {}\n", gids.iter().map(u32::to_string).collect::<Vec<_>>().join(" ")).as_bytes());

    out.extend(format!("#files {} {}\n", members.len(), crate::index::COLUMN_LAYOUT_VERSION).as_bytes());
    out.push(0);

    out.extend(entries_text(entries, members, archives, interner));

    out.extend(format!("#tars {}\n", archives.len()).as_bytes());
    out.push(0);
    for archive in archives {
        if archive.num_parts() <= 1 {
            out.extend(archive_filename(archive, entries, interner, None).as_bytes());
        } else {
            let first = archive_filename(archive, entries, interner, Some(0));
            let last = archive_filename(archive, entries, interner, Some(archive.num_parts() - 1));
            out.extend(format!("{first} ... {last}").as_bytes());
        }
        out.push(b'\n');
        out.push(0);
    }

    let content_split: Vec<&Archive> = archives
        .iter()
        .filter(|a| a.kind == ArchiveKind::ContentSplitLarge)
        .collect();
    out.extend(format!("#parts {}\n", content_split.len()).as_bytes());
    out.push(0);
    for archive in content_split {
        let member = archive.members.first().copied();
        let tar_path = member
            .and_then(|id| entries[id].tar_path.as_deref())
            .unwrap_or("");
        out.extend(format!("{tar_path}\0{}\n", archive.num_parts()).as_bytes());
        out.push(0);
    }

    let digest = Sha256::digest(&out);
    out.extend(format!("#end {}\n", hex::encode(digest)).as_bytes());
    out.push(0);

    out
}

/// Gzip-compress the index text for on-disk storage (§4.8).
pub fn compress(text: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(text)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileStat, LinkKind};
    use crate::path::Interner;

    fn entry(id: EntryId, tar_path: &str, size: u64) -> Entry {
        Entry {
            id,
            source_path: Interner::new().root(),
            tar_path: Some(tar_path.to_string()),
            stat: FileStat {
                kind: FileKind::Regular,
                mode: 0o644,
                uid: 0,
                gid: 0,
                size,
                rdev: 0,
                mtime_sec: 1_600_000_000,
                mtime_nsec: 0,
                ino: id as u64 + 1,
                nlink: 1,
            },
            link_kind: LinkKind::None,
            symlink_target: None,
            hardlink_canonical: None,
            tarpath_hash: 0,
            blocked_size: 1024,
            header_size: 512,
            should_content_split: false,
            parent: None,
            archive: Some(0),
            archive_offset: 0,
            is_collection: false,
            children_size: 0,
            entries: Vec::new(),
        }
    }

    #[test]
    fn index_text_contains_required_header_lines() {
        let interner = Interner::new();
        let e = entry(0, "a.txt", 512);
        let entries = vec![e];
        let archive = Archive {
            id: 0,
            kind: ArchiveKind::Small,
            collection_dir: 0,
            members: vec![0],
            total_size: 1024 + 1024,
            mtime_sec: 1_600_000_000,
            mtime_nsec: 0,
            fingerprint: archive_fingerprint(&[0], &entries),
            part_sizes: Vec::new(),
        };
        let opts = WriteOptions { config_line: "backup /src".to_string() };
        let text = build_index_text(&entries, &[0], std::slice::from_ref(&archive), &interner, &opts);
        let s = String::from_utf8_lossy(&text);
        assert!(s.contains("#beak 0.81"));
        assert!(s.contains("#config backup /src"));
        assert!(s.contains("#files 1 1"));
        assert!(s.contains("#end "));
    }

    #[test]
    fn checksum_covers_everything_before_the_end_line() {
        let interner = Interner::new();
        let e = entry(0, "a.txt", 512);
        let entries = vec![e];
        let archive = Archive {
            id: 0,
            kind: ArchiveKind::Small,
            collection_dir: 0,
            members: vec![0],
            total_size: 1024 + 1024,
            mtime_sec: 1_600_000_000,
            mtime_nsec: 0,
            fingerprint: archive_fingerprint(&[0], &entries),
            part_sizes: Vec::new(),
        };
        let opts = WriteOptions { config_line: String::new() };
        let text = build_index_text(&entries, &[0], std::slice::from_ref(&archive), &interner, &opts);
        let end_marker = b"#end ";
        let pos = text.windows(end_marker.len()).position(|w| w == end_marker).unwrap();
        let digest = Sha256::digest(&text[..pos]);
        let expected = hex::encode(digest);
        let tail = String::from_utf8_lossy(&text[pos + end_marker.len()..]);
        assert!(tail.starts_with(&expected));
    }
}
