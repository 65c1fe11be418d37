//! C9: index reader (spec §4.9).
//!
//! Grounded on `index.cc::loadIndex`/`eatEntry`: positional parsing up to
//! the next NUL, per-column max lengths, and a trailing checksum that's
//! mandatory from format 0.81 onward. Lazy per-subtree loading (the
//! second half of §4.9) lives in [`crate::vfs`], which decides *when* to
//! call this parser rather than this module deciding for itself.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::index::FormatVersion;

const MAX_PATH_LEN: usize = 4096;
const MAX_NUMERIC_LEN: usize = 64;

/// One parsed entry-column record (§4.8's per-line column layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub permissions: String,
    pub uid: u32,
    pub gid: u32,
    pub size_or_rdev: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub tar_path: String,
    pub link: Option<LinkField>,
    pub archive_filename: String,
    pub offset: u64,
    pub multipart: Multipart,
    pub meta_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkField {
    Symlink(String),
    HardLink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multipart {
    Single,
    Parts { num: u32, part_header_size: u64, first_part_size: u64, last_part_size: u64 },
}

pub struct ParsedIndex {
    pub version: FormatVersion,
    pub config_line: String,
    pub total_size: u64,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub entries: Vec<IndexEntry>,
    pub tar_names: Vec<String>,
    pub content_split_parts: Vec<(String, u32)>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read up to (not including) the next NUL, enforcing `max_len`.
    fn eat_to_nul(&mut self, max_len: usize) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let nul_at = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::MalformedIndex { path: "<index>".into(), reason: "missing NUL terminator".into() }
        })?;
        if nul_at > max_len {
            return Err(Error::MalformedIndex {
                path: "<index>".into(),
                reason: format!("column exceeds max length {max_len}"),
            });
        }
        let field = &rest[..nul_at];
        self.pos += nul_at + 1;
        Ok(field)
    }

    fn eat_line(&mut self, max_len: usize) -> Result<&'a str> {
        let bytes = self.eat_to_nul(max_len)?;
        std::str::from_utf8(bytes)
            .map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "non-UTF8 column".into() })
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn parse_entry(c: &mut Cursor<'_>) -> Result<Option<IndexEntry>> {
    if c.at_end() {
        return Ok(None);
    }
    let permissions = c.eat_line(MAX_NUMERIC_LEN)?.trim_end_matches('\n').to_string();
    let uidgid = c.eat_line(MAX_NUMERIC_LEN)?;
    let (uid, gid) = uidgid
        .split_once('/')
        .ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "bad uid/gid column".into() })?;
    let uid: u32 = uid.parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad uid".into() })?;
    let gid: u32 = gid.parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad gid".into() })?;

    let size_field = c.eat_line(MAX_NUMERIC_LEN)?;
    let size_or_rdev: u64 = size_field
        .parse()
        .map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad size column".into() })?;

    let ts = c.eat_line(MAX_NUMERIC_LEN)?;
    let (sec, nsec) = ts
        .split_once('.')
        .ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "bad timestamp column".into() })?;
    let mtime_sec: i64 = sec.parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad mtime sec".into() })?;
    let mtime_nsec: u32 = nsec.parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad mtime nsec".into() })?;

    let tar_path = c.eat_line(MAX_PATH_LEN)?.to_string();

    let link_field = c.eat_line(MAX_PATH_LEN)?;
    let link = if let Some(target) = link_field.strip_prefix(" -> ") {
        Some(LinkField::Symlink(target.to_string()))
    } else if let Some(target) = link_field.strip_prefix(" link to ") {
        Some(LinkField::HardLink(target.to_string()))
    } else {
        None
    };

    let archive_filename = c.eat_line(MAX_PATH_LEN)?.to_string();

    let offset: u64 = c
        .eat_line(MAX_NUMERIC_LEN)?
        .parse()
        .map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad offset column".into() })?;

    let multipart_field = c.eat_line(MAX_NUMERIC_LEN)?;
    let multipart = if multipart_field == "1" {
        Multipart::Single
    } else {
        let parts: Vec<&str> = multipart_field.split(',').collect();
        if parts.len() != 4 {
            return Err(Error::MalformedIndex { path: "<index>".into(), reason: "bad multipart column".into() });
        }
        Multipart::Parts {
            num: parts[0].parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad multipart num".into() })?,
            part_header_size: parts[1].parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad multipart header size".into() })?,
            first_part_size: parts[2].parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad multipart first size".into() })?,
            last_part_size: parts[3].parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad multipart last size".into() })?,
        }
    };

    let meta_sha256 = c.eat_line(MAX_NUMERIC_LEN.max(64))?.trim_end_matches('\n').to_string();

    Ok(Some(IndexEntry {
        permissions,
        uid,
        gid,
        size_or_rdev,
        mtime_sec,
        mtime_nsec,
        tar_path,
        link,
        archive_filename,
        offset,
        multipart,
        meta_sha256,
    }))
}

/// Parse one complete index file body (already gunzipped).
pub fn parse(data: &[u8]) -> Result<ParsedIndex> {
    let mut c = Cursor::new(data);

    // The whole header — `#beak` through `#files` — is a single NUL-
    // delimited field with embedded `\n` line separators; only after
    // `#files ...\n` does the next NUL appear (matching `index.cc`'s
    // single `eatTo(..., separator, ...)` call for this block).
    let header_block = c.eat_line(30 * 1024 * 1024)?;

    let mut config_line = String::new();
    let mut total_size = 0u64;
    let mut uids = Vec::new();
    let mut gids = Vec::new();
    let mut num_files = 0usize;
    let mut version = None;

    for line in header_block.lines() {
        if let Some(rest) = line.strip_prefix("#beak ") {
            version = Some(
                FormatVersion::parse(rest)
                    .ok_or_else(|| Error::UnsupportedIndexVersion { path: "<index>".into(), version: rest.to_string() })?,
            );
        } else if let Some(rest) = line.strip_prefix("#config ") {
            config_line = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("#size ") {
            total_size = rest.parse().map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad #size".into() })?;
        } else if let Some(rest) = line.strip_prefix("#uids ") {
            uids = rest.split_whitespace().filter_map(|s| s.parse().ok()).collect();
        } else if let Some(rest) = line.strip_prefix("#gids ") {
            gids = rest.split_whitespace().filter_map(|s| s.parse().ok()).collect();
        } else if let Some(rest) = line.strip_prefix("#files ") {
            let mut parts = rest.split_whitespace();
            num_files = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "bad #files".into() })?;
        }
        // unrecognized lines are ignored, matching the original's tolerance
        // for forward-compatible header additions.
    }
    let version = version.ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "missing #beak header".into() })?;

    let mut entries = Vec::with_capacity(num_files);
    for _ in 0..num_files {
        match parse_entry(&mut c)? {
            Some(e) => entries.push(e),
            None => break,
        }
    }
    if entries.len() != num_files {
        return Err(Error::MalformedIndex { path: "<index>".into(), reason: "entry count mismatch".into() });
    }

    let tars_line = c.eat_line(64)?.trim_end_matches('\n').to_string();
    let num_tars: usize = tars_line
        .strip_prefix("#tars ")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "bad #tars".into() })?;
    let mut tar_names = Vec::with_capacity(num_tars);
    for _ in 0..num_tars {
        let name = c.eat_line(MAX_PATH_LEN)?.trim_end_matches('\n').to_string();
        tar_names.push(name);
    }

    let parts_line = c.eat_line(64)?.trim_end_matches('\n').to_string();
    let num_parts: usize = parts_line
        .strip_prefix("#parts ")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "bad #parts".into() })?;
    let mut content_split_parts = Vec::with_capacity(num_parts);
    for _ in 0..num_parts {
        // Each record is two NUL-delimited fields: the tar path, then the
        // part count line (`tarpath\0num_parts\n\0`, spec §4.8).
        let path = c.eat_line(MAX_PATH_LEN)?.to_string();
        let count_line = c.eat_line(MAX_NUMERIC_LEN)?.trim_end_matches('\n');
        let n: u32 = count_line
            .parse()
            .map_err(|_| Error::MalformedIndex { path: "<index>".into(), reason: "bad part count".into() })?;
        content_split_parts.push((path, n));
    }

    if version.has_end_checksum() {
        let end_start = c.pos;
        let end_line = c.eat_line(4096)?;
        let hex_digest = end_line
            .strip_prefix("#end ")
            .ok_or_else(|| Error::MalformedIndex { path: "<index>".into(), reason: "missing #end".into() })?
            .trim_end_matches('\n');
        let computed = Sha256::digest(&data[..end_start]);
        if hex::encode(computed) != hex_digest {
            return Err(Error::IndexChecksumMismatch { path: "<index>".into() });
        }
    }

    Ok(ParsedIndex {
        version,
        config_line,
        total_size,
        uids,
        gids,
        entries,
        tar_names,
        content_split_parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::writer::{archive_fingerprint, build_index_text, WriteOptions};
    use crate::model::{Archive, ArchiveKind, Entry, FileKind, FileStat, LinkKind};
    use crate::path::Interner;

    fn sample_entry() -> Entry {
        Entry {
            id: 0,
            source_path: Interner::new().root(),
            tar_path: Some("a.txt".to_string()),
            stat: FileStat {
                kind: FileKind::Regular,
                mode: 0o644,
                uid: 1000,
                gid: 1000,
                size: 42,
                rdev: 0,
                mtime_sec: 1_600_000_000,
                mtime_nsec: 123,
                ino: 1,
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
    fn round_trips_a_single_entry_index() {
        let interner = Interner::new();
        let entries = vec![sample_entry()];
        let archive = Archive {
            id: 0,
            kind: ArchiveKind::Small,
            collection_dir: 0,
            members: vec![0],
            total_size: 2048,
            mtime_sec: 1_600_000_000,
            mtime_nsec: 0,
            fingerprint: archive_fingerprint(&[0], &entries),
            part_sizes: Vec::new(),
        };
        let opts = WriteOptions { config_line: "backup /src".to_string() };
        let text = build_index_text(&entries, &[0], std::slice::from_ref(&archive), &interner, &opts);

        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.version, FormatVersion::V0_81);
        assert_eq!(parsed.config_line, "backup /src");
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].tar_path, "a.txt");
        assert_eq!(parsed.entries[0].uid, 1000);
        assert_eq!(parsed.tar_names.len(), 1);
    }

    #[test]
    fn rejects_a_corrupted_checksum() {
        let interner = Interner::new();
        let entries = vec![sample_entry()];
        let archive = Archive {
            id: 0,
            kind: ArchiveKind::Small,
            collection_dir: 0,
            members: vec![0],
            total_size: 2048,
            mtime_sec: 1_600_000_000,
            mtime_nsec: 0,
            fingerprint: archive_fingerprint(&[0], &entries),
            part_sizes: Vec::new(),
        };
        let opts = WriteOptions { config_line: String::new() };
        let mut text = build_index_text(&entries, &[0], std::slice::from_ref(&archive), &interner, &opts);
        let last = text.len() - 3;
        text[last] ^= 0xff;
        assert!(matches!(parse(&text), Err(Error::IndexChecksumMismatch { .. })));
    }
}
