//! C7: archive materializer (spec §4.7).
//!
//! Grounded on the streaming-to-writer style in
//! `write_files_to_tar`/`write_file_entry` (`marcoh00-chunkah/src/tar.rs`),
//! but inverted: instead of pushing bytes into a `tar::Builder` once,
//! `read` pulls bytes on demand for an arbitrary byte range, since an
//! archive here is a read-only virtual file rather than a one-shot layer
//! blob. Headers are never cached, only computed, per §4.7.

use std::io::{Read, Seek, SeekFrom};

use cap_std_ext::cap_std::fs_utf8::Dir;

use crate::error::Result;
use crate::model::{Archive, Entry, LinkKind};
use crate::path::Interner;
use crate::tarcodec::{self, HeaderMeta, HeaderStyle, TypeFlagKind};

/// Default `tar_split_size`: multi-part archives are cut no larger than
/// 5x the target archive size (§4.7).
pub fn default_split_size(target_archive_size: u64) -> u64 {
    5 * target_archive_size
}

/// Exact 512-byte-aligned byte offsets at which to cut `total_size` into
/// parts no larger than `split_size`.
pub fn compute_part_sizes(total_size: u64, split_size: u64) -> Vec<u64> {
    if total_size <= split_size {
        return Vec::new(); // single part; Archive::num_parts() reports 1
    }
    let split_size = (split_size / tarcodec::BLOCK_SIZE) * tarcodec::BLOCK_SIZE;
    let mut parts = Vec::new();
    let mut remaining = total_size;
    while remaining > 0 {
        let this = remaining.min(split_size);
        parts.push(this);
        remaining -= this;
    }
    parts
}

fn type_flag_for(entry: &Entry) -> TypeFlagKind {
    use crate::model::FileKind;
    match (entry.stat.kind, entry.link_kind) {
        (_, LinkKind::Hard) => TypeFlagKind::HardLink,
        (FileKind::Directory, _) => TypeFlagKind::Directory,
        (FileKind::Symlink, _) => TypeFlagKind::Symlink,
        (FileKind::Fifo, _) => TypeFlagKind::Fifo,
        (FileKind::CharDevice, _) => TypeFlagKind::CharDevice,
        (FileKind::BlockDevice, _) => TypeFlagKind::BlockDevice,
        (FileKind::Regular, _) => TypeFlagKind::Regular,
    }
}

fn link_target_for<'a>(entry: &'a Entry, entries: &'a [Entry], interner: &'a Interner) -> Option<String> {
    match entry.link_kind {
        LinkKind::Symbolic => entry.symlink_target.clone(),
        LinkKind::Hard => {
            let canonical = entry.hardlink_canonical?;
            entries[canonical].tar_path.clone().or_else(|| {
                Some(interner.to_string(entries[canonical].source_path))
            })
        }
        LinkKind::None => None,
    }
}

fn header_bytes_for(entry: &Entry, entries: &[Entry], interner: &Interner, style: HeaderStyle) -> Vec<u8> {
    let tar_path = entry.tar_path.clone().unwrap_or_default();
    let link_target = link_target_for(entry, entries, interner);
    let meta = HeaderMeta {
        mode: entry.stat.mode,
        uid: entry.stat.uid,
        gid: entry.stat.gid,
        size: entry.payload_size(),
        mtime_sec: entry.stat.mtime_sec,
        devmajor: 0,
        devminor: 0,
    };
    tarcodec::encode_header(&tar_path, type_flag_for(entry), link_target.as_deref(), &meta, style)
}

/// Reads bytes out of one materialized archive, on demand, without ever
/// holding the whole tar stream in memory.
pub struct ArchiveReader<'a> {
    pub archive: &'a Archive,
    pub entries: &'a [Entry],
    pub interner: &'a Interner,
    pub source_root: &'a Dir,
    pub header_style: HeaderStyle,
}

impl<'a> ArchiveReader<'a> {
    pub fn size(&self) -> u64 {
        self.archive.total_size
    }

    pub fn mtime(&self) -> (i64, u32) {
        (self.archive.mtime_sec, self.archive.mtime_nsec)
    }

    pub fn num_parts(&self) -> usize {
        self.archive.num_parts()
    }

    pub fn part_size(&self, part: usize) -> u64 {
        self.archive.part_size(part)
    }

    /// Offset, within the whole (unsplit) archive stream, at which `part`
    /// begins.
    fn part_start_offset(&self, part: usize) -> u64 {
        if self.archive.part_sizes.is_empty() {
            0
        } else {
            self.archive.part_sizes[..part].iter().sum()
        }
    }

    /// Fill `buf` starting at `offset` bytes into `part`. Returns the
    /// number of bytes written (less than `buf.len()` only at end of
    /// part/archive).
    pub fn read(&self, part: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let global_offset = self.part_start_offset(part) + offset;
        let trailer_start = self
            .archive
            .members
            .iter()
            .map(|&id| self.entries[id].archive_offset + self.entries[id].blocked_size)
            .max()
            .unwrap_or(0);

        if global_offset >= trailer_start {
            // two trailing zero blocks terminate the archive (§4.7).
            let trailer_len = self.archive.total_size - trailer_start;
            let pos = global_offset - trailer_start;
            if pos >= trailer_len {
                return Ok(0);
            }
            let n = ((trailer_len - pos) as usize).min(buf.len());
            buf[..n].fill(0);
            return Ok(n);
        }

        // Binary search for the member whose [archive_offset, archive_offset + blocked_size)
        // range contains global_offset. Members are stored in tar (storage) order.
        let idx = self
            .archive
            .members
            .partition_point(|&id| self.entries[id].archive_offset + self.entries[id].blocked_size <= global_offset);
        let member_id = self.archive.members[idx];
        let member = &self.entries[member_id];
        let within = global_offset - member.archive_offset;

        if within < member.header_size {
            let header = header_bytes_for(member, self.entries, self.interner, self.header_style);
            let n = ((header.len() as u64 - within) as usize).min(buf.len());
            buf[..n].copy_from_slice(&header[within as usize..within as usize + n]);
            return Ok(n);
        }

        let payload_off = within - member.header_size;
        let payload_size = member.payload_size();
        if payload_off < payload_size {
            let rel_path = self
                .interner
                .to_string(member.source_path)
                .trim_start_matches('/')
                .to_string();
            let mut file = self.source_root.open(&rel_path)?;
            file.seek(SeekFrom::Start(payload_off))?;
            let n = (payload_size - payload_off).min(buf.len() as u64) as usize;
            let read = file.read(&mut buf[..n])?;
            return Ok(read);
        }

        // zero-padding out to the 512-byte boundary
        let pad_start = member.header_size + payload_size;
        let pad_end = member.blocked_size;
        let pos = within - pad_start;
        let n = ((pad_end - pad_start - pos) as usize).min(buf.len());
        buf[..n].fill(0);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsplit_archive_has_one_part() {
        assert!(compute_part_sizes(1000, 5000).is_empty());
    }

    #[test]
    fn oversized_archive_splits_on_block_boundaries() {
        let parts = compute_part_sizes(3000, 1024);
        assert!(parts.iter().all(|&p| p % tarcodec::BLOCK_SIZE == 0 || p == *parts.last().unwrap()));
        assert_eq!(parts.iter().sum::<u64>(), 3000);
    }
}
