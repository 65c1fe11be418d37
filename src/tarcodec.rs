//! C2: POSIX ustar header codec with GNU long-name/long-link extensions.
//!
//! This hand-rolls the 512-byte record layout instead of going through the
//! `tar` crate's `Builder`: the partitioner needs to know how many bytes a
//! header will take up *before* any bytes are written (so archive sizes can
//! be budgeted without materializing them), and the materializer needs to
//! seek into the middle of a long-name record by byte offset. Neither is
//! exposed by `tar`'s streaming API, so the header is built the way
//! `examples/keisentraut-deterministic-tar` and
//! `examples/other_examples/.../rapidtar__...tar-header.rs` do it.

pub const BLOCK_SIZE: u64 = 512;

/// How much metadata a header records (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStyle {
    /// No tar record at all; only used internally for size bookkeeping of
    /// data-only streams. Not emitted by the archive materializer.
    None,
    /// uid=0, gid=0, uname=gname="beak", no atime/ctime.
    Simple,
    /// Preserve all available metadata.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFlag {
    Regular,
    HardLink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
}

impl TypeFlag {
    fn byte(self) -> u8 {
        match self {
            TypeFlag::Regular => b'0',
            TypeFlag::HardLink => b'1',
            TypeFlag::Symlink => b'2',
            TypeFlag::CharDevice => b'3',
            TypeFlag::BlockDevice => b'4',
            TypeFlag::Directory => b'5',
            TypeFlag::Fifo => b'6',
        }
    }
}

/// Metadata to stamp into a header, independent of style (style decides
/// which fields are actually written).
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime_sec: i64,
    pub devmajor: u32,
    pub devminor: u32,
}

fn blocks_for_bytes(len: usize) -> u64 {
    (len as u64).div_ceil(BLOCK_SIZE)
}

/// Size, in bytes, of one GNU long-name/long-link record pair: a full
/// header block plus the name payload rounded up to 512.
fn long_record_size(s: &str) -> u64 {
    BLOCK_SIZE + blocks_for_bytes(s.len() + 1) * BLOCK_SIZE
}

/// How many bytes of header (not payload) `tarpath`/`link_target` need,
/// including any GNU long-name/long-link extension records required
/// because a name exceeds the 100-byte ustar limit. Callers can budget
/// archive sizes with this before writing any bytes (§4.2).
pub fn calculate_header_size(tarpath: &str, link_target: Option<&str>) -> u64 {
    let mut size = BLOCK_SIZE;
    if tarpath.len() > 100 {
        size += long_record_size(tarpath);
    }
    if let Some(link) = link_target
        && link.len() > 100
    {
        size += long_record_size(link);
    }
    size
}

fn write_octal(buf: &mut [u8], value: u64) {
    // width-1 octal digits, zero padded, NUL terminated, as GNU/ustar do.
    let width = buf.len() - 1;
    let s = format!("{:0width$o}", value, width = width);
    buf[..width].copy_from_slice(&s.as_bytes()[s.len() - width..]);
    buf[width] = 0;
}

fn write_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn checksum(block: &[u8; 512]) -> u32 {
    let mut sum = 0u32;
    for (i, b) in block.iter().enumerate() {
        if (148..156).contains(&i) {
            sum += b' ' as u32;
        } else {
            sum += *b as u32;
        }
    }
    sum
}

/// Build one raw 512-byte ustar record (no long-name extensions).
#[allow(clippy::too_many_arguments)]
fn build_record(
    name: &str,
    linkname: &str,
    typeflag: TypeFlag,
    meta: &HeaderMeta,
    style: HeaderStyle,
) -> [u8; 512] {
    let mut block = [0u8; 512];
    write_str(&mut block[0..100], name);
    write_octal(&mut block[100..108], meta.mode as u64 & 0o7777);
    let (uid, gid) = match style {
        HeaderStyle::Simple => (0, 0),
        _ => (meta.uid as u64, meta.gid as u64),
    };
    write_octal(&mut block[108..116], uid);
    write_octal(&mut block[116..124], gid);
    write_octal(&mut block[124..136], meta.size);
    write_octal(&mut block[136..148], meta.mtime_sec.max(0) as u64);
    block[148..156].copy_from_slice(b"        "); // checksum placeholder
    block[156] = typeflag.byte();
    write_str(&mut block[157..257], linkname);
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    let uname = match style {
        HeaderStyle::Simple => "beak",
        _ => "",
    };
    write_str(&mut block[265..297], uname);
    write_str(&mut block[297..329], uname);
    write_octal(&mut block[329..337], meta.devmajor as u64);
    write_octal(&mut block[337..345], meta.devminor as u64);

    let sum = checksum(&block);
    let chk = format!("{:06o}\0 ", sum);
    block[148..156].copy_from_slice(chk.as_bytes());
    block
}

/// GNU long-name/long-link record: an `L`/`K`-typed header announcing the
/// length, followed by the name itself, NUL-terminated and zero-padded to
/// a 512-byte boundary.
fn build_long_record(name: &str, is_link: bool) -> Vec<u8> {
    let typeflag = if is_link { b'K' } else { b'L' };
    let mut block = [0u8; 512];
    write_str(&mut block[0..100], "././@LongLink");
    write_octal(&mut block[100..108], 0);
    write_octal(&mut block[108..116], 0);
    write_octal(&mut block[116..124], 0);
    write_octal(&mut block[124..136], (name.len() + 1) as u64);
    write_octal(&mut block[136..148], 0);
    block[148..156].copy_from_slice(b"        ");
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    let sum = checksum(&block);
    let chk = format!("{:06o}\0 ", sum);
    block[148..156].copy_from_slice(chk.as_bytes());

    let mut out = block.to_vec();
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    let pad = blocks_for_bytes(name.len() + 1) * BLOCK_SIZE - (name.len() as u64 + 1);
    out.extend(std::iter::repeat_n(0u8, pad as usize));
    out
}

/// Emit the full header (long-name records, if needed, then the main
/// record) for one entry. The result is exactly
/// `calculate_header_size(tarpath, link_target)` bytes.
pub fn encode_header(
    tarpath: &str,
    link_kind_flag: TypeFlagKind,
    link_target: Option<&str>,
    meta: &HeaderMeta,
    style: HeaderStyle,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(calculate_header_size(tarpath, link_target) as usize);
    if tarpath.len() > 100 {
        out.extend(build_long_record(tarpath, false));
    }
    if let Some(link) = link_target
        && link.len() > 100
    {
        out.extend(build_long_record(link, true));
    }

    let typeflag = match link_kind_flag {
        TypeFlagKind::Regular => TypeFlag::Regular,
        TypeFlagKind::HardLink => TypeFlag::HardLink,
        TypeFlagKind::Symlink => TypeFlag::Symlink,
        TypeFlagKind::CharDevice => TypeFlag::CharDevice,
        TypeFlagKind::BlockDevice => TypeFlag::BlockDevice,
        TypeFlagKind::Directory => TypeFlag::Directory,
        TypeFlagKind::Fifo => TypeFlag::Fifo,
    };

    let trunc = |s: &str| -> String { s.chars().take(100).collect() };
    let name_field = if tarpath.len() > 100 { trunc(tarpath) } else { tarpath.to_string() };
    let link_field = link_target.map(|l| if l.len() > 100 { trunc(l) } else { l.to_string() });

    out.extend(build_record(
        &name_field,
        link_field.as_deref().unwrap_or(""),
        typeflag,
        meta,
        style,
    ));
    out
}

/// Public mirror of [`TypeFlag`] that doesn't require constructing the
/// internal enum; kept separate so callers in other modules name entry
/// kinds the same way the rest of the model does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFlagKind {
    Regular,
    HardLink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
}
