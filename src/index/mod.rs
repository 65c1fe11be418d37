//! C8/C9: index writer and reader (spec §4.8, §4.9).

pub mod reader;
pub mod writer;

/// Column layout version this writer emits; readers check it only for
/// diagnostics, since parsing is purely positional (§4.9).
pub const COLUMN_LAYOUT_VERSION: u32 = 1;

/// Index format versions a reader must accept (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    V0_7,
    V0_8,
    V0_81,
}

impl FormatVersion {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "0.7" => Some(FormatVersion::V0_7),
            "0.8" => Some(FormatVersion::V0_8),
            "0.81" => Some(FormatVersion::V0_81),
            _ => None,
        }
    }

    /// The writer always emits this version (§9, resolved open question).
    pub fn current() -> Self {
        FormatVersion::V0_81
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormatVersion::V0_7 => "0.7",
            FormatVersion::V0_8 => "0.8",
            FormatVersion::V0_81 => "0.81",
        }
    }

    /// Only 0.81 carries a trailing `#end` checksum line.
    pub fn has_end_checksum(self) -> bool {
        self >= FormatVersion::V0_81
    }
}

pub const NUL: u8 = 0;
