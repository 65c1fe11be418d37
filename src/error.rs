//! Error kinds per spec §7, each carrying the originating path where one
//! exists. Library code returns these; the `beak` binary wraps them in
//! `anyhow::Context` like the rest of the crate.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // --- Source-invariant ---
    #[error("{path}: file mtime is in the future (scan start was earlier); pass relax_time_checks to allow it")]
    FutureDatedFile { path: Utf8PathBuf },

    #[error("case-insensitive collision between collection directories {a} and {b}")]
    CollectionDirCaseCollision { a: Utf8PathBuf, b: Utf8PathBuf },

    #[error("{path}: sockets are not supported")]
    UnsupportedSocket { path: Utf8PathBuf },

    #[error("{path}: unreadable source entry")]
    UnreadableSource {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    // --- Format ---
    #[error("malformed index {path}: {reason}")]
    MalformedIndex { path: Utf8PathBuf, reason: String },

    #[error("index {path}: unsupported format version {version}")]
    UnsupportedIndexVersion { path: Utf8PathBuf, version: String },

    #[error("index {path}: checksum mismatch (#end line does not match body)")]
    IndexChecksumMismatch { path: Utf8PathBuf },

    // --- Transport ---
    #[error("archive {name} is listed in the index but absent from storage; this point in time is broken")]
    ArchiveMissing { name: String },

    #[error("archive {name} is present on storage but not listed in any index; candidate for pruning")]
    ArchiveUnlisted { name: String },

    // --- Destination ---
    #[error("{path}: permission denied")]
    PermissionDenied { path: Utf8PathBuf },

    #[error("{path}: cannot create hard link, target is absent")]
    HardLinkTargetAbsent { path: Utf8PathBuf },

    #[error("{path}: destination clock skew detected (mtime moved backwards)")]
    ClockSkew { path: Utf8PathBuf },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
