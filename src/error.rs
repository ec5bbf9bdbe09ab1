//! Error types for apphost-bundle

use std::path::PathBuf;
use thiserror::Error;

/// Result type for bundle and extract operations
pub type BundleResult<T> = Result<T, BundleError>;

/// Result type for apphost patch operations
pub type PatchResult<T> = Result<T, BinaryPatchError>;

/// Malformed or incompatible bundle metadata
#[derive(Error, Debug)]
pub enum FormatError {
    /// Stream shorter than the fixed footer
    #[error("bundle is too small ({len} bytes) to contain a manifest footer")]
    TooSmall { len: u64 },

    /// Trailing signature missing or different
    #[error("bundle signature not found")]
    BadSignature,

    /// Footer version differs from the supported version
    #[error("unsupported bundle version {major}.{minor} (expected {expected_major}.{expected_minor})")]
    UnsupportedVersion {
        major: u32,
        minor: u32,
        expected_major: u32,
        expected_minor: u32,
    },

    /// Footer fields point outside the bundle
    #[error("invalid manifest directory: {0}")]
    InvalidDirectory(String),

    /// Entry content extends past the end of the bundle
    #[error("entry '{name}' (offset {offset}, size {size}) lies outside the bundle")]
    EntryOutOfBounds { name: String, offset: u64, size: u64 },

    /// The same name appears twice in one manifest
    #[error("duplicate entry '{0}'")]
    DuplicateEntry(String),

    /// Length-prefixed string could not be decoded
    #[error("invalid string in manifest: {0}")]
    InvalidString(String),

    /// Entry name would escape the extraction directory
    #[error("invalid entry name '{0}'")]
    InvalidEntryName(String),

    /// Manifest does not hold exactly one main application
    #[error("manifest must contain exactly one main application, found {0}")]
    MissingMainApplication(usize),

    /// Configuration kind present more than once
    #[error("manifest contains more than one {0} entry")]
    DuplicateConfig(&'static str),

    /// Underlying read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while bundling or extracting
#[derive(Error, Debug)]
pub enum BundleError {
    /// Invalid or ambiguous input
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Bundle could not be parsed or extracted
    #[error("Malformed bundle {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    /// Manifest could not be written
    #[error("Manifest error: {0}")]
    Format(#[from] FormatError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BundleError {
    /// Wrap a decoding or extraction failure with the bundle path
    pub fn malformed(path: impl Into<PathBuf>, source: impl Into<FormatError>) -> Self {
        BundleError::Malformed {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Outcome of a failed [`search_and_replace`](crate::search_and_replace)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceError {
    /// Pattern does not occur in the data
    #[error("pattern not found")]
    PatternNotFound,

    /// Pattern found at `offset` but the replacement does not fit
    #[error("replacement of {needed} bytes at offset {offset} exceeds the {available} bytes available")]
    NoRoom {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Errors that can occur while patching an apphost
#[derive(Error, Debug)]
pub enum BinaryPatchError {
    /// App path does not fit in the placeholder buffer
    #[error("Given file name {path} is longer than {max} bytes ({len} bytes)")]
    PathTooLong { path: String, len: usize, max: usize },

    /// Template does not contain the expected placeholder
    #[error(
        "Unable to use '{}' as application host executable as it does not contain the expected placeholder byte sequence '{placeholder}'",
        path.display()
    )]
    PlaceholderNotFound {
        path: PathBuf,
        placeholder: &'static str,
    },

    /// Placeholder found but the replacement runs past the end of the file
    #[error(
        "Unable to write {needed} bytes over placeholder '{placeholder}' in '{}': only {available} bytes remain",
        path.display()
    )]
    ReplacementDoesNotFit {
        path: PathBuf,
        placeholder: &'static str,
        needed: usize,
        available: usize,
    },

    /// Destination resolves to the template itself
    #[error("Destination '{}' is the application host template itself", path.display())]
    DestinationIsTemplate { path: PathBuf },

    /// GUI subsystem requested for a non-PE host
    #[error(
        "Unable to use '{}' as application host executable because it's not a Windows executable",
        path.display()
    )]
    NotWindowsExecutable { path: PathBuf },

    /// GUI subsystem requested for a PE host that is not a console app
    #[error(
        "Unable to use '{}' as application host executable because it's not a Windows executable for the CUI (Console) subsystem",
        path.display()
    )]
    NotConsoleSubsystem { path: PathBuf },

    /// Resource editing error (icon, version info, manifest)
    #[error("Resource edit error: {0}")]
    ResourceEdit(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
