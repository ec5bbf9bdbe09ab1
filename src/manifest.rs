//! Bundle manifest: the metadata directory and footer of a bundle
//!
//! ## Layout
//!
//! ```text
//! [Host executable]
//! [Embedded files]
//!   - assemblies start on a 16-byte boundary
//! [Metadata directory]
//!   - deps.json entry                (if any)
//!   - runtimeconfig.json entry       (if any)
//!   - main application entry
//!   - managed assembly entries       (zero or more)
//!   - other file entries             (zero or more)
//!   each entry: name (7-bit length prefixed UTF-8), offset i64 LE, size i64 LE
//! [Footer] (43 bytes)
//!   - Major version: u32 LE
//!   - Minor version: u32 LE
//!   - Directory offset: i64 LE
//!   - File count: i32 LE
//!   - Assembly count: i32 LE
//!   - Flags: i32 LE
//!   - Signature: ".NetCoreBundle" (1 length byte + 14 bytes)
//! ```
//!
//! The kind of an entry is not stored. It is implied by the position of the
//! entry in the directory together with the flags and the assembly count.
//! Readers here do not reconstruct kinds: every decoded entry is `Other`.

use crate::error::FormatError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::BitOr;

/// Signature string closing every bundle
pub const BUNDLE_SIGNATURE: &str = ".NetCoreBundle";

/// Current manifest format version
pub const MAJOR_VERSION: u32 = 0;
pub const MINOR_VERSION: u32 = 1;

/// Signature size on disk (length byte + 14 bytes)
pub const SIGNATURE_LENGTH: u64 = 15;

/// Footer size on disk, signature included
pub const FOOTER_LENGTH: u64 = 43;

const SIGNATURE_BYTES: [u8; SIGNATURE_LENGTH as usize] = *b"\x0e.NetCoreBundle";

/// Write order of the directory groups
const GROUP_ORDER: [FileKind; 5] = [
    FileKind::DepsJson,
    FileKind::RuntimeConfigJson,
    FileKind::MainApplication,
    FileKind::ManagedAssembly,
    FileKind::Other,
];

/// How the host treats an embedded file at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// The managed entry assembly
    MainApplication,
    /// IL-only assembly, loaded directly from the bundle
    ManagedAssembly,
    /// `<app>.deps.json`, read from memory
    DepsJson,
    /// `<app>.runtimeconfig.json`, read from memory
    RuntimeConfigJson,
    /// Anything else; spilled to disk before use
    Other,
}

impl FileKind {
    /// Whether entries of this kind must start on an alignment boundary
    pub fn requires_alignment(self) -> bool {
        matches!(self, FileKind::MainApplication | FileKind::ManagedAssembly)
    }

    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self {
            FileKind::MainApplication => "main_application",
            FileKind::ManagedAssembly => "managed_assembly",
            FileKind::DepsJson => "deps_json",
            FileKind::RuntimeConfigJson => "runtime_config_json",
            FileKind::Other => "other",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Manifest flags bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleFlags(u32);

impl BundleFlags {
    pub const NONE: BundleFlags = BundleFlags(0);
    pub const HAS_DEPS_JSON: BundleFlags = BundleFlags(1);
    pub const HAS_RUNTIME_CONFIG_JSON: BundleFlags = BundleFlags(2);

    pub fn from_bits(bits: u32) -> Self {
        BundleFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: BundleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BundleFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for BundleFlags {
    type Output = BundleFlags;

    fn bitor(self, rhs: BundleFlags) -> BundleFlags {
        BundleFlags(self.0 | rhs.0)
    }
}

/// One embedded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub kind: FileKind,
    /// Bundle-relative path, also the restoration file name
    pub name: String,
    /// Absolute offset of the content within the bundle
    pub offset: u64,
    /// Content length in bytes
    pub size: u64,
}

impl FileEntry {
    pub fn new(kind: FileKind, name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            kind,
            name: name.into(),
            offset,
            size,
        }
    }

    fn write<W: Write>(&self, writer: &mut W) -> Result<(), FormatError> {
        write_string(writer, &self.name)?;
        writer.write_all(&to_i64(self.offset, &self.name)?.to_le_bytes())?;
        writer.write_all(&to_i64(self.size, &self.name)?.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let name = read_string(reader)?;
        let offset = read_i64(reader)?;
        let size = read_i64(reader)?;

        if offset < 0 || size < 0 {
            return Err(FormatError::EntryOutOfBounds {
                name,
                offset: offset as u64,
                size: size as u64,
            });
        }

        Ok(Self::new(FileKind::Other, name, offset as u64, size as u64))
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] @{} Sz={}",
            self.name, self.kind, self.offset, self.size
        )
    }
}

/// Description of the contents of a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
    pub flags: BundleFlags,
    /// Offset of the metadata directory within the bundle
    pub file_entry_start: u64,
    /// Main application plus managed assemblies
    pub assembly_count: i32,
    pub major_version: u32,
    pub minor_version: u32,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Create an empty manifest for the current format version
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            flags: BundleFlags::NONE,
            file_entry_start: 0,
            assembly_count: 0,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
        }
    }

    /// Format version as "major.minor"
    pub fn version() -> String {
        format!("{}.{}", MAJOR_VERSION, MINOR_VERSION)
    }

    /// Record an embedded file
    pub fn add_entry(
        &mut self,
        kind: FileKind,
        name: impl Into<String>,
        offset: u64,
        size: u64,
    ) -> &FileEntry {
        match kind {
            FileKind::DepsJson => self.flags.insert(BundleFlags::HAS_DEPS_JSON),
            FileKind::RuntimeConfigJson => self.flags.insert(BundleFlags::HAS_RUNTIME_CONFIG_JSON),
            FileKind::MainApplication | FileKind::ManagedAssembly | FileKind::Other => {}
        }

        self.files.push(FileEntry::new(kind, name, offset, size));
        &self.files[self.files.len() - 1]
    }

    /// Number of entries of the given kind
    pub fn count(&self, kind: FileKind) -> usize {
        self.files.iter().filter(|e| e.kind == kind).count()
    }

    /// Look up an entry by name
    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|e| e.name == name)
    }

    /// Append the metadata directory and footer at the writer's position
    ///
    /// Returns the offset of the directory.
    pub fn write<W: Write + Seek>(&mut self, writer: &mut W) -> Result<u64, FormatError> {
        let main_count = self.count(FileKind::MainApplication);
        if main_count != 1 {
            return Err(FormatError::MissingMainApplication(main_count));
        }
        for (kind, label) in [
            (FileKind::DepsJson, "deps.json"),
            (FileKind::RuntimeConfigJson, "runtimeconfig.json"),
        ] {
            if self.count(kind) > 1 {
                return Err(FormatError::DuplicateConfig(label));
            }
        }

        let file_count = i32::try_from(self.files.len()).map_err(|_| {
            FormatError::InvalidDirectory(format!("too many entries: {}", self.files.len()))
        })?;

        self.file_entry_start = writer.stream_position()?;

        for kind in GROUP_ORDER {
            for entry in self.files.iter().filter(|e| e.kind == kind) {
                entry.write(writer)?;
            }
        }

        // +1 for the main application
        self.assembly_count = self.count(FileKind::ManagedAssembly) as i32 + 1;

        writer.write_all(&self.major_version.to_le_bytes())?;
        writer.write_all(&self.minor_version.to_le_bytes())?;
        writer.write_all(&to_i64(self.file_entry_start, "directory")?.to_le_bytes())?;
        writer.write_all(&file_count.to_le_bytes())?;
        writer.write_all(&self.assembly_count.to_le_bytes())?;
        writer.write_all(&(self.flags.bits() as i32).to_le_bytes())?;
        writer.write_all(&SIGNATURE_BYTES)?;

        let end = writer.stream_position()?;
        tracing::debug!(
            "Manifest: Offset={}, Size={}",
            self.file_entry_start,
            end - self.file_entry_start
        );

        Ok(self.file_entry_start)
    }

    /// Check whether a stream ends with the bundle signature
    pub fn has_signature<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < FOOTER_LENGTH {
            return Ok(false);
        }

        reader.seek(SeekFrom::Start(len - SIGNATURE_LENGTH))?;
        let mut signature = [0u8; SIGNATURE_LENGTH as usize];
        reader.read_exact(&mut signature)?;
        Ok(signature == SIGNATURE_BYTES)
    }

    /// Decode the footer and metadata directory of a bundle
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self, FormatError> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < FOOTER_LENGTH {
            return Err(FormatError::TooSmall { len });
        }

        if !Self::has_signature(reader)? {
            return Err(FormatError::BadSignature);
        }

        reader.seek(SeekFrom::Start(len - FOOTER_LENGTH))?;
        let major_version = read_u32(reader)?;
        let minor_version = read_u32(reader)?;
        if major_version != MAJOR_VERSION || minor_version != MINOR_VERSION {
            return Err(FormatError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
                expected_major: MAJOR_VERSION,
                expected_minor: MINOR_VERSION,
            });
        }

        let file_entry_start = read_i64(reader)?;
        let file_count = read_i32(reader)?;
        let assembly_count = read_i32(reader)?;
        let flags = BundleFlags::from_bits(read_i32(reader)? as u32);

        let directory_end = len - FOOTER_LENGTH;
        if file_entry_start < 0 || file_entry_start as u64 > directory_end {
            return Err(FormatError::InvalidDirectory(format!(
                "directory offset {} outside of bundle",
                file_entry_start
            )));
        }
        if file_count < 0 {
            return Err(FormatError::InvalidDirectory(format!(
                "negative file count {}",
                file_count
            )));
        }

        // This reader doesn't care about the kind of file; it restores all of them.
        reader.seek(SeekFrom::Start(file_entry_start as u64))?;
        let mut files = Vec::new();
        let mut names = HashSet::new();
        for _ in 0..file_count {
            let entry = FileEntry::read(reader)?;

            let end = entry.offset.checked_add(entry.size);
            if end.is_none_or(|end| end > file_entry_start as u64) {
                return Err(FormatError::EntryOutOfBounds {
                    name: entry.name,
                    offset: entry.offset,
                    size: entry.size,
                });
            }
            if !names.insert(entry.name.clone()) {
                return Err(FormatError::DuplicateEntry(entry.name));
            }

            files.push(entry);
        }

        if reader.stream_position()? > directory_end {
            return Err(FormatError::InvalidDirectory(
                "directory overlaps the footer".to_string(),
            ));
        }

        Ok(Self {
            files,
            flags,
            file_entry_start: file_entry_start as u64,
            assembly_count,
            major_version,
            minor_version,
        })
    }
}

// ============================================================================
// Primitive encoding
// ============================================================================

fn to_i64(value: u64, what: &str) -> Result<i64, FormatError> {
    i64::try_from(value)
        .map_err(|_| FormatError::InvalidDirectory(format!("{} offset {} overflows", what, value)))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, FormatError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, FormatError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64, FormatError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

/// Write a string with a 7-bit encoded length prefix
pub(crate) fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), FormatError> {
    let mut len = u32::try_from(value.len())
        .map_err(|_| FormatError::InvalidString(format!("string of {} bytes", value.len())))?;

    while len >= 0x80 {
        writer.write_all(&[(len as u8) | 0x80])?;
        len >>= 7;
    }
    writer.write_all(&[len as u8])?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

/// Read a string with a 7-bit encoded length prefix
pub(crate) fn read_string<R: Read>(reader: &mut R) -> Result<String, FormatError> {
    let mut len: u32 = 0;
    let mut shift = 0;
    loop {
        if shift > 28 {
            return Err(FormatError::InvalidString(
                "length prefix is longer than 5 bytes".to_string(),
            ));
        }

        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        len |= ((byte[0] & 0x7F) as u32) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut bytes = Vec::new();
    reader.take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(FormatError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "string truncated",
        )));
    }

    String::from_utf8(bytes).map_err(|e| FormatError::InvalidString(e.to_string()))
}
