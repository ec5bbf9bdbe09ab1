//! Windows executable resource copying
//!
//! Icons, version information and the application manifest of a managed
//! module are copied into the apphost so the launcher looks like the app.
//! Resources are decoded from the source module with [`crate::pe`] and
//! written into the destination with rcedit
//! (https://github.com/electron/rcedit).

use crate::pe::{self, PeResource, ResourceId, RT_GROUP_ICON, RT_ICON, RT_MANIFEST, RT_VERSION};
use crate::{BinaryPatchError, PatchResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

/// rcedit release version to download
const RCEDIT_VERSION: &str = "v2.0.0";

/// rcedit download URL template
const RCEDIT_DOWNLOAD_URL: &str =
    "https://github.com/electron/rcedit/releases/download/{version}/rcedit-x64.exe";

/// Windows executable resource editor
///
/// This struct wraps the rcedit tool for modifying PE resources.
pub struct ResourceEditor {
    /// Path to the rcedit executable
    rcedit_path: PathBuf,
}

impl ResourceEditor {
    /// Create a new ResourceEditor, downloading rcedit if necessary
    pub fn new() -> PatchResult<Self> {
        let rcedit_path = Self::ensure_rcedit()?;
        Ok(Self { rcedit_path })
    }

    /// Create a ResourceEditor with a custom rcedit path
    pub fn with_rcedit_path(path: PathBuf) -> PatchResult<Self> {
        if !path.exists() {
            return Err(BinaryPatchError::ResourceEdit(format!(
                "rcedit not found at: {}",
                path.display()
            )));
        }
        Ok(Self { rcedit_path: path })
    }

    /// Minimum expected size for rcedit-x64.exe (should be ~1.3MB)
    const RCEDIT_MIN_SIZE: u64 = 500_000;

    /// Ensure rcedit is available, downloading if necessary
    fn ensure_rcedit() -> PatchResult<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("apphost-bundle")
            .join("tools");

        fs::create_dir_all(&cache_dir)?;

        let rcedit_path = cache_dir.join("rcedit-x64.exe");

        if let Ok(metadata) = fs::metadata(&rcedit_path) {
            // Verify file size to detect corrupted downloads
            if metadata.len() >= Self::RCEDIT_MIN_SIZE {
                tracing::debug!("Using cached rcedit at: {}", rcedit_path.display());
                return Ok(rcedit_path);
            }
            tracing::warn!(
                "Cached rcedit is too small ({} bytes), re-downloading...",
                metadata.len()
            );
            let _ = fs::remove_file(&rcedit_path);
        }

        tracing::info!("Downloading rcedit {}...", RCEDIT_VERSION);
        let url = RCEDIT_DOWNLOAD_URL.replace("{version}", RCEDIT_VERSION);
        let response = Self::download_file(&url)?;

        if (response.len() as u64) < Self::RCEDIT_MIN_SIZE {
            return Err(BinaryPatchError::ResourceEdit(format!(
                "Downloaded rcedit is too small ({} bytes), expected at least {} bytes. \
                 Download may have failed.",
                response.len(),
                Self::RCEDIT_MIN_SIZE
            )));
        }

        let mut file = fs::File::create(&rcedit_path)?;
        file.write_all(&response)?;

        tracing::info!(
            "rcedit downloaded to: {} ({} bytes)",
            rcedit_path.display(),
            response.len()
        );
        Ok(rcedit_path)
    }

    /// Download a file from URL
    fn download_file(url: &str) -> PatchResult<Vec<u8>> {
        #[cfg(target_os = "windows")]
        {
            let temp_file = std::env::temp_dir().join("rcedit-download.exe");
            let output = Command::new("powershell")
                .args([
                    "-NoProfile",
                    "-NonInteractive",
                    "-Command",
                    &format!(
                        "[Net.ServicePointManager]::SecurityProtocol = [Net.SecurityProtocolType]::Tls12; \
                         Invoke-WebRequest -Uri '{}' -OutFile '{}' -UseBasicParsing",
                        url,
                        temp_file.display()
                    ),
                ])
                .output()
                .map_err(|e| {
                    BinaryPatchError::ResourceEdit(format!("Failed to run PowerShell: {}", e))
                })?;

            if !output.status.success() {
                return Err(BinaryPatchError::ResourceEdit(format!(
                    "Failed to download rcedit: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let data = fs::read(&temp_file)?;
            let _ = fs::remove_file(&temp_file);
            Ok(data)
        }

        #[cfg(not(target_os = "windows"))]
        {
            let output = Command::new("curl")
                .args(["-fsSL", url])
                .output()
                .map_err(|e| BinaryPatchError::ResourceEdit(format!("Failed to run curl: {}", e)))?;

            if !output.status.success() {
                return Err(BinaryPatchError::ResourceEdit(format!(
                    "Failed to download rcedit: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            Ok(output.stdout)
        }
    }

    /// Run rcedit against `exe_path` with the given arguments
    fn run(&self, exe_path: &Path, args: &[&str], what: &str) -> PatchResult<()> {
        let output = Command::new(&self.rcedit_path)
            .arg(exe_path)
            .args(args)
            .output()
            .map_err(|e| BinaryPatchError::ResourceEdit(format!("Failed to run rcedit: {}", e)))?;

        if !output.status.success() {
            return Err(BinaryPatchError::ResourceEdit(format!(
                "rcedit failed to {} on {}: {}",
                what,
                exe_path.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }

    /// Set the icon of an executable from an .ico file
    pub fn set_icon(&self, exe_path: &Path, icon_path: &Path) -> PatchResult<()> {
        tracing::debug!("Setting icon: {}", icon_path.display());
        self.run(
            exe_path,
            &["--set-icon", &icon_path.to_string_lossy()],
            "set icon",
        )
    }

    /// Set a version string resource (e.g. "FileDescription", "ProductName")
    pub fn set_version_string(&self, exe_path: &Path, key: &str, value: &str) -> PatchResult<()> {
        tracing::debug!("Setting version string {}: {}", key, value);
        self.run(
            exe_path,
            &["--set-version-string", key, value],
            "set version string",
        )
    }

    /// Set the fixed file version (e.g. "1.0.0.0")
    pub fn set_file_version(&self, exe_path: &Path, version: &str) -> PatchResult<()> {
        tracing::debug!("Setting file version: {}", version);
        self.run(exe_path, &["--set-file-version", version], "set file version")
    }

    /// Set the fixed product version (e.g. "1.0.0.0")
    pub fn set_product_version(&self, exe_path: &Path, version: &str) -> PatchResult<()> {
        tracing::debug!("Setting product version: {}", version);
        self.run(
            exe_path,
            &["--set-product-version", version],
            "set product version",
        )
    }

    /// Replace the embedded application manifest
    pub fn set_application_manifest(
        &self,
        exe_path: &Path,
        manifest_path: &Path,
    ) -> PatchResult<()> {
        tracing::debug!("Setting application manifest: {}", manifest_path.display());
        self.run(
            exe_path,
            &["--application-manifest", &manifest_path.to_string_lossy()],
            "set application manifest",
        )
    }
}

// ============================================================================
// Resource Updater
// ============================================================================

/// Copies native resources from a PE module into an executable
pub struct ResourceUpdater {
    destination: PathBuf,
    icon: Option<Vec<u8>>,
    version: Option<VersionInfo>,
    manifest: Option<Vec<u8>>,
}

impl ResourceUpdater {
    /// Whether resources can be written on this platform
    pub fn is_supported_os() -> bool {
        cfg!(target_os = "windows")
    }

    /// Start an update of `destination`
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            icon: None,
            version: None,
            manifest: None,
        }
    }

    /// Collect icon, version and manifest resources from a PE module
    pub fn add_resources_from_pe_image(self, source: &Path) -> PatchResult<Self> {
        let image = fs::read(source)?;
        if !pe::is_pe_image(&image) {
            return Err(BinaryPatchError::ResourceEdit(format!(
                "{} is not a PE image",
                source.display()
            )));
        }

        let resources = pe::resources(&image).unwrap_or_default();
        tracing::debug!(
            "Found {} resources in {}",
            resources.len(),
            source.display()
        );
        Ok(self.add_resources(&resources))
    }

    /// Collect icon, version and manifest resources from decoded resources
    pub fn add_resources(mut self, resources: &[PeResource]) -> Self {
        let first_of = |kind: u16| resources.iter().find(|r| r.kind == ResourceId::Id(kind));

        if let Some(group) = first_of(RT_GROUP_ICON) {
            self.icon = build_ico(&group.data, resources);
        }
        if let Some(version) = first_of(RT_VERSION) {
            self.version = VersionInfo::parse(&version.data);
        }
        if let Some(manifest) = first_of(RT_MANIFEST) {
            self.manifest = Some(manifest.data.clone());
        }

        self
    }

    /// Whether anything was collected
    pub fn has_resources(&self) -> bool {
        self.icon.is_some() || self.version.is_some() || self.manifest.is_some()
    }

    /// Rebuilt .ico file of the collected icon group
    pub fn icon(&self) -> Option<&[u8]> {
        self.icon.as_deref()
    }

    /// Collected version information
    pub fn version(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }

    /// Collected application manifest
    pub fn manifest(&self) -> Option<&[u8]> {
        self.manifest.as_deref()
    }

    /// Write the collected resources into the destination
    pub fn update(self) -> PatchResult<()> {
        if !self.has_resources() {
            return Ok(());
        }
        let editor = ResourceEditor::new()?;
        self.update_with(&editor)
    }

    /// Write the collected resources using a specific editor
    pub fn update_with(self, editor: &ResourceEditor) -> PatchResult<()> {
        let exe = &self.destination;

        if let Some(icon) = &self.icon {
            let file = write_temp(icon, ".ico")?;
            editor.set_icon(exe, file.path())?;
        }

        if let Some(version) = &self.version {
            if let Some(v) = &version.file_version {
                editor.set_file_version(exe, v)?;
            }
            if let Some(v) = &version.product_version {
                editor.set_product_version(exe, v)?;
            }
            for (key, value) in &version.strings {
                editor.set_version_string(exe, key, value)?;
            }
        }

        if let Some(manifest) = &self.manifest {
            let file = write_temp(manifest, ".manifest")?;
            editor.set_application_manifest(exe, file.path())?;
        }

        tracing::info!("Resources copied into {}", exe.display());
        Ok(())
    }
}

fn write_temp(data: &[u8], suffix: &str) -> PatchResult<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("apphost-resource")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

// ============================================================================
// Icons
// ============================================================================

const GROUP_ENTRY_SIZE: usize = 14;
const ICO_ENTRY_SIZE: usize = 16;
const ICO_HEADER_SIZE: usize = 6;

/// Rebuild an .ico file from an `RT_GROUP_ICON` directory and its `RT_ICON` images
pub fn build_ico(group: &[u8], resources: &[PeResource]) -> Option<Vec<u8>> {
    let count = u16::from_le_bytes([*group.get(4)?, *group.get(5)?]) as usize;
    if count == 0 {
        return None;
    }

    let mut images = Vec::with_capacity(count);
    for index in 0..count {
        let start = ICO_HEADER_SIZE + index * GROUP_ENTRY_SIZE;
        let entry = group.get(start..start + GROUP_ENTRY_SIZE)?;
        let id = u16::from_le_bytes([entry[12], entry[13]]);
        let image = resources
            .iter()
            .find(|r| r.kind == ResourceId::Id(RT_ICON) && r.name == ResourceId::Id(id))?;
        images.push((&entry[..8], &image.data));
    }

    let mut ico = Vec::new();
    ico.extend_from_slice(&[0, 0, 1, 0]);
    ico.extend_from_slice(&(count as u16).to_le_bytes());

    let mut offset = ICO_HEADER_SIZE + count * ICO_ENTRY_SIZE;
    for (header, data) in &images {
        ico.extend_from_slice(header);
        ico.extend_from_slice(&(data.len() as u32).to_le_bytes());
        ico.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += data.len();
    }
    for (_, data) in &images {
        ico.extend_from_slice(data);
    }

    Some(ico)
}

// ============================================================================
// Version Info
// ============================================================================

const VS_FIXEDFILEINFO_SIGNATURE: u32 = 0xFEEF_04BD;

/// Decoded `VS_VERSIONINFO` resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    /// Fixed file version, "a.b.c.d"
    pub file_version: Option<String>,
    /// Fixed product version, "a.b.c.d"
    pub product_version: Option<String>,
    /// String table of the first language
    pub strings: Vec<(String, String)>,
}

struct Block<'a> {
    key: String,
    is_text: bool,
    value: &'a [u8],
    children: std::ops::Range<usize>,
    end: usize,
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_block(data: &[u8], start: usize) -> Option<Block<'_>> {
    let length = u16_at(data, start)? as usize;
    let value_length = u16_at(data, start + 2)? as usize;
    let is_text = u16_at(data, start + 4)? == 1;
    let end = start + length;
    if length < 6 || end > data.len() {
        return None;
    }

    let mut pos = start + 6;
    let mut units = Vec::new();
    loop {
        if pos + 2 > end {
            return None;
        }
        let unit = u16_at(data, pos)?;
        pos += 2;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    let key = String::from_utf16(&units).ok()?;

    let value_start = align4(pos).min(end);
    let value_bytes = if is_text { value_length * 2 } else { value_length };
    let value_end = (value_start + value_bytes).min(end);

    Some(Block {
        key,
        is_text,
        value: &data[value_start..value_end],
        children: align4(value_end).min(end)..end,
        end,
    })
}

fn child_blocks<'a>(data: &'a [u8], range: std::ops::Range<usize>) -> Vec<Block<'a>> {
    let mut blocks = Vec::new();
    let mut pos = range.start;
    while pos < range.end {
        let Some(block) = parse_block(data, pos) else {
            break;
        };
        pos = align4(block.end);
        blocks.push(block);
    }
    blocks
}

fn utf16_text(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn version_string(ms: u32, ls: u32) -> String {
    format!("{}.{}.{}.{}", ms >> 16, ms & 0xFFFF, ls >> 16, ls & 0xFFFF)
}

impl VersionInfo {
    /// Decode a `VS_VERSIONINFO` resource
    pub fn parse(data: &[u8]) -> Option<Self> {
        let root = parse_block(data, 0)?;
        if root.key != "VS_VERSION_INFO" {
            return None;
        }

        let mut info = VersionInfo::default();
        if u32_at(root.value, 0) == Some(VS_FIXEDFILEINFO_SIGNATURE) {
            info.file_version = Some(version_string(
                u32_at(root.value, 8)?,
                u32_at(root.value, 12)?,
            ));
            info.product_version = Some(version_string(
                u32_at(root.value, 16)?,
                u32_at(root.value, 20)?,
            ));
        }

        let string_tables = child_blocks(data, root.children)
            .into_iter()
            .filter(|block| block.key == "StringFileInfo")
            .flat_map(|block| child_blocks(data, block.children));

        if let Some(table) = string_tables.into_iter().next() {
            for entry in child_blocks(data, table.children) {
                let value = if entry.is_text {
                    utf16_text(entry.value)
                } else {
                    String::from_utf8_lossy(entry.value).into_owned()
                };
                info.strings.push((entry.key, value));
            }
        }

        Some(info)
    }
}
