//! Apphost patching
//!
//! A prebuilt launcher template carries two placeholder byte sequences that
//! are only discoverable by scanning its bytes:
//!
//! - the app binary path placeholder, backed by a 1024-byte buffer, which is
//!   overwritten with the path of the managed entry assembly;
//! - the bundle header placeholder, overwritten with the 8-byte offset of
//!   the bundle header when the launcher becomes a single-file bundle.
//!
//! Both placeholders are long hex strings that do not occur by chance, so
//! an exact substring scan is enough to find them. The template is copied to
//! a staging file next to the destination, rewritten in place through a
//! memory map, and renamed over the destination once every step succeeded.

use crate::pe::{PeHeaders, IMAGE_SUBSYSTEM_WINDOWS_CUI, IMAGE_SUBSYSTEM_WINDOWS_GUI};
use crate::resource_editor::ResourceUpdater;
use crate::{BinaryPatchError, PatchResult, ReplaceError};
use memmap2::MmapMut;
use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;
use tempfile::TempPath;

/// Marks where the app binary path is written
pub const APP_BINARY_PATH_PLACEHOLDER: &str =
    "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2";

/// Marks where the bundle header offset is written
pub const BUNDLE_HEADER_PLACEHOLDER: &str =
    "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f3";

/// Capacity of the app binary path buffer in the launcher
pub const MAX_APP_PATH_LENGTH: usize = 1024;

/// Create an apphost with the app binary path embedded
///
/// # Arguments
/// * `template` - Launcher template containing the placeholder
/// * `destination` - Path of the patched launcher, including the file name
/// * `app_binary_path` - Path of the app binary, absolute or relative to the launcher
/// * `windows_gui` - Switch the launcher to the GUI subsystem (PE only)
/// * `resource_source` - Module whose icon, version info and manifest are
///   copied into the launcher (PE only, where resource editing is supported)
pub fn update_app_path(
    template: &Path,
    destination: &Path,
    app_binary_path: &str,
    windows_gui: bool,
    resource_source: Option<&Path>,
) -> PatchResult<()> {
    let path_bytes = app_binary_path.as_bytes();
    if path_bytes.len() > MAX_APP_PATH_LENGTH {
        return Err(BinaryPatchError::PathTooLong {
            path: app_binary_path.to_string(),
            len: path_bytes.len(),
            max: MAX_APP_PATH_LENGTH,
        });
    }

    let staged = stage_template(template, destination)?;

    let is_pe_image = with_mapped_file(&staged, |data| {
        replace_placeholder(data, template, APP_BINARY_PATH_PLACEHOLDER, path_bytes)?;

        let headers = PeHeaders::parse(data);
        if windows_gui {
            let headers = headers
                .as_ref()
                .ok_or_else(|| BinaryPatchError::NotWindowsExecutable {
                    path: template.to_path_buf(),
                })?;
            set_windows_gui_subsystem(data, headers, template)?;
        }

        Ok(headers.is_some())
    })?;

    if let Some(source) = resource_source {
        if is_pe_image && ResourceUpdater::is_supported_os() {
            ResourceUpdater::new(&*staged)
                .add_resources_from_pe_image(source)?
                .update()?;
        } else {
            tracing::debug!(
                "Skipping resource copy from {} (PE: {})",
                source.display(),
                is_pe_image
            );
        }
    }

    touch(&staged)?;
    commit(staged, destination)?;

    tracing::info!(
        "Apphost created: {} -> {}",
        destination.display(),
        app_binary_path
    );
    Ok(())
}

/// Create an apphost with the bundle header offset embedded
pub fn update_bundle_header(
    template: &Path,
    destination: &Path,
    header_offset: u64,
) -> PatchResult<()> {
    let staged = stage_template(template, destination)?;

    with_mapped_file(&staged, |data| {
        replace_placeholder(
            data,
            template,
            BUNDLE_HEADER_PLACEHOLDER,
            &header_offset.to_le_bytes(),
        )
    })?;

    touch(&staged)?;
    commit(staged, destination)?;

    tracing::info!(
        "Bundle header offset {} written to {}",
        header_offset,
        destination.display()
    );
    Ok(())
}

/// Replace the first occurrence of `pattern` in `data`
///
/// The replacement is zero-padded to the length of the pattern. Returns the
/// offset of the pattern. Nothing is written when the pattern is absent or
/// the replacement would run past the end of `data`.
pub fn search_and_replace(
    data: &mut [u8],
    pattern: &[u8],
    replacement: &[u8],
) -> Result<usize, ReplaceError> {
    if pattern.is_empty() {
        return Err(ReplaceError::PatternNotFound);
    }

    let offset = data
        .windows(pattern.len())
        .position(|window| window == pattern)
        .ok_or(ReplaceError::PatternNotFound)?;

    let span = pattern.len().max(replacement.len());
    let available = data.len() - offset;
    let Some(target) = data.get_mut(offset..offset + span) else {
        return Err(ReplaceError::NoRoom {
            offset,
            needed: span,
            available,
        });
    };

    target[..replacement.len()].copy_from_slice(replacement);
    target[replacement.len()..].fill(0);
    Ok(offset)
}

fn replace_placeholder(
    data: &mut [u8],
    template: &Path,
    placeholder: &'static str,
    replacement: &[u8],
) -> PatchResult<()> {
    match search_and_replace(data, placeholder.as_bytes(), replacement) {
        Ok(offset) => {
            tracing::debug!("Placeholder replaced at offset 0x{:X}", offset);
            Ok(())
        }
        Err(ReplaceError::PatternNotFound) => Err(BinaryPatchError::PlaceholderNotFound {
            path: template.to_path_buf(),
            placeholder,
        }),
        Err(ReplaceError::NoRoom {
            needed, available, ..
        }) => Err(BinaryPatchError::ReplacementDoesNotFit {
            path: template.to_path_buf(),
            placeholder,
            needed,
            available,
        }),
    }
}

/// Check whether `data` is a PE image
pub fn is_pe_image(data: &[u8]) -> bool {
    crate::pe::is_pe_image(data)
}

fn set_windows_gui_subsystem(data: &mut [u8], headers: &PeHeaders, path: &Path) -> PatchResult<()> {
    if headers.subsystem != IMAGE_SUBSYSTEM_WINDOWS_CUI {
        return Err(BinaryPatchError::NotConsoleSubsystem {
            path: path.to_path_buf(),
        });
    }

    let offset = headers.subsystem_offset();
    data[offset..offset + 2].copy_from_slice(&IMAGE_SUBSYSTEM_WINDOWS_GUI.to_le_bytes());

    tracing::debug!("Subsystem field written at offset 0x{:X}", offset);
    Ok(())
}

/// Copy the template to a staging file in the destination directory
///
/// The copy inherits the template's permissions. The staging file is removed
/// on drop unless [`commit`] moves it into place.
fn stage_template(template: &Path, destination: &Path) -> PatchResult<TempPath> {
    if let (Ok(t), Ok(d)) = (fs::canonicalize(template), fs::canonicalize(destination)) {
        if t == d {
            return Err(BinaryPatchError::DestinationIsTemplate {
                path: destination.to_path_buf(),
            });
        }
    }

    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let staged = tempfile::Builder::new()
        .prefix(".apphost")
        .tempfile_in(dir)?
        .into_temp_path();
    fs::copy(template, &staged)?;
    Ok(staged)
}

/// Rename the staged file over the destination
fn commit(staged: TempPath, destination: &Path) -> PatchResult<()> {
    staged.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

/// Run `patch` over a read-write map of `path`
///
/// The map is flushed and dropped before returning, on success and on error.
fn with_mapped_file<T>(
    path: &Path,
    patch: impl FnOnce(&mut [u8]) -> PatchResult<T>,
) -> PatchResult<T> {
    let file = File::options().read(true).write(true).open(path)?;
    // SAFETY: the destination is a private copy created by this module and
    // is not resized or mapped elsewhere while the map is alive.
    let mut map = unsafe { MmapMut::map_mut(&file)? };

    let result = patch(&mut map[..]);
    map.flush()?;
    drop(map);

    result
}

/// Memory-mapped writes do not update the modification time
fn touch(path: &Path) -> PatchResult<()> {
    let file = File::options().write(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}
