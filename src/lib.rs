//! apphost-bundle - Single-File Application Bundles
//!
//! This crate packages a managed application, its dependencies and a native
//! launcher ("apphost") into one executable, and restores the embedded files
//! from such an executable.
//!
//! # Components
//!
//! - **Manifest codec**: the metadata directory and footer appended to a bundle
//! - **Bundler**: copies the host and appends files with assembly alignment
//! - **Extractor**: reads the manifest back and spills files to a directory
//! - **Apphost patcher**: writes the app path or the bundle header offset into
//!   placeholders of a launcher template, optionally switching it to the
//!   Windows GUI subsystem and copying Win32 resources into it
//!
//! # Quick Start
//!
//! ```no_run
//! use apphost_bundle::{extract_files, BundleOptions, Bundler};
//! use std::path::Path;
//!
//! let bundler = Bundler::new(BundleOptions::new("app.exe", "./out"));
//! let bundle = bundler.generate_bundle_from_dir(Path::new("./publish"))?;
//!
//! let manifest = extract_files(&bundle, "./restored")?;
//! println!("{} files restored", manifest.files.len());
//! # Ok::<(), apphost_bundle::BundleError>(())
//! ```
//!
//! # Technical Details
//!
//! ## Bundle Layout
//!
//! ```text
//! [Host executable]
//! [Embedded files]          - assemblies aligned to 16 bytes
//! [Directory]
//!   - Per entry: name (7-bit length + UTF-8), offset i64, size i64
//!   - Grouped: deps.json, runtimeconfig.json, main app, assemblies, others
//! [Footer]                  - 43 bytes
//!   - Major / minor version: u32, u32 (0.1)
//!   - Directory offset: i64
//!   - File count, assembly count, flags: i32 each
//!   - Signature: "\x0e.NetCoreBundle" (15 bytes)
//! ```
//!
//! All integers are little-endian.

mod apphost;
mod bundler;
mod config;
mod error;
mod extractor;
mod manifest;
pub mod pe;
pub mod progress;
mod resource_editor;

// Re-export public API
pub use apphost::{
    is_pe_image, search_and_replace, update_app_path, update_bundle_header,
    APP_BINARY_PATH_PLACEHOLDER, BUNDLE_HEADER_PLACEHOLDER, MAX_APP_PATH_LENGTH,
};
pub use bundler::{BundleOutput, Bundler, FileSpec, ASSEMBLY_ALIGNMENT};
pub use config::{AppHostSection, BundleConfig, BundleOptions, BundleSection, CONFIG_FILE_NAME};
pub use error::{
    BinaryPatchError, BundleError, BundleResult, FormatError, PatchResult, ReplaceError,
};
pub use extractor::{extract_files, Extractor};
pub use manifest::{
    BundleFlags, FileEntry, FileKind, Manifest, BUNDLE_SIGNATURE, FOOTER_LENGTH, MAJOR_VERSION,
    MINOR_VERSION, SIGNATURE_LENGTH,
};
pub use progress::{progress_bar, ProgressExt, ProgressStyles};
pub use resource_editor::{build_ico, ResourceEditor, ResourceUpdater, VersionInfo};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if the current executable is a bundle
pub fn is_bundled() -> bool {
    let exe_path = match std::env::current_exe() {
        Ok(p) => p,
        Err(_) => return false,
    };
    Extractor::is_bundle(&exe_path).unwrap_or(false)
}

/// Read the manifest of the current executable
pub fn read_current_manifest() -> BundleResult<Manifest> {
    let exe_path = std::env::current_exe()?;
    Extractor::read_manifest(&exe_path)
}
