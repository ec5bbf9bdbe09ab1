//! Bundler configuration
//!
//! [`BundleOptions`] is the explicit, immutable set of options handed to a
//! [`Bundler`](crate::Bundler). [`BundleConfig`] is the declarative form read
//! from a `bundle.toml` file, covering both bundling and apphost patching:
//!
//! ```toml
//! [bundle]
//! host_name = "app.exe"
//! source_dir = "./publish"
//! output_dir = "./out"
//! embed_pdbs = false
//!
//! [apphost]
//! template = "./apphost.exe"
//! destination = "./obj/app.exe"
//! app_path = "app.dll"
//! windows_gui = false
//! resources_from = "./obj/app.dll"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::{BundleError, BundleResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name
pub const CONFIG_FILE_NAME: &str = "bundle.toml";

// ============================================================================
// Bundle Options
// ============================================================================

/// Options for a single bundle operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOptions {
    /// File name of the host executable, also the name of the bundle
    pub host_name: String,

    /// Directory the bundle is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Embed `.pdb` files
    #[serde(default)]
    pub embed_pdbs: bool,

    /// Show a progress bar while embedding
    #[serde(default)]
    pub show_progress: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl BundleOptions {
    /// Create options for a host name and output directory
    ///
    /// An empty output directory means the current directory.
    pub fn new(host_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            host_name: host_name.into(),
            output_dir: if output_dir.as_os_str().is_empty() {
                default_output_dir()
            } else {
                output_dir
            },
            embed_pdbs: false,
            show_progress: false,
        }
    }

    /// Set the output directory
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set whether `.pdb` files are embedded
    pub fn with_embed_pdbs(mut self, embed: bool) -> Self {
        self.embed_pdbs = embed;
        self
    }

    /// Set whether a progress bar is shown
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

// ============================================================================
// Config File
// ============================================================================

/// `[bundle]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSection {
    /// Host executable name within `source_dir`
    pub host_name: String,

    /// Directory holding the published app
    pub source_dir: PathBuf,

    /// Output directory (defaults to the config directory)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub embed_pdbs: bool,

    #[serde(default)]
    pub show_progress: bool,
}

/// `[apphost]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppHostSection {
    /// Launcher template containing the placeholders
    pub template: PathBuf,

    /// Where the patched launcher is written
    pub destination: PathBuf,

    /// App binary path embedded into the launcher
    pub app_path: String,

    /// Switch a console launcher to the GUI subsystem
    #[serde(default)]
    pub windows_gui: bool,

    /// Module whose Win32 resources are copied into the launcher
    #[serde(default)]
    pub resources_from: Option<PathBuf>,
}

/// Contents of a `bundle.toml` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default)]
    pub bundle: Option<BundleSection>,

    #[serde(default)]
    pub apphost: Option<AppHostSection>,
}

impl BundleConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> BundleResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BundleError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> BundleResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Find `bundle.toml` in a directory
    pub fn find_in_dir(dir: impl AsRef<Path>) -> Option<PathBuf> {
        let candidate = dir.as_ref().join(CONFIG_FILE_NAME);
        candidate.is_file().then_some(candidate)
    }

    fn bundle_section(&self) -> BundleResult<&BundleSection> {
        self.bundle
            .as_ref()
            .ok_or_else(|| BundleError::Config("missing [bundle] section".to_string()))
    }

    /// Bundle options with paths resolved against `base_dir`
    pub fn bundle_options(&self, base_dir: &Path) -> BundleResult<BundleOptions> {
        let section = self.bundle_section()?;
        if section.host_name.is_empty() {
            return Err(BundleError::Config("bundle.host_name is empty".to_string()));
        }

        let output_dir = match &section.output_dir {
            Some(dir) => resolve(base_dir, dir),
            None => base_dir.to_path_buf(),
        };

        Ok(BundleOptions::new(section.host_name.clone(), output_dir)
            .with_embed_pdbs(section.embed_pdbs)
            .with_progress(section.show_progress))
    }

    /// Source directory with the path resolved against `base_dir`
    pub fn source_dir(&self, base_dir: &Path) -> BundleResult<PathBuf> {
        Ok(resolve(base_dir, &self.bundle_section()?.source_dir))
    }

    /// `[apphost]` section with paths resolved against `base_dir`
    pub fn apphost(&self, base_dir: &Path) -> BundleResult<AppHostSection> {
        let section = self
            .apphost
            .as_ref()
            .ok_or_else(|| BundleError::Config("missing [apphost] section".to_string()))?;

        Ok(AppHostSection {
            template: resolve(base_dir, &section.template),
            destination: resolve(base_dir, &section.destination),
            app_path: section.app_path.clone(),
            windows_gui: section.windows_gui,
            resources_from: section
                .resources_from
                .as_ref()
                .map(|p| resolve(base_dir, p)),
        })
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
