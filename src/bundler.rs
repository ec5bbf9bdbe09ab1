//! Bundle writer: embeds an app and its dependencies into the host binary

use crate::config::BundleOptions;
use crate::manifest::{FileEntry, FileKind, Manifest};
use crate::pe;
use crate::progress::{progress_bar, ProgressExt};
use crate::{BundleError, BundleResult};
use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Embedded assemblies start on this boundary so they can be loaded
/// directly from a memory-mapped bundle.
pub const ASSEMBLY_ALIGNMENT: u64 = 16;

/// A file to embed: where it is now and where the app expects it at run time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Path to the file at bundle time
    pub source_path: PathBuf,
    /// Path relative to the app, `/`-separated
    pub relative_path: String,
}

impl FileSpec {
    pub fn new(source_path: impl Into<PathBuf>, relative_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            relative_path: relative_path.into(),
        }
    }
}

/// Result of a bundle operation
#[derive(Debug, Clone, Serialize)]
pub struct BundleOutput {
    /// Path to the generated bundle
    pub bundle_path: PathBuf,
    /// Size of the bundle in bytes
    pub size: u64,
    /// Offset of the metadata directory
    pub file_entry_start: u64,
    /// Main application plus managed assemblies
    pub assembly_count: i32,
    /// Embedded entries in embedding order
    pub entries: Vec<FileEntry>,
}

impl BundleOutput {
    /// Placement report as pretty-printed JSON
    pub fn to_json(&self) -> BundleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Produces single-file bundles
pub struct Bundler {
    options: BundleOptions,
    main_app: String,
    deps_json: String,
    runtime_config_json: String,
    runtime_config_dev_json: String,
}

impl Bundler {
    /// Create a bundler for the given options
    pub fn new(options: BundleOptions) -> Self {
        let base_name = Path::new(&options.host_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            main_app: format!("{}.dll", base_name),
            deps_json: format!("{}.deps.json", base_name),
            runtime_config_json: format!("{}.runtimeconfig.json", base_name),
            runtime_config_dev_json: format!("{}.runtimeconfig.dev.json", base_name),
            options,
        }
    }

    /// Bundle format version
    pub fn version() -> String {
        Manifest::version()
    }

    /// Options this bundler was created with
    pub fn options(&self) -> &BundleOptions {
        &self.options
    }

    /// Path the bundle will be written to
    pub fn bundle_path(&self) -> PathBuf {
        self.options.output_dir.join(&self.options.host_name)
    }

    /// Generate a bundle from explicit file specifications
    ///
    /// Files are embedded in the given order; callers sort them for
    /// reproducible output. Returns the path of the bundle.
    pub fn generate_bundle(&self, file_specs: &[FileSpec]) -> BundleResult<PathBuf> {
        Ok(self.generate_bundle_with_output(file_specs)?.bundle_path)
    }

    /// Generate a bundle from every file under `source_dir`
    ///
    /// Files are ordered by an ordinal comparison of their relative paths so
    /// the same directory always yields the same bundle.
    pub fn generate_bundle_from_dir(&self, source_dir: &Path) -> BundleResult<PathBuf> {
        let specs = Self::collect_file_specs(source_dir)?;
        self.generate_bundle(&specs)
    }

    /// Enumerate `source_dir` recursively into sorted file specifications
    pub fn collect_file_specs(source_dir: &Path) -> BundleResult<Vec<FileSpec>> {
        if !source_dir.is_dir() {
            return Err(BundleError::Argument(format!(
                "Directory not found: {}",
                source_dir.display()
            )));
        }

        let mut specs = Vec::new();
        for entry in WalkDir::new(source_dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                BundleError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::other("directory walk failed")),
                )
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(source_dir).map_err(|e| {
                BundleError::Argument(format!("{}: {}", entry.path().display(), e))
            })?;

            // Normalize path separators to forward slashes
            let relative_str = relative.to_string_lossy().replace('\\', "/");
            specs.push(FileSpec::new(entry.path(), relative_str));
        }

        specs.sort_by(|a, b| a.relative_path.as_bytes().cmp(b.relative_path.as_bytes()));
        Ok(specs)
    }

    /// Generate a bundle and report where every entry landed
    pub fn generate_bundle_with_output(
        &self,
        file_specs: &[FileSpec],
    ) -> BundleResult<BundleOutput> {
        tracing::info!("Bundler version {}", Self::version());

        let host_source = self.validate(file_specs)?;

        fs::create_dir_all(&self.options.output_dir)?;
        let bundle_path = self.bundle_path();
        if let (Ok(host), Ok(bundle)) = (
            fs::canonicalize(host_source),
            fs::canonicalize(&bundle_path),
        ) {
            if host == bundle {
                return Err(BundleError::Argument(format!(
                    "Bundle output {} would overwrite the host it is built from",
                    bundle_path.display()
                )));
            }
        }
        if bundle_path.exists() {
            tracing::warn!("Overwriting existing file {}", bundle_path.display());
        }

        // Start with a copy of the host so its permissions carry over
        fs::copy(host_source, &bundle_path)?;

        let file = File::options().write(true).open(&bundle_path)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::End(0))?;

        let progress = if self.options.show_progress {
            progress_bar(file_specs.len() as u64, "Embedding files")
        } else {
            ProgressBar::hidden()
        };

        let mut manifest = Manifest::new();
        for spec in file_specs {
            if !self.should_embed(&spec.relative_path) {
                tracing::debug!("Skip: {}", spec.relative_path);
                progress.inc(1);
                continue;
            }

            let mut file = File::open(&spec.source_path)?;
            let kind = self.infer_kind(&spec.relative_path, &mut file);
            let (offset, size) = add_to_bundle(&mut writer, &mut file, kind)?;

            let entry = manifest.add_entry(kind, spec.relative_path.clone(), offset, size);
            tracing::debug!("Embed: {}", entry);
            progress.tick_with_message(&spec.relative_path);
        }

        let file_entry_start = manifest.write(&mut writer)?;
        let size = writer.stream_position()?;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        progress.finish_success(&format!("Bundled {} files", manifest.files.len()));
        tracing::info!(
            "Bundle: Path={} Size={} Files={} Assemblies={}",
            bundle_path.display(),
            size,
            manifest.files.len(),
            manifest.assembly_count
        );

        Ok(BundleOutput {
            bundle_path,
            size,
            file_entry_start,
            assembly_count: manifest.assembly_count,
            entries: manifest.files,
        })
    }

    /// Check the input set and return the host's source path
    fn validate<'a>(&self, file_specs: &'a [FileSpec]) -> BundleResult<&'a Path> {
        let host_name = &self.options.host_name;
        let mut hosts = file_specs.iter().filter(|s| &s.relative_path == host_name);
        let host = match (hosts.next(), hosts.next()) {
            (Some(host), None) => host,
            _ => {
                return Err(BundleError::Argument(format!(
                    "Input must uniquely specify the host binary '{}'",
                    host_name
                )))
            }
        };

        let main_apps = file_specs
            .iter()
            .filter(|s| s.relative_path == self.main_app)
            .count();
        if main_apps != 1 {
            return Err(BundleError::Argument(format!(
                "Input must uniquely specify the main application '{}'",
                self.main_app
            )));
        }

        let mut seen = HashSet::new();
        for spec in file_specs {
            if !seen.insert(spec.relative_path.as_str()) {
                return Err(BundleError::Argument(format!(
                    "Duplicate relative path '{}' ({})",
                    spec.relative_path,
                    spec.source_path.display()
                )));
            }
        }

        Ok(host.source_path.as_path())
    }

    /// Whether a file takes part in the bundle
    pub fn should_embed(&self, relative_path: &str) -> bool {
        if relative_path == self.options.host_name {
            // The bundle starts with the host
            return false;
        }

        if relative_path == self.runtime_config_dev_json {
            // Machine-specific configuration
            return false;
        }

        let is_pdb = Path::new(relative_path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdb"));
        if is_pdb {
            return self.options.embed_pdbs;
        }

        true
    }

    /// Classify a file for run-time handling
    pub fn infer_kind<R: Read + Seek>(&self, relative_path: &str, file: &mut R) -> FileKind {
        if relative_path == self.deps_json {
            return FileKind::DepsJson;
        }

        if relative_path == self.runtime_config_json {
            return FileKind::RuntimeConfigJson;
        }

        if relative_path == self.main_app {
            return FileKind::MainApplication;
        }

        if pe::is_il_only(file) {
            return FileKind::ManagedAssembly;
        }

        FileKind::Other
    }
}

/// Append `file` to the bundle, aligning assemblies
///
/// Returns the start offset and length of the embedded content.
fn add_to_bundle<W, R>(bundle: &mut W, file: &mut R, kind: FileKind) -> io::Result<(u64, u64)>
where
    W: Write + Seek,
    R: Read + Seek,
{
    let mut position = bundle.stream_position()?;

    if kind.requires_alignment() {
        let misalignment = position % ASSEMBLY_ALIGNMENT;
        if misalignment != 0 {
            let padding = ASSEMBLY_ALIGNMENT - misalignment;
            bundle.write_all(&[0u8; ASSEMBLY_ALIGNMENT as usize][..padding as usize])?;
            position += padding;
        }
    }

    file.seek(SeekFrom::Start(0))?;
    let size = io::copy(file, bundle)?;
    Ok((position, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn bundler() -> Bundler {
        Bundler::new(BundleOptions::new("app.exe", "out"))
    }

    #[test]
    fn test_derived_names() {
        let bundler = bundler();
        assert_eq!(bundler.main_app, "app.dll");
        assert_eq!(bundler.deps_json, "app.deps.json");
        assert_eq!(bundler.runtime_config_json, "app.runtimeconfig.json");
        assert_eq!(bundler.runtime_config_dev_json, "app.runtimeconfig.dev.json");
        assert_eq!(bundler.bundle_path(), PathBuf::from("out").join("app.exe"));
    }

    #[test]
    fn test_should_embed() {
        let bundler = bundler();
        assert!(!bundler.should_embed("app.exe"));
        assert!(!bundler.should_embed("app.runtimeconfig.dev.json"));
        assert!(!bundler.should_embed("app.pdb"));
        assert!(!bundler.should_embed("sub/Lib.PDB"));
        assert!(bundler.should_embed("app.dll"));
        assert!(bundler.should_embed("app.runtimeconfig.json"));
        assert!(bundler.should_embed("native.so"));

        let with_pdbs = Bundler::new(BundleOptions::new("app.exe", "out").with_embed_pdbs(true));
        assert!(with_pdbs.should_embed("app.pdb"));
        assert!(!with_pdbs.should_embed("app.exe"));
    }

    #[test]
    fn test_infer_kind_by_name() {
        let bundler = bundler();
        let mut empty = Cursor::new(Vec::new());
        assert_eq!(bundler.infer_kind("app.deps.json", &mut empty), FileKind::DepsJson);
        assert_eq!(
            bundler.infer_kind("app.runtimeconfig.json", &mut empty),
            FileKind::RuntimeConfigJson
        );
        assert_eq!(bundler.infer_kind("app.dll", &mut empty), FileKind::MainApplication);
        assert_eq!(bundler.infer_kind("other.deps.json", &mut empty), FileKind::Other);
    }

    #[test]
    fn test_add_to_bundle_aligns_assemblies() {
        let mut bundle = Cursor::new(vec![0xAAu8; 5]);
        bundle.seek(SeekFrom::End(0)).unwrap();

        let mut native = Cursor::new(b"abc".to_vec());
        let (offset, size) = add_to_bundle(&mut bundle, &mut native, FileKind::Other).unwrap();
        assert_eq!((offset, size), (5, 3));

        let mut assembly = Cursor::new(b"assembly".to_vec());
        let (offset, size) =
            add_to_bundle(&mut bundle, &mut assembly, FileKind::ManagedAssembly).unwrap();
        assert_eq!((offset, size), (16, 8));

        let bytes = bundle.into_inner();
        assert_eq!(bytes.len(), 24);
        assert!(bytes[8..16].iter().all(|&b| b == 0));
        assert_eq!(&bytes[16..], b"assembly");
    }

    #[test]
    fn test_add_to_bundle_already_aligned() {
        let mut bundle = Cursor::new(vec![0u8; 32]);
        bundle.seek(SeekFrom::End(0)).unwrap();

        let mut app = Cursor::new(b"app".to_vec());
        let (offset, _) = add_to_bundle(&mut bundle, &mut app, FileKind::MainApplication).unwrap();
        assert_eq!(offset, 32);
    }
}
