//! Extractor: restores the files embedded within a bundle

use crate::error::FormatError;
use crate::manifest::{FileEntry, Manifest};
use crate::progress::{bytes_bar, ProgressExt};
use crate::{BundleError, BundleResult};
use indicatif::ProgressBar;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// Copy buffer size used when spilling entries
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Extract every file in `bundle_path` into `output_dir`
pub fn extract_files(
    bundle_path: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
) -> BundleResult<Manifest> {
    Extractor::new(bundle_path.as_ref(), output_dir.as_ref()).spill()
}

/// Restores the files of a bundle to disk
pub struct Extractor {
    bundle_path: PathBuf,
    output_dir: PathBuf,
    show_progress: bool,
}

impl Extractor {
    pub fn new(bundle_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            output_dir: output_dir.into(),
            show_progress: false,
        }
    }

    /// Set whether a progress bar is shown
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Check if a file ends with a bundle signature
    pub fn is_bundle(path: &Path) -> BundleResult<bool> {
        let mut reader = BufReader::new(File::open(path)?);
        Ok(Manifest::has_signature(&mut reader)?)
    }

    /// Decode the manifest of a bundle without extracting anything
    pub fn read_manifest(path: &Path) -> BundleResult<Manifest> {
        let mut reader = Self::open(path)?;
        Manifest::read(&mut reader).map_err(|e| BundleError::malformed(path, e))
    }

    fn open(path: &Path) -> BundleResult<BufReader<File>> {
        if !path.is_file() {
            return Err(BundleError::Argument(format!(
                "File not found: {}",
                path.display()
            )));
        }
        Ok(BufReader::with_capacity(COPY_BUFFER_SIZE, File::open(path)?))
    }

    /// Write every embedded file to the output directory
    ///
    /// Files already written stay on disk if a later entry fails.
    pub fn spill(&self) -> BundleResult<Manifest> {
        let mut reader = Self::open(&self.bundle_path)?;
        let manifest = Manifest::read(&mut reader)
            .map_err(|e| BundleError::malformed(&self.bundle_path, e))?;

        tracing::info!(
            "Extracting {} files from {} to {}",
            manifest.files.len(),
            self.bundle_path.display(),
            self.output_dir.display()
        );

        let progress = if self.show_progress {
            let total = manifest.files.iter().map(|f| f.size).sum();
            bytes_bar(total, "Extracting files")
        } else {
            ProgressBar::hidden()
        };

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        for entry in &manifest.files {
            tracing::debug!("Spill: {}", entry);
            progress.set_message(entry.name.clone());
            if let Err(e) = self.spill_entry(&mut reader, entry, &mut buffer) {
                progress.finish_error(&format!("Failed to extract {}", entry.name));
                return Err(BundleError::malformed(&self.bundle_path, e));
            }
            progress.inc(entry.size);
        }

        progress.finish_success(&format!("Extracted {} files", manifest.files.len()));
        Ok(manifest)
    }

    fn spill_entry<R: Read + Seek>(
        &self,
        reader: &mut R,
        entry: &FileEntry,
        buffer: &mut [u8],
    ) -> Result<(), FormatError> {
        let file_path = self.output_dir.join(entry_path(&entry.name)?);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        reader.seek(SeekFrom::Start(entry.offset))?;
        let mut file = BufWriter::new(File::create(&file_path)?);

        let mut remaining = entry.size;
        while remaining > 0 {
            let chunk = remaining.min(buffer.len() as u64) as usize;
            reader.read_exact(&mut buffer[..chunk])?;
            file.write_all(&buffer[..chunk])?;
            remaining -= chunk as u64;
        }

        file.flush()?;
        Ok(())
    }
}

/// Turn an entry name into a relative path confined to the output directory
fn entry_path(name: &str) -> Result<PathBuf, FormatError> {
    let mut path = PathBuf::new();
    for part in name.split(['/', '\\']) {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(normal)), None) => path.push(normal),
            _ => return Err(FormatError::InvalidEntryName(name.to_string())),
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_path() {
        assert_eq!(entry_path("app.dll").unwrap(), PathBuf::from("app.dll"));
        assert_eq!(
            entry_path("runtimes/linux-x64/native.so").unwrap(),
            Path::new("runtimes").join("linux-x64").join("native.so")
        );
        assert_eq!(
            entry_path("sub\\lib.dll").unwrap(),
            Path::new("sub").join("lib.dll")
        );
    }

    #[test]
    fn test_entry_path_rejects_escapes() {
        for name in ["", "../evil", "a/../../evil", "/etc/passwd", "a//b", "./a"] {
            assert!(
                matches!(entry_path(name), Err(FormatError::InvalidEntryName(_))),
                "{name:?} should be rejected"
            );
        }
    }
}
