//! Tests for apphost-bundle extractor module

mod common;

use apphost_bundle::{
    extract_files, BundleError, BundleOptions, Bundler, Extractor, FileKind, FormatError,
    Manifest, FOOTER_LENGTH,
};
use common::{publish_app, write_file};
use std::fs;
use std::io::{Cursor, Seek, SeekFrom, Write};
use tempfile::TempDir;

fn bundle_app(temp: &TempDir) -> std::path::PathBuf {
    let publish = temp.path().join("publish");
    publish_app(&publish);
    write_file(&publish, "runtimes/linux-x64/native/libfoo.so", b"nested native");
    Bundler::new(BundleOptions::new("app.exe", temp.path().join("out")))
        .generate_bundle_from_dir(&publish)
        .unwrap()
}

#[test]
fn test_extract_nested_paths() {
    let temp = TempDir::new().unwrap();
    let bundle = bundle_app(&temp);
    let output = temp.path().join("extracted");

    let manifest = Extractor::new(&bundle, &output).spill().unwrap();
    assert_eq!(manifest.files.len(), 6);

    let nested = output
        .join("runtimes")
        .join("linux-x64")
        .join("native")
        .join("libfoo.so");
    assert_eq!(fs::read(nested).unwrap(), b"nested native");
}

#[test]
fn test_extract_is_repeatable() {
    let temp = TempDir::new().unwrap();
    let bundle = bundle_app(&temp);
    let output = temp.path().join("extracted");

    extract_files(&bundle, &output).unwrap();
    extract_files(&bundle, &output).unwrap();
    assert_eq!(
        fs::read(output.join("app.deps.json")).unwrap(),
        br#"{"targets":{}}"#
    );
}

#[test]
fn test_extract_missing_bundle() {
    let temp = TempDir::new().unwrap();
    let result = extract_files(temp.path().join("missing.exe"), temp.path().join("out"));

    match result {
        Err(BundleError::Argument(msg)) => assert!(msg.contains("File not found")),
        other => panic!("expected Argument error, got {:?}", other),
    }
}

#[test]
fn test_extract_non_bundle() {
    let temp = TempDir::new().unwrap();
    let plain = write_file(temp.path(), "plain.exe", &vec![0x90u8; 256]);

    assert!(!Extractor::is_bundle(&plain).unwrap());
    let result = extract_files(&plain, temp.path().join("out"));
    assert!(matches!(
        result,
        Err(BundleError::Malformed {
            source: FormatError::BadSignature,
            ..
        })
    ));
}

#[test]
fn test_extract_truncated_bundle() {
    let temp = TempDir::new().unwrap();
    let bundle = bundle_app(&temp);

    let bytes = fs::read(&bundle).unwrap();
    fs::write(&bundle, &bytes[..bytes.len() - 1]).unwrap();

    let result = extract_files(&bundle, temp.path().join("out"));
    assert!(matches!(result, Err(BundleError::Malformed { .. })));

    fs::write(&bundle, &bytes[..FOOTER_LENGTH as usize - 3]).unwrap();
    let result = extract_files(&bundle, temp.path().join("out"));
    assert!(matches!(
        result,
        Err(BundleError::Malformed {
            source: FormatError::TooSmall { .. },
            ..
        })
    ));
}

#[test]
fn test_extract_rejects_escaping_names() {
    let temp = TempDir::new().unwrap();

    let mut stream = Cursor::new(Vec::new());
    stream.write_all(b"payload!").unwrap();
    let mut manifest = Manifest::new();
    manifest.add_entry(FileKind::MainApplication, "../escape.dll", 0, 8);
    manifest.write(&mut stream).unwrap();

    let bundle = write_file(temp.path(), "evil.exe", &stream.into_inner());
    let output = temp.path().join("out");
    let result = extract_files(&bundle, &output);

    assert!(matches!(
        result,
        Err(BundleError::Malformed {
            source: FormatError::InvalidEntryName(_),
            ..
        })
    ));
    assert!(!temp.path().join("escape.dll").exists());
}

#[test]
fn test_extract_large_entry() {
    let temp = TempDir::new().unwrap();

    // larger than the copy buffer and not a multiple of it
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut stream = Cursor::new(Vec::new());
    stream.write_all(&payload).unwrap();
    stream.seek(SeekFrom::End(0)).unwrap();
    let mut manifest = Manifest::new();
    manifest.add_entry(FileKind::MainApplication, "big.dll", 0, payload.len() as u64);
    manifest.write(&mut stream).unwrap();

    let bundle = write_file(temp.path(), "big.exe", &stream.into_inner());
    let output = temp.path().join("out");
    extract_files(&bundle, &output).unwrap();

    assert_eq!(fs::read(output.join("big.dll")).unwrap(), payload);
}

#[test]
fn test_read_manifest_without_extracting() {
    let temp = TempDir::new().unwrap();
    let bundle = bundle_app(&temp);

    let manifest = Extractor::read_manifest(&bundle).unwrap();
    assert!(manifest.entry("app.dll").is_some());
    assert!(manifest.entry("lib1.dll").is_some());
    assert!(!temp.path().join("out").join("app.dll").exists());
}
