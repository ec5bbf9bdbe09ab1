//! Shared fixtures for apphost-bundle integration tests

#![allow(dead_code)]

use apphost_bundle::{APP_BINARY_PATH_PLACEHOLDER, BUNDLE_HEADER_PLACEHOLDER};
use std::fs;
use std::path::{Path, PathBuf};

pub const IMAGE_SUBSYSTEM_WINDOWS_GUI: u16 = 2;
pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;

/// File offset of the optional header in [`pe_image`]
pub const OPTIONAL_HEADER: usize = 0x98;
/// File offset of the subsystem field in [`pe_image`]
pub const SUBSYSTEM_FIELD: usize = OPTIONAL_HEADER + 68;

/// A 1 KiB PE32 image with one `.text` section mapped at RVA 0x1000
pub fn pe_image(subsystem: u16) -> Vec<u8> {
    let mut image = vec![0u8; 0x400];
    image[0..2].copy_from_slice(b"MZ");
    image[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
    image[0x80..0x84].copy_from_slice(b"PE\0\0");
    image[0x84..0x86].copy_from_slice(&0x14Cu16.to_le_bytes());
    image[0x86..0x88].copy_from_slice(&1u16.to_le_bytes());
    image[0x94..0x96].copy_from_slice(&0xE0u16.to_le_bytes());
    image[OPTIONAL_HEADER..OPTIONAL_HEADER + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
    image[SUBSYSTEM_FIELD..SUBSYSTEM_FIELD + 2].copy_from_slice(&subsystem.to_le_bytes());
    image[OPTIONAL_HEADER + 92..OPTIONAL_HEADER + 96].copy_from_slice(&16u32.to_le_bytes());

    let section = OPTIONAL_HEADER + 0xE0;
    image[section..section + 5].copy_from_slice(b".text");
    image[section + 8..section + 12].copy_from_slice(&0x100u32.to_le_bytes());
    image[section + 12..section + 16].copy_from_slice(&0x1000u32.to_le_bytes());
    image[section + 16..section + 20].copy_from_slice(&0x200u32.to_le_bytes());
    image[section + 20..section + 24].copy_from_slice(&0x200u32.to_le_bytes());
    image
}

/// A PE image with an IL-only CLI header
pub fn managed_assembly(marker: &[u8]) -> Vec<u8> {
    let mut image = pe_image(IMAGE_SUBSYSTEM_WINDOWS_CUI);
    let cli_dir = OPTIONAL_HEADER + 96 + 14 * 8;
    image[cli_dir..cli_dir + 4].copy_from_slice(&0x1000u32.to_le_bytes());
    image[cli_dir + 4..cli_dir + 8].copy_from_slice(&72u32.to_le_bytes());
    image[0x200..0x204].copy_from_slice(&72u32.to_le_bytes());
    image[0x210..0x214].copy_from_slice(&1u32.to_le_bytes());
    // distinguish otherwise identical images
    image[0x300..0x300 + marker.len()].copy_from_slice(marker);
    image
}

/// Append both placeholders, each followed by room for its replacement
pub fn with_placeholders(mut image: Vec<u8>) -> Vec<u8> {
    image.extend_from_slice(APP_BINARY_PATH_PLACEHOLDER.as_bytes());
    image.extend(std::iter::repeat_n(0u8, 1024));
    image.extend_from_slice(BUNDLE_HEADER_PLACEHOLDER.as_bytes());
    image.extend(std::iter::repeat_n(0u8, 16));
    image
}

/// Launcher template: console PE image carrying both placeholders
pub fn apphost_template() -> Vec<u8> {
    with_placeholders(pe_image(IMAGE_SUBSYSTEM_WINDOWS_CUI))
}

/// Write `contents` to `dir/relative`, creating parent directories
pub fn write_file(dir: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

/// Offset of the first occurrence of `pattern` in `data`
pub fn find(data: &[u8], pattern: &[u8]) -> Option<usize> {
    data.windows(pattern.len()).position(|w| w == pattern)
}

/// Populate a publish directory with the files of a typical app
///
/// `app.exe` host, `app.dll` main app, deps.json, runtimeconfig.json, an
/// IL-only `lib1.dll` and a native `native.so`.
pub fn publish_app(dir: &Path) {
    write_file(dir, "app.exe", &apphost_template());
    write_file(dir, "app.dll", &managed_assembly(b"main"));
    write_file(dir, "app.deps.json", br#"{"targets":{}}"#);
    write_file(
        dir,
        "app.runtimeconfig.json",
        br#"{"runtimeOptions":{"tfm":"net8.0"}}"#,
    );
    write_file(dir, "lib1.dll", &managed_assembly(b"lib1"));
    write_file(dir, "native.so", b"\x7fELF native library");
}
