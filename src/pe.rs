//! Minimal portable-executable header reader
//!
//! Only the parts the bundler and the apphost patcher need are decoded:
//! the DOS stub pointer, COFF and optional headers, data directories,
//! the section table, the CLI header flags and the resource tree.
//! Every parse is fallible and returns `None` on malformed input; callers
//! treat that as "not a PE image" rather than an error.

use std::io::{Read, Seek, SeekFrom};

/// `IMAGE_SUBSYSTEM_WINDOWS_GUI`
pub const IMAGE_SUBSYSTEM_WINDOWS_GUI: u16 = 2;
/// `IMAGE_SUBSYSTEM_WINDOWS_CUI`
pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;

/// Data directory index of the resource table
pub const RESOURCE_DIRECTORY: usize = 2;
/// Data directory index of the CLI (COR20) header
pub const CLI_HEADER_DIRECTORY: usize = 14;

/// `COMIMAGE_FLAGS_ILONLY`
pub const COMIMAGE_FLAGS_ILONLY: u32 = 0x0000_0001;

const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

const DOS_HEADER_SIZE: usize = 64;
const E_LFANEW_OFFSET: usize = 0x3C;
const COFF_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const SUBSYSTEM_OFFSET: usize = 68;

/// Bytes read from the start of a file on the first attempt at its headers
const HEADER_READ_LEN: usize = 4096;
/// Upper bound on the header region of an image
const MAX_HEADER_LEN: usize = 1 << 20;

/// Size of the COR20 header prefix holding the flags field
const COR20_FLAGS_END: usize = 20;

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// RVA and size of one optional-header data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

/// One entry of the section table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
}

impl Section {
    fn contains_rva(&self, rva: u32) -> bool {
        let extent = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && (rva - self.virtual_address) < extent
    }
}

/// Decoded PE headers
#[derive(Debug, Clone)]
pub struct PeHeaders {
    /// File offset of the `PE\0\0` signature
    pub pe_offset: usize,
    /// File offset of the optional header
    pub optional_header_offset: usize,
    /// `true` for PE32+ images
    pub is_pe32_plus: bool,
    /// Subsystem field of the optional header
    pub subsystem: u16,
    pub data_directories: Vec<DataDirectory>,
    pub sections: Vec<Section>,
}

impl PeHeaders {
    /// Parse the headers from the leading bytes of an image
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DOS_HEADER_SIZE || &data[..2] != b"MZ" {
            return None;
        }

        let pe_offset = read_u32(data, E_LFANEW_OFFSET)? as usize;
        if data.get(pe_offset..pe_offset.checked_add(4)?)? != b"PE\0\0" {
            return None;
        }

        let coff = pe_offset + 4;
        let section_count = read_u16(data, coff + 2)? as usize;
        let optional_header_size = read_u16(data, coff + 16)? as usize;
        let optional_header_offset = coff + COFF_HEADER_SIZE;

        if optional_header_size < SUBSYSTEM_OFFSET + 2 {
            return None;
        }

        let is_pe32_plus = match read_u16(data, optional_header_offset)? {
            PE32_MAGIC => false,
            PE32_PLUS_MAGIC => true,
            _ => return None,
        };

        let subsystem = read_u16(data, optional_header_offset + SUBSYSTEM_OFFSET)?;

        // NumberOfRvaAndSizes sits right before the directory array
        let (count_offset, directories_offset) = if is_pe32_plus { (108, 112) } else { (92, 96) };
        let mut data_directories = Vec::new();
        if optional_header_size >= directories_offset {
            let declared = read_u32(data, optional_header_offset + count_offset)? as usize;
            let fits = (optional_header_size - directories_offset) / 8;
            for index in 0..declared.min(fits).min(16) {
                let at = optional_header_offset + directories_offset + index * 8;
                data_directories.push(DataDirectory {
                    rva: read_u32(data, at)?,
                    size: read_u32(data, at + 4)?,
                });
            }
        }

        let table = optional_header_offset + optional_header_size;
        let mut sections = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let at = table + index * SECTION_HEADER_SIZE;
            let raw_name = data.get(at..at + 8)?;
            let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
            sections.push(Section {
                name: String::from_utf8_lossy(&raw_name[..name_len]).into_owned(),
                virtual_size: read_u32(data, at + 8)?,
                virtual_address: read_u32(data, at + 12)?,
                raw_size: read_u32(data, at + 16)?,
                raw_offset: read_u32(data, at + 20)?,
            });
        }

        Some(Self {
            pe_offset,
            optional_header_offset,
            is_pe32_plus,
            subsystem,
            data_directories,
            sections,
        })
    }

    /// File offset of the subsystem field
    pub fn subsystem_offset(&self) -> usize {
        self.optional_header_offset + SUBSYSTEM_OFFSET
    }

    /// Data directory at `index`, if present and non-empty
    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        self.data_directories
            .get(index)
            .copied()
            .filter(|dir| dir.rva != 0 && dir.size != 0)
    }

    /// Translate a relative virtual address into a file offset
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let section = self.sections.iter().find(|s| s.contains_rva(rva))?;
        Some((rva - section.virtual_address) as usize + section.raw_offset as usize)
    }
}

/// Check whether `data` starts with a PE image
pub fn is_pe_image(data: &[u8]) -> bool {
    PeHeaders::parse(data).is_some()
}

/// Check whether the image behind `reader` is an IL-only managed module
///
/// Reads the headers, follows the CLI header directory and tests
/// `COMIMAGE_FLAGS_ILONLY`. Any structural problem yields `false`.
pub fn is_il_only<R: Read + Seek>(reader: &mut R) -> bool {
    cor_flags(reader)
        .map(|flags| flags & COMIMAGE_FLAGS_ILONLY != 0)
        .unwrap_or(false)
}

fn cor_flags<R: Read + Seek>(reader: &mut R) -> Option<u32> {
    let headers = read_headers(reader)?;
    let cli = headers.data_directory(CLI_HEADER_DIRECTORY)?;
    let offset = headers.rva_to_offset(cli.rva)?;

    let mut cor20 = [0u8; COR20_FLAGS_END];
    reader.seek(SeekFrom::Start(offset as u64)).ok()?;
    reader.read_exact(&mut cor20).ok()?;
    read_u32(&cor20, 16)
}

/// Read and parse the headers at the start of `reader`
///
/// The first read covers 4 KiB. When the headers extend past it (a long DOS
/// stub or a large section table) the read is repeated over the extent the
/// DOS and COFF headers declare.
fn read_headers<R: Read + Seek>(reader: &mut R) -> Option<PeHeaders> {
    let mut len = HEADER_READ_LEN;
    loop {
        reader.seek(SeekFrom::Start(0)).ok()?;
        let mut head = Vec::with_capacity(len);
        reader
            .by_ref()
            .take(len as u64)
            .read_to_end(&mut head)
            .ok()?;

        if let Some(headers) = PeHeaders::parse(&head) {
            return Some(headers);
        }
        // the whole file was read
        if head.len() < len {
            return None;
        }

        let needed = header_extent(&head)?;
        if needed <= len || needed > MAX_HEADER_LEN {
            return None;
        }
        len = needed;
    }
}

/// End of the header region as far as `data` reveals it
///
/// Without the COFF header only its end is known; with it the optional
/// header and the section table are included.
fn header_extent(data: &[u8]) -> Option<usize> {
    if data.len() < DOS_HEADER_SIZE || &data[..2] != b"MZ" {
        return None;
    }

    let coff = (read_u32(data, E_LFANEW_OFFSET)? as usize).checked_add(4)?;
    let coff_end = coff.checked_add(COFF_HEADER_SIZE)?;
    match (read_u16(data, coff + 2), read_u16(data, coff + 16)) {
        (Some(section_count), Some(optional_header_size)) => Some(
            coff_end
                + optional_header_size as usize
                + section_count as usize * SECTION_HEADER_SIZE,
        ),
        _ => Some(coff_end),
    }
}

// ============================================================================
// Resources
// ============================================================================

/// `RT_ICON`
pub const RT_ICON: u16 = 3;
/// `RT_GROUP_ICON`
pub const RT_GROUP_ICON: u16 = 14;
/// `RT_VERSION`
pub const RT_VERSION: u16 = 16;
/// `RT_MANIFEST`
pub const RT_MANIFEST: u16 = 24;

const HIGH_BIT: u32 = 0x8000_0000;
const MAX_RESOURCE_DEPTH: usize = 3;

/// Resource type or name: numeric id or string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    Id(u16),
    Name(String),
}

impl ResourceId {
    /// Numeric id, if this is one
    pub fn id(&self) -> Option<u16> {
        match self {
            ResourceId::Id(id) => Some(*id),
            ResourceId::Name(_) => None,
        }
    }
}

/// One leaf of the resource tree
#[derive(Debug, Clone)]
pub struct PeResource {
    pub kind: ResourceId,
    pub name: ResourceId,
    pub language: u16,
    pub data: Vec<u8>,
}

/// Walk the resource tree of a complete image
pub fn resources(image: &[u8]) -> Option<Vec<PeResource>> {
    let headers = PeHeaders::parse(image)?;
    let directory = headers.data_directory(RESOURCE_DIRECTORY)?;
    let base = headers.rva_to_offset(directory.rva)?;

    let mut walker = ResourceWalker {
        image,
        headers: &headers,
        base,
        found: Vec::new(),
    };
    walker.walk(0, &mut Vec::new(), 0)?;
    Some(walker.found)
}

struct ResourceWalker<'a> {
    image: &'a [u8],
    headers: &'a PeHeaders,
    base: usize,
    found: Vec<PeResource>,
}

impl ResourceWalker<'_> {
    fn walk(&mut self, offset: usize, path: &mut Vec<ResourceId>, depth: usize) -> Option<()> {
        let at = self.base + offset;
        let named = read_u16(self.image, at + 12)? as usize;
        let ids = read_u16(self.image, at + 14)? as usize;

        for index in 0..named + ids {
            let entry = at + 16 + index * 8;
            let name_field = read_u32(self.image, entry)?;
            let target = read_u32(self.image, entry + 4)?;

            let id = if name_field & HIGH_BIT != 0 {
                ResourceId::Name(self.read_name((name_field & !HIGH_BIT) as usize)?)
            } else {
                ResourceId::Id(name_field as u16)
            };

            if target & HIGH_BIT != 0 {
                if depth + 1 >= MAX_RESOURCE_DEPTH {
                    continue;
                }
                path.push(id);
                self.walk((target & !HIGH_BIT) as usize, path, depth + 1)?;
                path.pop();
            } else if depth == MAX_RESOURCE_DEPTH - 1 {
                let language = id.id().unwrap_or(0);
                let data = self.read_data(target as usize)?;
                self.found.push(PeResource {
                    kind: path[0].clone(),
                    name: path[1].clone(),
                    language,
                    data,
                });
            }
        }

        Some(())
    }

    fn read_name(&self, offset: usize) -> Option<String> {
        let at = self.base + offset;
        let len = read_u16(self.image, at)? as usize;
        let units = (0..len)
            .map(|i| read_u16(self.image, at + 2 + i * 2))
            .collect::<Option<Vec<u16>>>()?;
        String::from_utf16(&units).ok()
    }

    fn read_data(&self, offset: usize) -> Option<Vec<u8>> {
        let at = self.base + offset;
        let rva = read_u32(self.image, at)?;
        let size = read_u32(self.image, at + 4)? as usize;
        let start = self.headers.rva_to_offset(rva)?;
        Some(self.image.get(start..start.checked_add(size)?)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn minimal_pe(subsystem: u16) -> Vec<u8> {
        pe_with_layout(subsystem, 0x80, 0x200, 0x400)
    }

    /// One `.text` section at RVA 0x1000 backed by `raw_offset`
    fn pe_with_layout(subsystem: u16, pe_offset: usize, raw_offset: usize, len: usize) -> Vec<u8> {
        let mut image = vec![0u8; len];
        image[0] = b'M';
        image[1] = b'Z';
        image[0x3C..0x40].copy_from_slice(&(pe_offset as u32).to_le_bytes());
        image[pe_offset..pe_offset + 4].copy_from_slice(b"PE\0\0");
        // one section, PE32 optional header of 0xE0 bytes
        let coff = pe_offset + 4;
        image[coff + 2..coff + 4].copy_from_slice(&1u16.to_le_bytes());
        image[coff + 16..coff + 18].copy_from_slice(&0xE0u16.to_le_bytes());
        let optional = coff + COFF_HEADER_SIZE;
        image[optional..optional + 2].copy_from_slice(&PE32_MAGIC.to_le_bytes());
        image[optional + 68..optional + 70].copy_from_slice(&subsystem.to_le_bytes());
        image[optional + 92..optional + 96].copy_from_slice(&16u32.to_le_bytes());
        let section = optional + 0xE0;
        image[section..section + 5].copy_from_slice(b".text");
        image[section + 8..section + 12].copy_from_slice(&0x100u32.to_le_bytes());
        image[section + 12..section + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        image[section + 16..section + 20].copy_from_slice(&0x200u32.to_le_bytes());
        image[section + 20..section + 24].copy_from_slice(&(raw_offset as u32).to_le_bytes());
        image
    }

    /// Point the CLI directory at a COR20 header at the start of `.text`
    fn mark_managed(image: &mut [u8], optional: usize, raw_offset: usize, flags: u32) {
        let cli_dir = optional + 96 + CLI_HEADER_DIRECTORY * 8;
        image[cli_dir..cli_dir + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        image[cli_dir + 4..cli_dir + 8].copy_from_slice(&72u32.to_le_bytes());
        image[raw_offset..raw_offset + 4].copy_from_slice(&72u32.to_le_bytes());
        image[raw_offset + 16..raw_offset + 20].copy_from_slice(&flags.to_le_bytes());
    }

    #[test]
    fn test_parse_headers() {
        let image = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI);
        let headers = PeHeaders::parse(&image).unwrap();

        assert_eq!(headers.pe_offset, 0x80);
        assert!(!headers.is_pe32_plus);
        assert_eq!(headers.subsystem, IMAGE_SUBSYSTEM_WINDOWS_CUI);
        assert_eq!(headers.subsystem_offset(), 0x98 + 68);
        assert_eq!(headers.sections.len(), 1);
        assert_eq!(headers.sections[0].name, ".text");
        assert_eq!(headers.data_directories.len(), 16);
    }

    #[test]
    fn test_rva_to_offset() {
        let headers = PeHeaders::parse(&minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI)).unwrap();
        assert_eq!(headers.rva_to_offset(0x1000), Some(0x200));
        assert_eq!(headers.rva_to_offset(0x1010), Some(0x210));
        assert_eq!(headers.rva_to_offset(0x2000), None);
    }

    #[test]
    fn test_not_pe() {
        assert!(!is_pe_image(b"\x7fELF not a pe image"));
        assert!(!is_pe_image(&[0u8; 16]));

        let mut broken = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI);
        broken[0x81] = b'X';
        assert!(!is_pe_image(&broken));
    }

    #[test]
    fn test_il_only_flag() {
        let mut image = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI);
        mark_managed(&mut image, 0x98, 0x200, COMIMAGE_FLAGS_ILONLY);
        assert!(is_il_only(&mut Cursor::new(&image)));

        // Mixed-mode image: CLI header present but not IL-only
        mark_managed(&mut image, 0x98, 0x200, 0x10);
        assert!(!is_il_only(&mut Cursor::new(&image)));
    }

    #[test]
    fn test_il_only_with_headers_past_first_read() {
        // PE header behind a long DOS stub
        let pe_offset = 0x1100;
        let mut image = pe_with_layout(IMAGE_SUBSYSTEM_WINDOWS_CUI, pe_offset, 0x1400, 0x1600);
        mark_managed(&mut image, pe_offset + 0x18, 0x1400, COMIMAGE_FLAGS_ILONLY);
        assert!(PeHeaders::parse(&image[..HEADER_READ_LEN]).is_none());
        assert!(is_il_only(&mut Cursor::new(&image)));

        // Section table straddling the first read
        let pe_offset = HEADER_READ_LEN - 0x100;
        let mut image = pe_with_layout(IMAGE_SUBSYSTEM_WINDOWS_CUI, pe_offset, 0x1200, 0x1400);
        mark_managed(&mut image, pe_offset + 0x18, 0x1200, COMIMAGE_FLAGS_ILONLY);
        assert!(is_il_only(&mut Cursor::new(&image)));
    }

    #[test]
    fn test_header_extent() {
        let image = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI);
        assert_eq!(header_extent(&image), Some(0x98 + 0xE0 + SECTION_HEADER_SIZE));
        // only the DOS header is available
        assert_eq!(header_extent(&image[..DOS_HEADER_SIZE]), Some(0x98));
        assert_eq!(header_extent(b"not an image at all, not even close to one"), None);
    }

    #[test]
    fn test_truncated_headers_are_not_il_only() {
        let image = pe_with_layout(IMAGE_SUBSYSTEM_WINDOWS_CUI, 0x1100, 0x1400, 0x1600);
        assert!(!is_il_only(&mut Cursor::new(&image[..0x1110])));

        let mut far = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI);
        far.resize(HEADER_READ_LEN, 0);
        far[0x3C..0x40].copy_from_slice(&(MAX_HEADER_LEN as u32).to_le_bytes());
        assert!(!is_il_only(&mut Cursor::new(&far)));
    }

    #[test]
    fn test_resources() {
        let mut image = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_GUI);
        let res_dir = 0x98 + 96 + RESOURCE_DIRECTORY * 8;
        image[res_dir..res_dir + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        image[res_dir + 4..res_dir + 8].copy_from_slice(&0x100u32.to_le_bytes());

        // type -> name -> language, one id entry per level
        let base = 0x200;
        for (dir, id, target) in [
            (0x00, RT_MANIFEST as u32, HIGH_BIT | 0x18),
            (0x18, 1, HIGH_BIT | 0x30),
            (0x30, 0x409, 0x48),
        ] {
            let at = base + dir;
            image[at + 14..at + 16].copy_from_slice(&1u16.to_le_bytes());
            image[at + 16..at + 20].copy_from_slice(&id.to_le_bytes());
            image[at + 20..at + 24].copy_from_slice(&target.to_le_bytes());
        }
        image[base + 0x48..base + 0x4C].copy_from_slice(&0x1060u32.to_le_bytes());
        image[base + 0x4C..base + 0x50].copy_from_slice(&5u32.to_le_bytes());
        image[base + 0x60..base + 0x65].copy_from_slice(b"hello");

        let found = resources(&image).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ResourceId::Id(RT_MANIFEST));
        assert_eq!(found[0].name, ResourceId::Id(1));
        assert_eq!(found[0].language, 0x409);
        assert_eq!(found[0].data, b"hello");
    }

    #[test]
    fn test_no_resource_directory() {
        assert!(resources(&minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI)).is_none());
    }

    #[test]
    fn test_native_image_is_not_il_only() {
        let image = minimal_pe(IMAGE_SUBSYSTEM_WINDOWS_CUI);
        assert!(!is_il_only(&mut Cursor::new(&image)));
        assert!(!is_il_only(&mut Cursor::new(b"plain text".to_vec())));
    }
}
