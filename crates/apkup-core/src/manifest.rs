//! Reads the package name and version code out of an APK's compiled
//! `AndroidManifest.xml` without installing it.

use std::io::Read;
use std::path::Path;

use apkup_backend::ArchiveManifest;
use thiserror::Error;

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;

const STRING_POOL_UTF8_FLAG: u32 = 0x100;
const NO_INDEX: u32 = 0xFFFF_FFFF;

const ATTR_VERSION_CODE: u32 = 0x0101_021b;
const ATTR_VERSION_CODE_MAJOR: u32 = 0x0101_0576;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error reading archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a readable zip archive: {0}")]
    Zip(String),

    #[error("Archive has no AndroidManifest.xml")]
    MissingManifest,

    #[error("Malformed binary manifest: {0}")]
    Malformed(&'static str),

    #[error("Manifest has no {0} attribute")]
    MissingAttribute(&'static str),
}

/// Opens the archive at `path` and reads its manifest.
///
/// # Errors
/// Returns an error when the file is not a zip, has no manifest, or the
/// manifest cannot be decoded.
pub fn read_archive_manifest(path: &Path) -> Result<ArchiveManifest, ManifestError> {
    let file = std::fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|error| ManifestError::Zip(error.to_string()))?;

    let mut entry = match archive.by_name(MANIFEST_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Err(ManifestError::MissingManifest),
        Err(error) => return Err(ManifestError::Zip(error.to_string())),
    };

    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    parse_binary_manifest(&data)
}

/// Decodes a compiled (AXML) manifest document.
///
/// # Errors
/// Returns an error when the document is truncated or the root `manifest`
/// element lacks a package name or version code.
pub fn parse_binary_manifest(data: &[u8]) -> Result<ArchiveManifest, ManifestError> {
    if read_u16(data, 0)? != RES_XML_TYPE {
        return Err(ManifestError::Malformed("not a binary XML document"));
    }

    let end = (read_u32(data, 4)? as usize).min(data.len());
    let mut offset = usize::from(read_u16(data, 2)?);
    let mut strings: Vec<String> = Vec::new();
    let mut resource_ids: Vec<u32> = Vec::new();

    while offset + 8 <= end {
        let chunk_type = read_u16(data, offset)?;
        let header_size = usize::from(read_u16(data, offset + 2)?);
        let chunk_size = read_u32(data, offset + 4)? as usize;
        if chunk_size < 8 || offset + chunk_size > end {
            return Err(ManifestError::Malformed("chunk overruns document"));
        }
        let chunk = &data[offset..offset + chunk_size];

        match chunk_type {
            RES_STRING_POOL_TYPE => strings = read_string_pool(chunk)?,
            RES_XML_RESOURCE_MAP_TYPE => {
                resource_ids = chunk
                    .get(header_size..)
                    .ok_or(ManifestError::Malformed("truncated resource map"))?
                    .chunks_exact(4)
                    .map(|id| u32::from_le_bytes([id[0], id[1], id[2], id[3]]))
                    .collect();
            }
            RES_XML_START_ELEMENT_TYPE => {
                let element = StartElement::read(chunk, header_size)?;
                if lookup(&strings, element.name) != Some("manifest") {
                    return Err(ManifestError::Malformed("root element is not manifest"));
                }
                return element.into_manifest(&strings, &resource_ids);
            }
            _ => {}
        }

        offset += chunk_size;
    }

    Err(ManifestError::Malformed("no manifest element"))
}

struct Attribute {
    name: u32,
    raw_value: u32,
    data_type: u8,
    data: u32,
}

struct StartElement {
    name: u32,
    attributes: Vec<Attribute>,
}

impl StartElement {
    fn read(chunk: &[u8], header_size: usize) -> Result<Self, ManifestError> {
        let ext = header_size;
        let name = read_u32(chunk, ext + 4)?;
        let attribute_start = usize::from(read_u16(chunk, ext + 8)?);
        let attribute_size = usize::from(read_u16(chunk, ext + 10)?);
        let attribute_count = usize::from(read_u16(chunk, ext + 12)?);

        if attribute_size < 20 {
            return Err(ManifestError::Malformed("attribute record too small"));
        }

        let attributes = (0..attribute_count)
            .map(|index| {
                let at = ext + attribute_start + index * attribute_size;
                Ok(Attribute {
                    name: read_u32(chunk, at + 4)?,
                    raw_value: read_u32(chunk, at + 8)?,
                    data_type: *chunk
                        .get(at + 15)
                        .ok_or(ManifestError::Malformed("truncated attribute"))?,
                    data: read_u32(chunk, at + 16)?,
                })
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        Ok(Self { name, attributes })
    }

    fn into_manifest(
        self,
        strings: &[String],
        resource_ids: &[u32],
    ) -> Result<ArchiveManifest, ManifestError> {
        let mut package_name = None;
        let mut version_code = None;
        let mut version_code_major = None;

        for attribute in &self.attributes {
            let resource_id = resource_ids.get(attribute.name as usize).copied();
            let name = lookup(strings, attribute.name);

            match (resource_id, name) {
                (Some(ATTR_VERSION_CODE), _) | (None, Some("versionCode")) => {
                    version_code = attribute.as_u32(strings);
                }
                (Some(ATTR_VERSION_CODE_MAJOR), _) | (None, Some("versionCodeMajor")) => {
                    version_code_major = attribute.as_u32(strings);
                }
                (_, Some("package")) => {
                    package_name = attribute.as_str(strings).map(str::to_string);
                }
                _ => {}
            }
        }

        let package_name = package_name
            .filter(|name| !name.is_empty())
            .ok_or(ManifestError::MissingAttribute("package"))?;
        let version_code = version_code.ok_or(ManifestError::MissingAttribute("versionCode"))?;

        Ok(ArchiveManifest {
            package_name,
            version_code: (u64::from(version_code_major.unwrap_or(0)) << 32)
                | u64::from(version_code),
        })
    }
}

impl Attribute {
    fn as_str<'a>(&self, strings: &'a [String]) -> Option<&'a str> {
        if self.data_type == TYPE_STRING {
            lookup(strings, self.data)
        } else if self.raw_value != NO_INDEX {
            lookup(strings, self.raw_value)
        } else {
            None
        }
    }

    fn as_u32(&self, strings: &[String]) -> Option<u32> {
        match self.data_type {
            TYPE_INT_DEC | TYPE_INT_HEX => Some(self.data),
            _ => self.as_str(strings)?.trim().parse().ok(),
        }
    }
}

fn lookup(strings: &[String], index: u32) -> Option<&str> {
    strings.get(index as usize).map(String::as_str)
}

fn read_string_pool(chunk: &[u8]) -> Result<Vec<String>, ManifestError> {
    let header_size = usize::from(read_u16(chunk, 2)?);
    let count = read_u32(chunk, 8)? as usize;
    let flags = read_u32(chunk, 16)?;
    let strings_start = read_u32(chunk, 20)? as usize;

    if header_size + count * 4 > chunk.len() {
        return Err(ManifestError::Malformed("string pool offsets overrun chunk"));
    }

    let utf8 = flags & STRING_POOL_UTF8_FLAG != 0;
    (0..count)
        .map(|index| {
            let at = strings_start + read_u32(chunk, header_size + index * 4)? as usize;
            if utf8 {
                read_utf8_string(chunk, at)
            } else {
                read_utf16_string(chunk, at)
            }
        })
        .collect()
}

fn read_utf16_string(chunk: &[u8], at: usize) -> Result<String, ManifestError> {
    let first = read_u16(chunk, at)?;
    let (length, start) = if first & 0x8000 == 0 {
        (usize::from(first), at + 2)
    } else {
        let second = read_u16(chunk, at + 2)?;
        (
            (usize::from(first & 0x7FFF) << 16) | usize::from(second),
            at + 4,
        )
    };

    let bytes = chunk
        .get(start..start + length * 2)
        .ok_or(ManifestError::Malformed("truncated string"))?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

fn read_utf8_string(chunk: &[u8], at: usize) -> Result<String, ManifestError> {
    let (_, after_utf16_length) = read_utf8_length(chunk, at)?;
    let (length, start) = read_utf8_length(chunk, after_utf16_length)?;

    let bytes = chunk
        .get(start..start + length)
        .ok_or(ManifestError::Malformed("truncated string"))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn read_utf8_length(chunk: &[u8], at: usize) -> Result<(usize, usize), ManifestError> {
    let first = *chunk
        .get(at)
        .ok_or(ManifestError::Malformed("truncated string length"))?;
    if first & 0x80 == 0 {
        return Ok((usize::from(first), at + 1));
    }
    let second = *chunk
        .get(at + 1)
        .ok_or(ManifestError::Malformed("truncated string length"))?;
    Ok(((usize::from(first & 0x7F) << 8) | usize::from(second), at + 2))
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, ManifestError> {
    data.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ManifestError::Malformed("unexpected end of data"))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, ManifestError> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ManifestError::Malformed("unexpected end of data"))
}

#[cfg(test)]
mod tests {
    use super::{ManifestError, parse_binary_manifest, read_archive_manifest};
    use crate::testing::{ManifestFixture, write_test_apk};

    #[test]
    fn reads_package_and_version_from_utf16_pool() {
        let data = ManifestFixture::new("com.example.app", 42).encode();

        let manifest = parse_binary_manifest(&data).expect("manifest should parse");

        assert_eq!(manifest.package_name, "com.example.app");
        assert_eq!(manifest.version_code, 42);
    }

    #[test]
    fn reads_utf8_string_pool() {
        let data = ManifestFixture::new("org.sample.tool", 7).utf8().encode();

        let manifest = parse_binary_manifest(&data).expect("manifest should parse");

        assert_eq!(manifest.package_name, "org.sample.tool");
        assert_eq!(manifest.version_code, 7);
    }

    #[test]
    fn combines_major_and_minor_version_codes() {
        let data = ManifestFixture::new("com.example.app", 5)
            .with_major(1)
            .encode();

        let manifest = parse_binary_manifest(&data).expect("manifest should parse");

        assert_eq!(manifest.version_code, (1_u64 << 32) | 5);
    }

    #[test]
    fn rejects_text_xml() {
        let error = parse_binary_manifest(b"<manifest package=\"a\"/>")
            .expect_err("plain xml should not parse");
        assert!(matches!(error, ManifestError::Malformed(_)));
    }

    #[test]
    fn rejects_truncated_document() {
        let mut data = ManifestFixture::new("com.example.app", 1).encode();
        data.truncate(data.len() / 2);

        assert!(parse_binary_manifest(&data).is_err());
    }

    #[test]
    fn reads_manifest_from_archive() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("app.apk");
        write_test_apk(&path, "com.example.app", 1200).expect("fixture apk should be written");

        let manifest = read_archive_manifest(&path).expect("archive should be readable");

        assert_eq!(manifest.package_name, "com.example.app");
        assert_eq!(manifest.version_code, 1200);
    }

    #[test]
    fn archive_without_manifest_is_reported() {
        use std::io::Write;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("empty.apk");
        let file = std::fs::File::create(&path).expect("create archive");
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("classes.dex", zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(b"dex").expect("write entry");
        writer.finish().expect("finish archive");

        let error = read_archive_manifest(&path).expect_err("missing manifest should fail");
        assert!(matches!(error, ManifestError::MissingManifest));
    }

    #[test]
    fn non_zip_file_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("garbage.apk");
        std::fs::write(&path, b"not a zip").expect("write garbage");

        let error = read_archive_manifest(&path).expect_err("garbage should fail");
        assert!(matches!(error, ManifestError::Zip(_)));
    }
}
