//! Fiasco firmware container.
//!
//! A container is a one-byte signature, a tagged header block (container
//! name, optional software release version), then a sequence of
//! self-describing image records. The byte layout is frozen; see the record
//! walk in [`Fiasco::parse`] and its inverse in [`Fiasco::write`].
//!
//! All multi-byte integers are big-endian.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FlashConfig;
use crate::image::{Image, ImageError, ImageMeta};
use crate::types::{DeviceModel, DeviceSpec, HwRevList, ImageType};

/// Container signature byte.
pub const FIASCO_SIGNATURE: u8 = 0xB4;

/// Default container name when the header carries none.
pub const DEFAULT_NAME: &str = "OSSO UART+USB";

/// Per-record magic. Byte 1 carries the subsection count; on parse only
/// bytes 2..7 participate in the boundary check (the compatibility target —
/// existing tools never compared the leading bytes).
const RECORD_MAGIC: [u8; 7] = [0x54, 0x00, 0x2E, 0x19, 0x01, 0x01, 0x00];

const TAG_NAME: u8 = 0xE8;
const TAG_SWVER: u8 = 0x31;

const SUB_VERSION: u8 = b'1';
const SUB_DEVICE: u8 = b'2';
const SUB_LAYOUT: u8 = b'3';

/// Device name field width inside a device subsection; hardware revisions
/// follow in 8-byte NUL-padded chunks.
const DEVICE_NAME_LEN: usize = 16;
const HWREV_CHUNK_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum FiascoError {
    #[error("Invalid container signature: 0x{0:02X}")]
    InvalidSignature(u8),

    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    #[error("Subsection 0x{tag:02X} too long: {len} bytes (max 255)")]
    SubsectionTooLong { tag: u8, len: usize },

    #[error("Nothing to write: container has no images")]
    NothingToWrite,

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A parsed or under-construction firmware container.
pub struct Fiasco {
    pub name: String,
    pub sw_version: Option<String>,
    pub images: Vec<Image>,
}

impl Fiasco {
    /// Create an empty container to be populated by the caller.
    pub fn new(name: impl Into<String>) -> Self {
        Fiasco {
            name: name.into(),
            sw_version: None,
            images: Vec::new(),
        }
    }

    /// Parse a container file.
    ///
    /// The walk is a linear scan: malformed record magic or EOF at the top
    /// of the record loop ends it successfully with whatever images were
    /// collected. A type-name starting with 0xFF is the explicit
    /// end-of-images sentinel.
    pub fn parse(path: &Path, config: &FlashConfig) -> Result<Self, FiascoError> {
        let mut reader = File::open(path)?;
        let file_len = reader.metadata()?.len();
        // Carved images share one descriptor, separate from the walk cursor.
        let shared = Arc::new(Mutex::new(File::open(path)?));

        let signature = reader.read_u8()?;
        if signature != FIASCO_SIGNATURE {
            return Err(FiascoError::InvalidSignature(signature));
        }

        let header_len = u64::from(reader.read_u32::<BigEndian>()?);
        let header_count = reader.read_u32::<BigEndian>()?;
        debug!(header_len, header_count, "Parsing container header");

        let mut fiasco = Fiasco::new(DEFAULT_NAME);
        let mut consumed = 0u64;
        for _ in 0..header_count {
            let tag = reader.read_u8()?;
            let len = reader.read_u8()? as usize;
            let mut value = vec![0u8; len];
            reader.read_exact(&mut value)?;
            consumed += 2 + len as u64;
            if consumed > header_len {
                return Err(FiascoError::MalformedContainer(
                    "header blocks overflow the declared header length".to_string(),
                ));
            }
            match tag {
                TAG_NAME => fiasco.name = text_from(&value),
                TAG_SWVER => fiasco.sw_version = Some(text_from(&value)),
                _ => warn!(tag = %format!("0x{tag:02X}"), "Skipping unknown header block"),
            }
        }

        loop {
            let mut magic = [0u8; 7];
            if read_fully(&mut reader, &mut magic)? < magic.len() {
                break;
            }
            if magic[2..] != RECORD_MAGIC[2..] {
                debug!("Record magic mismatch, treating as end of stream");
                break;
            }
            let subsection_count = magic[1];

            let hash = reader.read_u16::<BigEndian>()?;
            let mut type_name = [0u8; 12];
            reader.read_exact(&mut type_name)?;
            if type_name[0] == 0xFF {
                debug!("End-of-images sentinel");
                break;
            }
            let size = u64::from(reader.read_u32::<BigEndian>()?);
            let mut reserved = [0u8; 4];
            reader.read_exact(&mut reserved)?;

            let type_text = text_from(&type_name);
            let image_type = type_text.parse().unwrap_or_else(|_| {
                warn!(type_name = %type_text, "Unknown image type in container");
                ImageType::Unknown
            });

            let mut meta = ImageMeta {
                image_type: Some(image_type),
                ..Default::default()
            };
            let mut devices = Vec::new();
            for _ in 0..subsection_count {
                let tag = reader.read_u8()?;
                let len = reader.read_u8()? as usize;
                let mut value = vec![0u8; len];
                reader.read_exact(&mut value)?;
                match tag {
                    SUB_VERSION => meta.version = Some(text_from(&value)),
                    SUB_DEVICE => devices.push(parse_device_subsection(&value)),
                    SUB_LAYOUT => meta.layout = Some(value),
                    _ => warn!(tag = %format!("0x{tag:02X}"), "Skipping unknown subsection"),
                }
            }

            let offset = reader.stream_position()?;
            if offset + size > file_len {
                return Err(FiascoError::MalformedContainer(format!(
                    "record payload runs past end of file ({} + {} > {})",
                    offset, size, file_len
                )));
            }

            let mut image =
                Image::from_shared_segment(shared.clone(), size, offset, hash, meta, config)?;
            image.devices = devices;
            info!(
                image_type = %image.image_type,
                size,
                hash = %format!("0x{hash:04X}"),
                "Found image"
            );
            fiasco.images.push(image);

            reader.seek(SeekFrom::Start(offset + size))?;
        }

        Ok(fiasco)
    }

    /// Serialize the container. Writing with zero images is a hard error.
    pub fn write(&mut self, path: &Path) -> Result<(), FiascoError> {
        if self.images.is_empty() {
            return Err(FiascoError::NothingToWrite);
        }

        let mut out = BufWriter::new(File::create(path)?);
        out.write_u8(FIASCO_SIGNATURE)?;

        let mut blocks: Vec<(u8, Vec<u8>)> = vec![(TAG_NAME, self.name.as_bytes().to_vec())];
        if let Some(sw_version) = &self.sw_version {
            blocks.push((TAG_SWVER, sw_version.as_bytes().to_vec()));
        }
        for (tag, value) in &blocks {
            if value.len() > 255 {
                return Err(FiascoError::SubsectionTooLong {
                    tag: *tag,
                    len: value.len(),
                });
            }
        }
        let total: u32 = blocks.iter().map(|(_, v)| 2 + v.len() as u32).sum();
        out.write_u32::<BigEndian>(total)?;
        out.write_u32::<BigEndian>(blocks.len() as u32)?;
        for (tag, value) in &blocks {
            out.write_u8(*tag)?;
            out.write_u8(value.len() as u8)?;
            out.write_all(value)?;
        }

        for image in &mut self.images {
            let mut subsections: Vec<(u8, Vec<u8>)> = Vec::new();
            if let Some(version) = &image.version {
                subsections.push((SUB_VERSION, version.as_bytes().to_vec()));
            }
            for spec in &image.devices {
                subsections.push((SUB_DEVICE, encode_device_subsection(spec)?));
            }
            if let Some(layout) = &image.layout {
                subsections.push((SUB_LAYOUT, layout.clone()));
            }
            for (tag, value) in &subsections {
                if value.len() > 255 {
                    return Err(FiascoError::SubsectionTooLong {
                        tag: *tag,
                        len: value.len(),
                    });
                }
            }

            let mut magic = RECORD_MAGIC;
            magic[1] = subsections.len() as u8;
            out.write_all(&magic)?;
            out.write_u16::<BigEndian>(image.hash)?;

            let mut type_name = [0u8; 12];
            let type_bytes = image.image_type.as_str().as_bytes();
            type_name[..type_bytes.len()].copy_from_slice(type_bytes);
            out.write_all(&type_name)?;

            out.write_u32::<BigEndian>(image.size() as u32)?;
            out.write_all(&[0u8; 4])?;

            for (tag, value) in &subsections {
                out.write_u8(*tag)?;
                out.write_u8(value.len() as u8)?;
                out.write_all(value)?;
            }

            image.seek(0)?;
            let mut buf = [0u8; 4096];
            loop {
                let n = image.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
        }

        out.flush()?;
        Ok(())
    }

    /// Write each image (and its layout blob, if any) into `dir` under its
    /// derived name. Returns the written paths.
    pub fn unpack(&mut self, dir: Option<&Path>) -> Result<Vec<PathBuf>, FiascoError> {
        let base = dir.unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(base)?;

        let mut written = Vec::new();
        for image in &mut self.images {
            let name = image.name_from_values();
            let path = base.join(&name);
            info!(path = %path.display(), "Unpacking image");

            let mut out = BufWriter::new(File::create(&path)?);
            image.seek(0)?;
            let mut buf = [0u8; 4096];
            loop {
                let n = image.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            out.flush()?;
            written.push(path);

            if let Some(layout) = &image.layout {
                let layout_path = base.join(format!("{name}.layout"));
                std::fs::write(&layout_path, layout)?;
                written.push(layout_path);
            }
        }
        Ok(written)
    }

    /// Human-readable summary for CLI display.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Fiasco container: {}\n", self.name));
        if let Some(sw_version) = &self.sw_version {
            out.push_str(&format!("  Software release: {sw_version}\n"));
        }
        out.push_str(&format!("  Images: {}\n", self.images.len()));
        for image in &self.images {
            for line in image.to_text().lines() {
                out.push_str(&format!("  {line}\n"));
            }
        }
        out
    }
}

fn text_from(value: &[u8]) -> String {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// Device subsection: 16-byte NUL-padded device name, then hardware
/// revisions as 8-byte NUL-padded decimal chunks, rejoined comma-separated.
fn parse_device_subsection(value: &[u8]) -> DeviceSpec {
    let name_field = &value[..value.len().min(DEVICE_NAME_LEN)];
    let name = text_from(name_field);
    let model = name.parse().unwrap_or_else(|_| {
        warn!(device = %name, "Unknown device model in container");
        DeviceModel::Unknown
    });

    let mut revs = Vec::new();
    if value.len() > DEVICE_NAME_LEN {
        for chunk in value[DEVICE_NAME_LEN..].chunks(HWREV_CHUNK_LEN) {
            let text = text_from(chunk);
            match text.trim().parse::<i16>() {
                Ok(rev) => revs.push(rev),
                Err(_) => warn!(chunk = %text, "Unparsable hardware revision chunk"),
            }
        }
    }

    DeviceSpec {
        model,
        hwrevs: HwRevList(revs),
    }
}

fn encode_device_subsection(spec: &DeviceSpec) -> Result<Vec<u8>, FiascoError> {
    let mut value = vec![0u8; DEVICE_NAME_LEN];
    let name = spec.model.as_str().as_bytes();
    value[..name.len()].copy_from_slice(name);

    for &rev in &spec.hwrevs.0 {
        let mut chunk = [0u8; HWREV_CHUNK_LEN];
        let text = rev.to_string();
        chunk[..text.len()].copy_from_slice(text.as_bytes());
        value.extend_from_slice(&chunk);
    }

    if value.len() > 255 {
        return Err(FiascoError::SubsectionTooLong {
            tag: SUB_DEVICE,
            len: value.len(),
        });
    }
    Ok(value)
}

/// Read as many bytes as possible into `buf`, tolerating EOF.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::fold16;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    fn image_from(dir: &tempfile::TempDir, name: &str, data: &[u8], ty: ImageType) -> Image {
        let path = write_temp(dir, name, data);
        let meta = ImageMeta {
            image_type: Some(ty),
            ..Default::default()
        };
        Image::from_file(&path, meta, &FlashConfig::default()).unwrap()
    }

    #[test]
    fn test_round_trip_hash_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let original: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let image = image_from(&dir, "piece", &original, ImageType::Kernel);
        let original_hash = image.hash;

        let container_path = dir.path().join("fw.fiasco");
        let mut fiasco = Fiasco::new("test");
        fiasco.images.push(image);
        fiasco.write(&container_path).unwrap();

        let mut parsed = Fiasco::parse(&container_path, &FlashConfig::default()).unwrap();
        assert_eq!(parsed.name, "test");
        assert_eq!(parsed.images.len(), 1);

        let image = &mut parsed.images[0];
        assert_eq!(image.hash, original_hash);
        assert_eq!(image.image_type, ImageType::Kernel);

        let stream = image.read_all().unwrap();
        assert_eq!(&stream[..original.len()], &original[..]);
        assert!(stream[original.len()..].iter().all(|&b| b == 0xFF));
        assert_eq!(stream.len() as u64, aligned_len(original.len() as u64, 128));
    }

    fn aligned_len(len: u64, align: u64) -> u64 {
        len.div_ceil(align) * align
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = image_from(&dir, "piece", &[0x42; 200], ImageType::Rootfs);
        image.version = Some("5.2008.43-7".to_string());
        image.devices = vec![DeviceSpec {
            model: DeviceModel::Rx51,
            hwrevs: "2101,2102".parse().unwrap(),
        }];
        image.layout = Some(b"/dev/mtd4 rootfs\n".to_vec());

        let container_path = dir.path().join("fw.fiasco");
        let mut fiasco = Fiasco::new("release");
        fiasco.sw_version = Some("10.2010.12-1".to_string());
        fiasco.images.push(image);
        fiasco.write(&container_path).unwrap();

        let parsed = Fiasco::parse(&container_path, &FlashConfig::default()).unwrap();
        assert_eq!(parsed.name, "release");
        assert_eq!(parsed.sw_version.as_deref(), Some("10.2010.12-1"));
        let image = &parsed.images[0];
        assert_eq!(image.version.as_deref(), Some("5.2008.43-7"));
        assert_eq!(image.devices.len(), 1);
        assert_eq!(image.devices[0].model, DeviceModel::Rx51);
        assert_eq!(image.devices[0].hwrevs.to_string(), "2101,2102");
        assert_eq!(image.layout.as_deref(), Some(&b"/dev/mtd4 rootfs\n"[..]));
    }

    #[test]
    fn test_write_with_zero_images_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut fiasco = Fiasco::new("empty");
        assert!(matches!(
            fiasco.write(&dir.path().join("out.fiasco")),
            Err(FiascoError::NothingToWrite)
        ));
    }

    #[test]
    fn test_invalid_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "bad.fiasco", &[0x00, 0x01, 0x02]);
        assert!(matches!(
            Fiasco::parse(&path, &FlashConfig::default()),
            Err(FiascoError::InvalidSignature(0x00))
        ));
    }

    /// Craft a minimal container by hand: header with one name block, one
    /// 128-byte kernel record, then a record whose type-name starts with
    /// 0xFF. Parsing must stop at the sentinel with one image and no error.
    #[test]
    fn test_end_of_images_sentinel() {
        let payload = [0u8; 128];
        let mut bytes = vec![FIASCO_SIGNATURE];
        bytes.extend_from_slice(&6u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(TAG_NAME);
        bytes.push(4);
        bytes.extend_from_slice(b"test");

        let mut record = RECORD_MAGIC.to_vec();
        record[1] = 0;
        bytes.extend_from_slice(&record);
        bytes.extend_from_slice(&fold16(&payload).to_be_bytes());
        let mut type_name = [0u8; 12];
        type_name[..6].copy_from_slice(b"kernel");
        bytes.extend_from_slice(&type_name);
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&payload);

        // Sentinel record.
        bytes.extend_from_slice(&record);
        bytes.extend_from_slice(&[0u8; 2]);
        let mut sentinel = [0u8; 12];
        sentinel[0] = 0xFF;
        bytes.extend_from_slice(&sentinel);

        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "fw.fiasco", &bytes);
        let fiasco = Fiasco::parse(&path, &FlashConfig::default()).unwrap();
        assert_eq!(fiasco.images.len(), 1);
        assert_eq!(fiasco.images[0].image_type, ImageType::Kernel);
    }

    /// The record-boundary check only compares bytes 2..7; a corrupt first
    /// byte must still be accepted as a record start.
    #[test]
    fn test_boundary_check_ignores_leading_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_from(&dir, "piece", &[0x10; 64], ImageType::Kernel);
        let container_path = dir.path().join("fw.fiasco");
        let mut fiasco = Fiasco::new("test");
        fiasco.images.push(image);
        fiasco.write(&container_path).unwrap();

        let mut bytes = std::fs::read(&container_path).unwrap();
        // Record starts right after the 9-byte preamble plus the 6-byte
        // name block.
        let record_start = 1 + 4 + 4 + 2 + 4;
        assert_eq!(bytes[record_start], RECORD_MAGIC[0]);
        bytes[record_start] = 0x00;
        let corrupt = write_temp(&dir, "corrupt.fiasco", &bytes);

        let fiasco = Fiasco::parse(&corrupt, &FlashConfig::default()).unwrap();
        assert_eq!(fiasco.images.len(), 1);
    }

    #[test]
    fn test_trailing_garbage_ends_walk() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_from(&dir, "piece", &[0x10; 64], ImageType::Kernel);
        let container_path = dir.path().join("fw.fiasco");
        let mut fiasco = Fiasco::new("test");
        fiasco.images.push(image);
        fiasco.write(&container_path).unwrap();

        let mut bytes = std::fs::read(&container_path).unwrap();
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22]);
        let path = write_temp(&dir, "trailing.fiasco", &bytes);

        let fiasco = Fiasco::parse(&path, &FlashConfig::default()).unwrap();
        assert_eq!(fiasco.images.len(), 1);
    }

    #[test]
    fn test_hwrev_list_overflow_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = image_from(&dir, "piece", &[0x10; 64], ImageType::Kernel);
        image.devices = vec![DeviceSpec {
            model: DeviceModel::Rx51,
            // 16 + 30 * 8 = 256 bytes, one past the subsection limit.
            hwrevs: HwRevList((0i16..30).collect()),
        }];

        let mut fiasco = Fiasco::new("test");
        fiasco.images.push(image);
        assert!(matches!(
            fiasco.write(&dir.path().join("out.fiasco")),
            Err(FiascoError::SubsectionTooLong { tag: SUB_DEVICE, .. })
        ));
    }

    /// Pack two files (4096-byte kernel, 16-byte secondary), unpack, and
    /// check sizes and recomputed hashes.
    #[test]
    fn test_pack_unpack_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = image_from(&dir, "k.bin", &vec![0u8; 4096], ImageType::Kernel);
        let secondary = image_from(&dir, "s.bin", &[0x5A; 16], ImageType::Secondary);
        let kernel_hash = kernel.hash;
        let secondary_hash = secondary.hash;

        let container_path = dir.path().join("fw.fiasco");
        let mut fiasco = Fiasco::new("test");
        fiasco.images.push(kernel);
        fiasco.images.push(secondary);
        fiasco.write(&container_path).unwrap();

        let out_dir = dir.path().join("unpacked");
        let mut parsed = Fiasco::parse(&container_path, &FlashConfig::default()).unwrap();
        let written = parsed.unpack(Some(&out_dir)).unwrap();
        assert_eq!(written.len(), 2);

        let kernel_out = out_dir.join("kernel");
        let secondary_out = out_dir.join("secondary");
        assert_eq!(std::fs::metadata(&kernel_out).unwrap().len(), 4096);
        assert_eq!(std::fs::metadata(&secondary_out).unwrap().len(), 128);

        let meta = ImageMeta {
            image_type: Some(ImageType::Kernel),
            ..Default::default()
        };
        let reread = Image::from_file(&kernel_out, meta, &FlashConfig::default()).unwrap();
        assert_eq!(reread.hash, kernel_hash);

        let meta = ImageMeta {
            image_type: Some(ImageType::Secondary),
            ..Default::default()
        };
        let reread = Image::from_file(&secondary_out, meta, &FlashConfig::default()).unwrap();
        assert_eq!(reread.hash, secondary_hash);
    }

    #[test]
    fn test_device_subsection_codec() {
        let spec = DeviceSpec {
            model: DeviceModel::Rx44,
            hwrevs: "0801,0802".parse().unwrap(),
        };
        let encoded = encode_device_subsection(&spec).unwrap();
        assert_eq!(encoded.len(), DEVICE_NAME_LEN + 2 * HWREV_CHUNK_LEN);

        let parsed = parse_device_subsection(&encoded);
        assert_eq!(parsed.model, DeviceModel::Rx44);
        assert_eq!(parsed.hwrevs.0, vec![801, 802]);
    }
}
