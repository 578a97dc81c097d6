//! Firmware image abstraction.
//!
//! An [`Image`] is a virtual, seekable, read-only byte stream backed by one
//! or more physical segments: whole files, or byte ranges carved out of a
//! shared container descriptor. The last segment carries trailing 0xFF
//! padding up to the type's alignment boundary, synthesized on read without
//! touching the backing descriptor.
//!
//! Metadata (type, applicable devices, version, partition layout blob) rides
//! along with the stream; the content hash and the sniffed type are verified
//! at construction time unless verification is disabled.

pub mod sniff;

use std::fs::File;
use std::io::{self, Read as _, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::checksum::fold16_update;
use crate::config::FlashConfig;
use crate::types::{DeviceModel, DeviceSpec, HwRevList, ImageType};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Hash mismatch: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    HashMismatch { stored: u16, computed: u16 },

    #[error("Type mismatch: declared {declared}, content looks like {sniffed}")]
    TypeMismatch {
        declared: ImageType,
        sniffed: ImageType,
    },

    #[error("Seek past end: position {position}, image size {size}")]
    SeekPastEnd { position: u64, size: u64 },

    #[error("No input files given")]
    NoFiles,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Backing descriptor of a segment.
///
/// `Owned` closes the file with the segment; `Shared` borrows the container
/// descriptor and leaves its lifetime to the container.
pub enum SegmentSource {
    Owned(File),
    Shared(Arc<Mutex<File>>),
}

/// One physical byte range plus its computed alignment padding.
pub struct Segment {
    source: SegmentSource,
    /// Physical start inside the backing descriptor.
    offset: u64,
    /// Raw byte length on disk.
    len: u64,
    /// Trailing 0xFF fill after the raw bytes.
    padding: u64,
}

impl Segment {
    fn logical_len(&self) -> u64 {
        self.len + self.padding
    }

    /// Read raw bytes starting at `pos` (< `self.len`) into `buf`.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            SegmentSource::Owned(file) => {
                file.seek(SeekFrom::Start(self.offset + pos))?;
                file.read(buf)
            }
            SegmentSource::Shared(shared) => {
                let mut file = shared
                    .lock()
                    .map_err(|_| io::Error::other("shared container descriptor poisoned"))?;
                file.seek(SeekFrom::Start(self.offset + pos))?;
                file.read(buf)
            }
        }
    }
}

/// Optional metadata supplied alongside the raw bytes.
#[derive(Debug, Default, Clone)]
pub struct ImageMeta {
    pub image_type: Option<ImageType>,
    pub device: Option<DeviceModel>,
    pub hwrevs: HwRevList,
    pub version: Option<String>,
    pub layout: Option<Vec<u8>>,
}

/// Round `len` up to the alignment boundary of `image_type`.
pub fn aligned_size(len: u64, image_type: ImageType) -> u64 {
    let align = image_type.alignment();
    len.div_ceil(align) * align
}

/// A logical firmware piece.
pub struct Image {
    pub image_type: ImageType,
    /// Applicability entries; empty means unrestricted.
    pub devices: Vec<DeviceSpec>,
    pub version: Option<String>,
    /// Opaque partition layout blob, carried but never interpreted.
    pub layout: Option<Vec<u8>>,
    /// 16-bit XOR-fold over the full logical stream.
    pub hash: u16,
    size: u64,
    segments: Vec<Segment>,
    cur: u64,
}

impl Image {
    /// Build an image from a single file.
    ///
    /// When no explicit type is given, metadata is back-filled from a
    /// `type[-device[:hwrevs]][_version]` encoded filename before content
    /// sniffing runs.
    pub fn from_file(
        path: &Path,
        meta: ImageMeta,
        config: &FlashConfig,
    ) -> Result<Self, ImageError> {
        let paths = [path.to_path_buf()];
        Self::from_files(&paths, meta, config)
    }

    /// Build an image from multiple whole files concatenated logically.
    pub fn from_files(
        paths: &[std::path::PathBuf],
        mut meta: ImageMeta,
        config: &FlashConfig,
    ) -> Result<Self, ImageError> {
        let first = paths.first().ok_or(ImageError::NoFiles)?;

        if meta.image_type.is_none() {
            if let Some(parsed) = parse_image_name(first) {
                debug!(name = %first.display(), "Back-filled metadata from filename");
                meta.image_type = Some(parsed.image_type);
                if meta.device.is_none() {
                    meta.device = parsed.device;
                }
                if meta.hwrevs.is_empty() {
                    meta.hwrevs = parsed.hwrevs;
                }
                if meta.version.is_none() {
                    meta.version = parsed.version;
                }
            }
        }

        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let file = File::open(path)?;
            let len = file.metadata()?.len();
            segments.push(Segment {
                source: SegmentSource::Owned(file),
                offset: 0,
                len,
                padding: 0,
            });
        }

        Self::finish(segments, meta, None, config)
    }

    /// Build an image from a byte range of a shared container descriptor.
    ///
    /// The recomputed hash is checked against `expected_hash`; a mismatch is
    /// fatal unless verification is disabled, in which case the recomputed
    /// value is retained.
    pub fn from_shared_segment(
        source: Arc<Mutex<File>>,
        len: u64,
        offset: u64,
        expected_hash: u16,
        meta: ImageMeta,
        config: &FlashConfig,
    ) -> Result<Self, ImageError> {
        let segments = vec![Segment {
            source: SegmentSource::Shared(source),
            offset,
            len,
            padding: 0,
        }];
        Self::finish(segments, meta, Some(expected_hash), config)
    }

    fn finish(
        segments: Vec<Segment>,
        meta: ImageMeta,
        expected_hash: Option<u16>,
        config: &FlashConfig,
    ) -> Result<Self, ImageError> {
        let raw_total: u64 = segments.iter().map(|s| s.len).sum();

        let mut image = Image {
            image_type: ImageType::Unknown,
            devices: Vec::new(),
            version: meta.version,
            layout: meta.layout,
            hash: 0,
            size: raw_total,
            segments,
            cur: 0,
        };

        if let Some(model) = meta.device {
            image.devices.push(DeviceSpec {
                model,
                hwrevs: meta.hwrevs,
            });
        }

        // Sniff on the raw head before padding exists.
        let mut head = [0u8; 512];
        let head_len = image.read(&mut head)?;
        let sniffed = sniff::type_from_content(&head[..head_len], raw_total);

        image.image_type = match (meta.image_type, sniffed) {
            (Some(declared), s) if s != ImageType::Unknown && s != declared => {
                if config.no_verify {
                    warn!(%declared, sniffed = %s, "Type mismatch ignored");
                    declared
                } else {
                    return Err(ImageError::TypeMismatch {
                        declared,
                        sniffed: s,
                    });
                }
            }
            (Some(declared), _) => declared,
            (None, s) => {
                if s == ImageType::Unknown {
                    warn!("Could not detect image type from content");
                }
                s
            }
        };

        // Only the last segment pads; its logical end lands on the boundary.
        let padding = aligned_size(raw_total, image.image_type) - raw_total;
        if let Some(last) = image.segments.last_mut() {
            last.padding = padding;
        }
        image.size = raw_total + padding;

        image.hash = image.compute_hash()?;
        if let Some(stored) = expected_hash {
            if stored != image.hash {
                if config.no_verify {
                    warn!(
                        stored = %format!("0x{stored:04X}"),
                        computed = %format!("0x{:04X}", image.hash),
                        "Hash mismatch ignored"
                    );
                } else {
                    return Err(ImageError::HashMismatch {
                        stored,
                        computed: image.hash,
                    });
                }
            }
        }

        image.cur = 0;
        Ok(image)
    }

    /// Logical size including alignment padding.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current logical read position.
    pub fn position(&self) -> u64 {
        self.cur
    }

    /// Reposition the logical cursor. Positions beyond the logical size are
    /// rejected and leave the cursor unmoved.
    pub fn seek(&mut self, position: u64) -> Result<(), ImageError> {
        if position > self.size {
            error!(position, size = self.size, "Seek past end of image");
            return Err(ImageError::SeekPastEnd {
                position,
                size: self.size,
            });
        }
        self.cur = position;
        Ok(())
    }

    /// Read from the current position, transparently crossing segment
    /// boundaries and synthesizing 0xFF inside padding regions.
    ///
    /// Returns fewer bytes than requested only at end-of-image or after an
    /// I/O error mid-stream (reported as a short read once data has been
    /// produced).
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, ImageError> {
        let mut total = 0usize;

        while total < out.len() && self.cur < self.size {
            let (index, seg_start) = match self.locate(self.cur) {
                Some(found) => found,
                None => break,
            };
            let seg_off = self.cur - seg_start;
            let seg = &mut self.segments[index];

            if seg_off < seg.len {
                let want = ((seg.len - seg_off) as usize).min(out.len() - total);
                match seg.read_at(seg_off, &mut out[total..total + want]) {
                    Ok(0) => {
                        warn!("Backing segment ended before its recorded length");
                        break;
                    }
                    Ok(n) => {
                        total += n;
                        self.cur += n as u64;
                    }
                    Err(e) if total > 0 => {
                        warn!(error = %e, "I/O error mid-read, returning short read");
                        break;
                    }
                    Err(e) => return Err(ImageError::Io(e)),
                }
            } else {
                let want = ((seg.logical_len() - seg_off) as usize).min(out.len() - total);
                out[total..total + want].fill(0xFF);
                total += want;
                self.cur += want as u64;
            }
        }

        Ok(total)
    }

    /// Read the whole logical stream from the start.
    pub fn read_all(&mut self) -> Result<Vec<u8>, ImageError> {
        self.seek(0)?;
        let mut out = Vec::with_capacity(self.size as usize);
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    fn locate(&self, pos: u64) -> Option<(usize, u64)> {
        let mut seg_start = 0u64;
        for (i, seg) in self.segments.iter().enumerate() {
            let end = seg_start + seg.logical_len();
            if pos < end {
                return Some((i, seg_start));
            }
            seg_start = end;
        }
        None
    }

    /// Recompute the 16-bit fold over the full logical stream. The cursor
    /// position is not preserved.
    pub fn compute_hash(&mut self) -> Result<u16, ImageError> {
        self.seek(0)?;
        let mut hash: u16 = 0;
        // Even-sized blocks keep the word fold composable across calls.
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hash = fold16_update(hash, &buf[..n]);
        }
        self.seek(0)?;
        Ok(hash)
    }

    /// Derived name: `type[-device[:hwrevs]][_version]`.
    pub fn name_from_values(&self) -> String {
        let mut name = self.image_type.to_string();
        if let Some(spec) = self.devices.first() {
            name.push('-');
            name.push_str(spec.model.as_str());
            if !spec.hwrevs.is_empty() {
                name.push(':');
                name.push_str(&spec.hwrevs.to_string());
            }
        }
        if let Some(version) = &self.version {
            name.push('_');
            name.push_str(version);
        }
        name
    }

    /// Human-readable summary for CLI display.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Image: {}\n", self.image_type));
        out.push_str(&format!("  Size: {} bytes\n", self.size));
        out.push_str(&format!("  Hash: 0x{:04X}\n", self.hash));
        for spec in &self.devices {
            if spec.hwrevs.is_empty() {
                out.push_str(&format!("  Device: {}\n", spec.model));
            } else {
                out.push_str(&format!(
                    "  Device: {} (hwrevs {})\n",
                    spec.model, spec.hwrevs
                ));
            }
        }
        if let Some(version) = &self.version {
            out.push_str(&format!("  Version: {version}\n"));
        }
        if let Some(layout) = &self.layout {
            out.push_str(&format!("  Layout: {} bytes\n", layout.len()));
        }
        out
    }
}

/// Metadata parsed from an encoded filename.
struct ParsedName {
    image_type: ImageType,
    device: Option<DeviceModel>,
    hwrevs: HwRevList,
    version: Option<String>,
}

/// Parse a `type[-device[:hwrevs]][_version]` file name.
///
/// Type and device names contain `-` themselves, so both are matched against
/// the registries longest-first rather than split on the separator.
fn parse_image_name(path: &Path) -> Option<ParsedName> {
    let stem = path.file_name()?.to_str()?;

    let mut types: Vec<ImageType> = ImageType::ALL.to_vec();
    types.sort_by_key(|t| std::cmp::Reverse(t.as_str().len()));
    let image_type = types.into_iter().find(|t| {
        stem.strip_prefix(t.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('-') || rest.starts_with('_'))
    })?;

    let mut rest = &stem[image_type.as_str().len()..];
    let mut device = None;
    let mut hwrevs = HwRevList::default();

    if let Some(after) = rest.strip_prefix('-') {
        let mut models: Vec<DeviceModel> = DeviceModel::ALL.to_vec();
        models.sort_by_key(|d| std::cmp::Reverse(d.as_str().len()));
        let model = models.into_iter().find(|d| {
            after.strip_prefix(d.as_str()).is_some_and(|r| {
                r.is_empty() || r.starts_with(':') || r.starts_with('_')
            })
        })?;
        device = Some(model);
        rest = &after[model.as_str().len()..];

        if let Some(after_colon) = rest.strip_prefix(':') {
            let revs_text = after_colon.split('_').next().unwrap_or("");
            hwrevs = revs_text.parse().ok()?;
            rest = &after_colon[revs_text.len()..];
        }
    }

    let version = rest.strip_prefix('_').map(|v| v.to_string());
    if version.is_none() && !rest.is_empty() {
        return None;
    }

    Some(ParsedName {
        image_type,
        device,
        hwrevs,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    fn kernel_meta() -> ImageMeta {
        ImageMeta {
            image_type: Some(ImageType::Kernel),
            ..Default::default()
        }
    }

    #[test]
    fn test_aligned_size_invariant() {
        for len in [0u64, 1, 15, 127, 128, 129, 255, 256, 4096, 5000] {
            for ty in [ImageType::Kernel, ImageType::Mmc] {
                let aligned = aligned_size(len, ty);
                assert_eq!(aligned % ty.alignment(), 0);
                assert!(aligned >= len);
                assert!(aligned - len < ty.alignment());
            }
        }
    }

    #[test]
    fn test_padding_read_all_chunk_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0u8..100).collect();
        let path = write_temp(&dir, "piece.bin", &data);

        for chunk in [1usize, 3, 16, 100, 128, 1000] {
            let mut image =
                Image::from_file(&path, kernel_meta(), &FlashConfig::default()).unwrap();
            assert_eq!(image.size(), 128);

            let mut stream = Vec::new();
            let mut buf = vec![0u8; chunk];
            loop {
                let n = image.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                stream.extend_from_slice(&buf[..n]);
            }
            assert_eq!(&stream[..100], &data[..]);
            assert!(stream[100..].iter().all(|&b| b == 0xFF));
            assert_eq!(stream.len(), 128);
        }
    }

    #[test]
    fn test_seek_read_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let path = write_temp(&dir, "piece.bin", &data);
        let mut image = Image::from_file(&path, kernel_meta(), &FlashConfig::default()).unwrap();

        for pos in [0u64, 1, 99, 255, 299, 300] {
            let mut first = vec![0u8; 64];
            image.seek(pos).unwrap();
            let n1 = image.read(&mut first).unwrap();

            let mut second = vec![0u8; 64];
            image.seek(pos).unwrap();
            let n2 = image.read(&mut second).unwrap();

            assert_eq!(n1, n2);
            assert_eq!(first[..n1], second[..n2]);
        }
    }

    #[test]
    fn test_seek_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "piece.bin", &[0u8; 64]);
        let mut image = Image::from_file(&path, kernel_meta(), &FlashConfig::default()).unwrap();

        image.seek(17).unwrap();
        assert!(matches!(
            image.seek(image.size() + 1),
            Err(ImageError::SeekPastEnd { .. })
        ));
        assert_eq!(image.position(), 17);
    }

    #[test]
    fn test_multi_file_padding_on_last_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a.bin", &[0x11u8; 100]);
        let b = write_temp(&dir, "b.bin", &[0x22u8; 50]);

        let mut image = Image::from_files(
            &[a, b],
            kernel_meta(),
            &FlashConfig::default(),
        )
        .unwrap();

        // 150 raw bytes align to 256.
        assert_eq!(image.size(), 256);
        let stream = image.read_all().unwrap();
        assert!(stream[..100].iter().all(|&b| b == 0x11));
        assert!(stream[100..150].iter().all(|&b| b == 0x22));
        assert!(stream[150..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_hash_mismatch_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "piece.bin", &[0xAB; 64]);

        let mut reference =
            Image::from_file(&path, kernel_meta(), &FlashConfig::default()).unwrap();
        let good_hash = reference.hash;
        let bad_hash = good_hash ^ 0x5555;

        let shared = Arc::new(Mutex::new(File::open(&path).unwrap()));
        let err = Image::from_shared_segment(
            shared.clone(),
            64,
            0,
            bad_hash,
            kernel_meta(),
            &FlashConfig::default(),
        );
        assert!(matches!(err, Err(ImageError::HashMismatch { .. })));

        let lax = FlashConfig {
            no_verify: true,
            ..Default::default()
        };
        let image =
            Image::from_shared_segment(shared, 64, 0, bad_hash, kernel_meta(), &lax).unwrap();
        // The recomputed hash is retained, not the stored one.
        assert_eq!(image.hash, reference.compute_hash().unwrap());
    }

    #[test]
    fn test_type_mismatch_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0u8; 512];
        data[12..20].copy_from_slice(b"NOLOXldr");
        let path = write_temp(&dir, "piece.bin", &data);

        let err = Image::from_file(&path, kernel_meta(), &FlashConfig::default());
        assert!(matches!(err, Err(ImageError::TypeMismatch { .. })));

        let lax = FlashConfig {
            no_verify: true,
            ..Default::default()
        };
        let image = Image::from_file(&path, kernel_meta(), &lax).unwrap();
        assert_eq!(image.image_type, ImageType::Kernel);
    }

    #[test]
    fn test_filename_back_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "kernel-RX-51:2101,2102_2.6.28", &[0u8; 32]);

        let image = Image::from_file(&path, ImageMeta::default(), &FlashConfig::default()).unwrap();
        assert_eq!(image.image_type, ImageType::Kernel);
        assert_eq!(image.devices.len(), 1);
        assert_eq!(image.devices[0].model, DeviceModel::Rx51);
        assert_eq!(image.devices[0].hwrevs.to_string(), "2101,2102");
        assert_eq!(image.version.as_deref(), Some("2.6.28"));
        assert_eq!(image.name_from_values(), "kernel-RX-51:2101,2102_2.6.28");
    }

    #[test]
    fn test_parse_name_variants() {
        let parsed = parse_image_name(Path::new("cmt-2nd")).unwrap();
        assert_eq!(parsed.image_type, ImageType::Cmt2nd);
        assert!(parsed.device.is_none());

        let parsed = parse_image_name(Path::new("rootfs_5.2008.43-7")).unwrap();
        assert_eq!(parsed.image_type, ImageType::Rootfs);
        assert_eq!(parsed.version.as_deref(), Some("5.2008.43-7"));

        assert!(parse_image_name(Path::new("notatype.bin")).is_none());
    }

    #[test]
    fn test_shared_segment_offset_carving() {
        let dir = tempfile::tempdir().unwrap();
        let mut container = vec![0u8; 32];
        container.extend_from_slice(&[0x77u8; 64]);
        let path = write_temp(&dir, "container.bin", &container);

        let shared = Arc::new(Mutex::new(File::open(&path).unwrap()));
        let lax = FlashConfig {
            no_verify: true,
            ..Default::default()
        };
        let mut image =
            Image::from_shared_segment(shared, 64, 32, 0, kernel_meta(), &lax).unwrap();

        let stream = image.read_all().unwrap();
        assert_eq!(stream.len(), 128);
        assert!(stream[..64].iter().all(|&b| b == 0x77));
        assert!(stream[64..].iter().all(|&b| b == 0xFF));
    }
}
