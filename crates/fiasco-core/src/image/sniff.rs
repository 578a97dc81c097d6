//! Content-based image type detection.
//!
//! A fixed, ordered list of signature checks over the first 512 bytes of an
//! image. Order is load-bearing: `NOLOXldr` appears at two different offsets
//! with two different meanings, and the specific checks must run before the
//! generic ones. The offsets and magics are frozen for compatibility with
//! existing firmware images.

use crate::types::ImageType;

/// JFFS2 images below this total size are initfs, at or above it rootfs.
pub const JFFS2_INITFS_LIMIT: u64 = 0x30_0000;

/// CMT piece headers: 8-byte little-endian (tag, length) pairs.
const CMT_2ND_HDR: [u8; 8] = [0x04, 0x00, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00];
const CMT_ALGO_HDR: [u8; 8] = [0x08, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00];
const CMT_MCUSW_HDR: [u8; 8] = [0x10, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00];

fn matches_at(buf: &[u8], offset: usize, magic: &[u8]) -> bool {
    buf.len() >= offset + magic.len() && &buf[offset..offset + magic.len()] == magic
}

/// Classify an image from its first bytes and total logical size.
///
/// `buf` should hold the first 512 bytes (shorter inputs only match the
/// signatures they can reach). Returns [`ImageType::Unknown`] when nothing
/// matches.
pub fn type_from_content(buf: &[u8], total_size: u64) -> ImageType {
    if matches_at(buf, 52, b"2NDAPE") {
        return ImageType::Secondary;
    }
    if matches_at(buf, 20, b"2ND") {
        return ImageType::Secondary;
    }
    if matches_at(buf, 4, b"NOLOScnd") {
        return ImageType::Secondary;
    }
    if matches_at(buf, 20, b"X-LOADER") {
        return ImageType::Xloader;
    }
    // Same magic, two offsets, two meanings. +12 must win over +4.
    if matches_at(buf, 12, b"NOLOXldr") {
        return ImageType::Xloader;
    }
    if matches_at(buf, 4, b"NOLOXldr") {
        return ImageType::Secondary;
    }
    // ARM Linux zImage magic 0x016F2818 at +36.
    if matches_at(buf, 36, &[0x18, 0x28, 0x6F, 0x01]) {
        return ImageType::Kernel;
    }
    // Short-range ARM branch at the very start (little-endian `b`).
    if matches_at(buf, 1, &[0x00, 0x00, 0xEA]) {
        return ImageType::Kernel;
    }
    if matches_at(buf, 0, b"UBI#") {
        return ImageType::Rootfs;
    }
    // FAT boot sector signature.
    if matches_at(buf, 510, &[0x55, 0xAA]) {
        return ImageType::Mmc;
    }
    if matches_at(buf, 0, &CMT_2ND_HDR) {
        return ImageType::Cmt2nd;
    }
    if matches_at(buf, 0, &CMT_ALGO_HDR) {
        return ImageType::CmtAlgo;
    }
    if matches_at(buf, 0, &CMT_MCUSW_HDR) {
        return ImageType::CmtMcusw;
    }
    // CRAMFS magic 0x28CD3D45.
    if matches_at(buf, 0, &[0x45, 0x3D, 0xCD, 0x28]) {
        return ImageType::Rootfs;
    }
    // JFFS2 magic 0x1985; the total size splits initfs from rootfs.
    if matches_at(buf, 0, &[0x85, 0x19]) {
        return if total_size < JFFS2_INITFS_LIMIT {
            ImageType::Initfs
        } else {
            ImageType::Rootfs
        };
    }
    ImageType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_with(offset: usize, magic: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[offset..offset + magic.len()].copy_from_slice(magic);
        buf
    }

    #[test]
    fn test_noloxldr_offset_priority() {
        // NOLOXldr at +12 with everything else zeroed must classify as
        // xloader, not unknown and not secondary.
        let buf = buf_with(12, b"NOLOXldr");
        assert_eq!(type_from_content(&buf, 512), ImageType::Xloader);

        let buf = buf_with(4, b"NOLOXldr");
        assert_eq!(type_from_content(&buf, 512), ImageType::Secondary);
    }

    #[test]
    fn test_noloxldr_both_offsets_prefers_xloader() {
        let mut buf = buf_with(12, b"NOLOXldr");
        buf[4..12].copy_from_slice(b"NOLOXldr");
        assert_eq!(type_from_content(&buf, 512), ImageType::Xloader);
    }

    #[test]
    fn test_secondary_signatures() {
        assert_eq!(
            type_from_content(&buf_with(52, b"2NDAPE"), 512),
            ImageType::Secondary
        );
        assert_eq!(
            type_from_content(&buf_with(20, b"2ND"), 512),
            ImageType::Secondary
        );
        assert_eq!(
            type_from_content(&buf_with(4, b"NOLOScnd"), 512),
            ImageType::Secondary
        );
    }

    #[test]
    fn test_kernel_zimage_magic() {
        let buf = buf_with(36, &[0x18, 0x28, 0x6F, 0x01]);
        assert_eq!(type_from_content(&buf, 512), ImageType::Kernel);
    }

    #[test]
    fn test_fat_boot_sector() {
        let buf = buf_with(510, &[0x55, 0xAA]);
        assert_eq!(type_from_content(&buf, 512), ImageType::Mmc);
    }

    #[test]
    fn test_jffs2_size_split() {
        let buf = buf_with(0, &[0x85, 0x19]);
        assert_eq!(type_from_content(&buf, 0x10_0000), ImageType::Initfs);
        assert_eq!(type_from_content(&buf, JFFS2_INITFS_LIMIT), ImageType::Rootfs);
    }

    #[test]
    fn test_cmt_headers() {
        assert_eq!(
            type_from_content(&buf_with(0, &CMT_2ND_HDR), 512),
            ImageType::Cmt2nd
        );
        assert_eq!(
            type_from_content(&buf_with(0, &CMT_ALGO_HDR), 512),
            ImageType::CmtAlgo
        );
        assert_eq!(
            type_from_content(&buf_with(0, &CMT_MCUSW_HDR), 512),
            ImageType::CmtMcusw
        );
    }

    #[test]
    fn test_all_zero_is_unknown() {
        assert_eq!(type_from_content(&[0u8; 512], 512), ImageType::Unknown);
    }
}
