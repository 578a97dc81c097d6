//! Closed registries: image types, device models, hardware revision lists
//! and the configuration fields exposed by the device protocols.

use std::fmt;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown image type: {0}")]
    UnknownImageType(String),

    #[error("Unknown device model: {0}")]
    UnknownDevice(String),

    #[error("Unknown configuration field: {0}")]
    UnknownField(String),

    #[error("Invalid hardware revision: {0}")]
    InvalidHwRev(String),
}

/// Firmware piece type.
///
/// The string forms are the on-disk names stored in container records and
/// used in derived filenames; they round-trip exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Xloader,
    Secondary,
    Kernel,
    Initfs,
    Rootfs,
    Mmc,
    Cmt2nd,
    CmtAlgo,
    CmtMcusw,
    First,
    CertSw,
    ApeAlgo,
    Unknown,
}

impl ImageType {
    pub const ALL: &'static [ImageType] = &[
        ImageType::Xloader,
        ImageType::Secondary,
        ImageType::Kernel,
        ImageType::Initfs,
        ImageType::Rootfs,
        ImageType::Mmc,
        ImageType::Cmt2nd,
        ImageType::CmtAlgo,
        ImageType::CmtMcusw,
        ImageType::First,
        ImageType::CertSw,
        ImageType::ApeAlgo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Xloader => "xloader",
            ImageType::Secondary => "secondary",
            ImageType::Kernel => "kernel",
            ImageType::Initfs => "initfs",
            ImageType::Rootfs => "rootfs",
            ImageType::Mmc => "mmc",
            ImageType::Cmt2nd => "cmt-2nd",
            ImageType::CmtAlgo => "cmt-algo",
            ImageType::CmtMcusw => "cmt-mcusw",
            ImageType::First => "1st",
            ImageType::CertSw => "cert-sw",
            ImageType::ApeAlgo => "ape-algo",
            ImageType::Unknown => "unknown",
        }
    }

    /// Segment alignment boundary for this type: MMC images pad to 256
    /// bytes, everything else to 128.
    pub fn alignment(&self) -> u64 {
        match self {
            ImageType::Mmc => 1 << 8,
            _ => 1 << 7,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownImageType(s.to_string()))
    }
}

/// Device model registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    /// Nokia 770
    Su18,
    /// Nokia N800
    Rx34,
    /// Nokia N810
    Rx44,
    /// Nokia N810 WiMAX
    Rx48,
    /// Nokia N900
    Rx51,
    Unknown,
}

impl DeviceModel {
    pub const ALL: &'static [DeviceModel] = &[
        DeviceModel::Su18,
        DeviceModel::Rx34,
        DeviceModel::Rx44,
        DeviceModel::Rx48,
        DeviceModel::Rx51,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceModel::Su18 => "SU-18",
            DeviceModel::Rx34 => "RX-34",
            DeviceModel::Rx44 => "RX-44",
            DeviceModel::Rx48 => "RX-48",
            DeviceModel::Rx51 => "RX-51",
            DeviceModel::Unknown => "unknown",
        }
    }

    pub fn product_name(&self) -> &'static str {
        match self {
            DeviceModel::Su18 => "Nokia 770",
            DeviceModel::Rx34 => "Nokia N800",
            DeviceModel::Rx44 => "Nokia N810",
            DeviceModel::Rx48 => "Nokia N810 WiMAX",
            DeviceModel::Rx51 => "Nokia N900",
            DeviceModel::Unknown => "unknown device",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceModel {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceModel::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownDevice(s.to_string()))
    }
}

/// Ordered hardware revision set, e.g. `2101,2102,2103`.
///
/// The wire form is a compact list of little-endian `i16` values terminated
/// by `-1`, as the NOLO piece upload expects it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HwRevList(pub Vec<i16>);

impl HwRevList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, rev: i16) -> bool {
        self.0.contains(&rev)
    }

    /// Encode as `-1`-terminated little-endian i16 list.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.0.len() + 1) * 2);
        for &rev in &self.0 {
            out.write_i16::<LittleEndian>(rev).unwrap();
        }
        out.write_i16::<LittleEndian>(-1).unwrap();
        out
    }

    /// Decode a `-1`-terminated little-endian i16 list.
    pub fn from_wire(mut data: &[u8]) -> Result<Self, RegistryError> {
        let mut revs = Vec::new();
        loop {
            let rev = data
                .read_i16::<LittleEndian>()
                .map_err(|_| RegistryError::InvalidHwRev("unterminated wire list".to_string()))?;
            if rev == -1 {
                break;
            }
            revs.push(rev);
        }
        Ok(HwRevList(revs))
    }
}

impl fmt::Display for HwRevList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rev) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rev}")?;
        }
        Ok(())
    }
}

impl FromStr for HwRevList {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(HwRevList::default());
        }
        let mut revs = Vec::new();
        for part in s.split(',') {
            let rev: i16 = part
                .trim()
                .parse()
                .map_err(|_| RegistryError::InvalidHwRev(part.to_string()))?;
            revs.push(rev);
        }
        Ok(HwRevList(revs))
    }
}

/// One applicability entry of an image: a device model plus the hardware
/// revisions the image may be flashed onto. An empty list means any
/// revision of that model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub model: DeviceModel,
    pub hwrevs: HwRevList,
}

/// Configuration fields reachable through get/set operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    NoloVersion,
    KernelVersion,
    InitfsVersion,
    SwVersion,
    ContentVersion,
    RootDevice,
    UsbHostMode,
    RdMode,
    RdFlags,
    HwRev,
}

impl ConfigField {
    pub const ALL: &'static [ConfigField] = &[
        ConfigField::NoloVersion,
        ConfigField::KernelVersion,
        ConfigField::InitfsVersion,
        ConfigField::SwVersion,
        ConfigField::ContentVersion,
        ConfigField::RootDevice,
        ConfigField::UsbHostMode,
        ConfigField::RdMode,
        ConfigField::RdFlags,
        ConfigField::HwRev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigField::NoloVersion => "nolo-ver",
            ConfigField::KernelVersion => "kernel-ver",
            ConfigField::InitfsVersion => "initfs-ver",
            ConfigField::SwVersion => "sw-ver",
            ConfigField::ContentVersion => "content-ver",
            ConfigField::RootDevice => "root-device",
            ConfigField::UsbHostMode => "usb-host-mode",
            ConfigField::RdMode => "rd-mode",
            ConfigField::RdFlags => "rd-flags",
            ConfigField::HwRev => "hw-rev",
        }
    }

    /// Index used as the wValue selector in NOLO get/set requests.
    pub fn wire_index(&self) -> u16 {
        ConfigField::ALL.iter().position(|f| f == self).unwrap() as u16
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigField {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownField(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_type_round_trip() {
        for &ty in ImageType::ALL {
            assert_eq!(ty.as_str().parse::<ImageType>().unwrap(), ty);
        }
        assert!("bogus".parse::<ImageType>().is_err());
    }

    #[test]
    fn test_image_type_alignment() {
        assert_eq!(ImageType::Mmc.alignment(), 256);
        assert_eq!(ImageType::Kernel.alignment(), 128);
        assert_eq!(ImageType::Rootfs.alignment(), 128);
    }

    #[test]
    fn test_device_round_trip() {
        for &dev in DeviceModel::ALL {
            assert_eq!(dev.as_str().parse::<DeviceModel>().unwrap(), dev);
        }
        assert!("RX-99".parse::<DeviceModel>().is_err());
    }

    #[test]
    fn test_hwrev_text_round_trip() {
        let revs: HwRevList = "2101,2102,2103".parse().unwrap();
        assert_eq!(revs.0, vec![2101, 2102, 2103]);
        assert_eq!(revs.to_string(), "2101,2102,2103");

        let empty: HwRevList = "".parse().unwrap();
        assert!(empty.is_empty());
        assert!("21x1".parse::<HwRevList>().is_err());
    }

    #[test]
    fn test_hwrev_wire_round_trip() {
        let revs: HwRevList = "5,1601".parse().unwrap();
        let wire = revs.to_wire();
        assert_eq!(wire.len(), 6);
        assert_eq!(&wire[4..], &[0xFF, 0xFF]);
        assert_eq!(HwRevList::from_wire(&wire).unwrap(), revs);
    }

    #[test]
    fn test_hwrev_wire_unterminated() {
        assert!(HwRevList::from_wire(&[0x05, 0x00]).is_err());
    }

    #[test]
    fn test_config_field_round_trip() {
        for &field in ConfigField::ALL {
            assert_eq!(field.as_str().parse::<ConfigField>().unwrap(), field);
        }
    }
}
