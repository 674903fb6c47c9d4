use crate::{
    dialect::DialectKind,
    result::{Result, SaneError},
};
use bitflags::bitflags;
use bstr::{BStr, BString, ByteSlice};
use std::{fmt, ops::RangeInclusive};

bitflags! {
    /// Model specific behaviour switches.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u32 {
        /// Every scan pass ends with padding bytes.
        const BlockPadding = 1 << 0;
        /// Odd widths are padded to an even sample count per segment.
        const OddPadding = 1 << 1;
        const Infrared = 1 << 2;
        const MultiSample = 1 << 3;
        const Adf = 1 << 4;
        const Duplex = 1 << 5;
        const Endorser = 1 << 6;
        /// Colour rasters arrive shifted unless the device has extra RAM.
        const ColorShift = 1 << 7;
        const LongWindowHeader = 1 << 8;
        const FilmLoader = 1 << 9;
    }
}

/// Standard INQUIRY data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inquiry {
    pub device_type: u8,
    pub vendor: BString,
    pub product: BString,
    pub revision: BString,
    pub raw: Vec<u8>,
}

impl Inquiry {
    pub const MIN_LEN: usize = 36;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::MIN_LEN {
            log::warn!("Inquiry data too short ({} bytes)", raw.len());
            return Err(SaneError::IO);
        }

        let text = |range: std::ops::Range<usize>| BString::from(raw[range].trim_end());

        Ok(Self {
            device_type: raw[0] & 0x1f,
            vendor: text(8..16),
            product: text(16..32),
            revision: text(32..36),
            raw: raw.to_vec(),
        })
    }

    /// Bytes at `offset`, empty when the reply is shorter.
    pub fn field(&self, offset: usize, len: usize) -> &BStr {
        self.raw
            .get(offset..offset + len)
            .unwrap_or_default()
            .trim_end()
            .as_bstr()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolutions {
    Range { range: RangeInclusive<i32>, quant: i32 },
    List(Vec<i32>),
}

impl Resolutions {
    pub fn max(&self) -> i32 {
        match self {
            Resolutions::Range { range, .. } => *range.end(),
            Resolutions::List(list) => list.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Everything known about an attached device. Immutable after attach.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub name: String,
    pub vendor: BString,
    pub model: BString,
    pub revision: BString,
    pub ty: &'static str,
    pub dialect: DialectKind,
    /// Dialect specific model index.
    pub variant: usize,
    pub x_resolutions: Resolutions,
    pub y_resolutions: Resolutions,
    /// Scan area in device units.
    pub x_range: RangeInclusive<u32>,
    pub y_range: RangeInclusive<u32>,
    /// Scan area in millimetres.
    pub x_mm: f64,
    pub y_mm: f64,
    pub max_depth: usize,
    pub frames: usize,
    pub focus: Option<RangeInclusive<u32>>,
    pub quirks: Quirks,
}

impl DeviceProfile {
    pub fn has(&self, quirks: Quirks) -> bool {
        self.quirks.contains(quirks)
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{name}' (vendor '{vendor}', model '{model}', type '{ty}')",
            name = self.name,
            vendor = self.vendor,
            model = self.model,
            ty = self.ty,
        )
    }
}
