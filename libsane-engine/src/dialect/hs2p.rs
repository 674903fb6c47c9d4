//! Ricoh IS450 / IS420 family sheet scanners.
//!
//! Geometry is sent in whole millimetres after switching the basic
//! measurement unit. A duplex scan is set up with two windows and one SCAN
//! command; the back side is served as a second image once the front side
//! is drained. When the feeder runs out of paper in the middle of a page
//! the device reports end of medium and the rest of the page is padded.

use super::{Context, Dialect, DialectKind, FramePlan};
use crate::{
    command::{self, device_type, Command, ModePage, Operation},
    device::{DeviceProfile, Inquiry, Quirks, Resolutions},
    encode::{get_be, CommandBlock},
    options::{names, Info, OptionDescriptor, OptionSet, Type, Unit, Value},
    parameters::{FrameFormat, Parameters},
    pipeline::Stage,
    reader::{Block, BlockSource},
    result::{from_outcome, Result, SaneError},
    sense::{DeviceStatus, Outcome, SenseData, SenseRule, SenseTable},
    transport::Link,
    wait::{Probe, RetryPolicy},
};
use bstr::BString;
use std::{ops::RangeInclusive, time::Duration};

pub const WINDOW_LEN: usize = 320;
const WINDOW_HEADER_LEN: usize = 8;
pub const GAMMA_LENGTH: usize = 256;
pub const ENDORSER_LEN: usize = 19;

const VENDOR: &[u8] = b"RICOH";
pub const PRODUCTS: [&str; 5] = ["IS450", "IS420", "IS430", "IS01", "IS02"];

const VPD_PAGE: u8 = 0xc0;
const JIS_PAGE: u8 = 0xf0;
const BUFFER_STATUS_LEN: u16 = 12;

/// Data type codes of READ(10) / SEND(10).
mod dtc {
    pub const IMAGE: u8 = 0x00;
    pub const GAMMA: u8 = 0x03;
    pub const ENDORSER: u8 = 0x80;
    pub const ADF_STATUS: u8 = 0x86;
}

/// Longest page the feeder accepts, in millimetres.
const ADF_MAX_LENGTH: u32 = 2000;

/// Widest line the device buffers, in bytes.
const MAX_LINEART_BYTES: f64 = 620.0;
const MAX_GRAY_BYTES: f64 = 4960.0;

const STANDARD_RESOLUTIONS: [i32; 16] = [
    60, 75, 100, 120, 150, 160, 180, 200, 240, 300, 320, 400, 480, 600, 800, 1200,
];

pub const MODES: [&str; 3] = ["Lineart", "Halftone", "Gray"];
pub const SOURCES: [&str; 2] = ["FB", "ADF"];
pub const HALFTONE_CODES: [&str; 2] = ["Dither", "Error Diffusion"];

pub const HALFTONE_PATTERNS: [&str; 12] = [
    "8x4, 45 degree",
    "6x6, 90 degree",
    "4x4, spiral",
    "8x8, 90 degree",
    "70 lines",
    "95 lines",
    "180 lines",
    "16x8, 45 degree",
    "16x16, 90 degree",
    "8x8, Bayer",
    "User #1",
    "User #2",
];

const HALFTONE_PATTERN_IDS: [u8; 12] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x80, 0x81,
];

pub const PADDING_TYPES: [&str; 3] = [
    "Pad with 0's to byte boundary",
    "Pad with 1's to byte boundary",
    "Truncate to byte boundary",
];

pub const DUPLEX: &str = "duplex";
pub const PREFEED: &str = "prefeed";
pub const ENDORSER: &str = "endorser";
pub const ENDORSER_STRING: &str = "endorser-string";
pub const PADDING: &str = "padding";
pub const PADDING_TYPE: &str = "padding-type";
pub const HALFTONE_CODE: &str = "halftone-type";
pub const HALFTONE_PATTERN: &str = "halftone-pattern";
pub const SCAN_WAIT_MODE: &str = "scan-wait-mode";
pub const WHITE_BALANCE: &str = "white-balance";
pub const NEGATIVE: &str = "negative";
pub const BRIGHTNESS: &str = "brightness";
pub const CONTRAST: &str = "contrast";
pub const STD_RESOLUTION: &str = "std-resolution";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Lineart,
    Halftone,
    Gray,
}

impl Mode {
    fn from_options(options: &OptionSet) -> Result<Self> {
        Ok(match options.string_index(names::MODE)? {
            0 => Mode::Lineart,
            1 => Mode::Halftone,
            _ => Mode::Gray,
        })
    }

    fn composition(self) -> u8 {
        match self {
            Mode::Lineart => 0x00,
            Mode::Halftone => 0x01,
            Mode::Gray => 0x02,
        }
    }

    fn depth(self) -> u8 {
        match self {
            Mode::Lineart | Mode::Halftone => 1,
            Mode::Gray => 8,
        }
    }
}

/// ADF selection of the ADF control mode page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Flatbed = 0,
    Simplex = 1,
    Duplex = 2,
}

impl Feed {
    fn from_options(options: &OptionSet) -> Result<Self> {
        if options.string_index(names::SOURCE)? == 0 {
            return Ok(Feed::Flatbed);
        }

        Ok(if flag(options, DUPLEX) {
            Feed::Duplex
        } else {
            Feed::Simplex
        })
    }
}

/// One window descriptor, geometry in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub mode: Mode,
    pub feed: Feed,
    pub x_resolution: u16,
    pub y_resolution: u16,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub length: u32,
    pub brightness: u8,
    pub threshold: u8,
    pub contrast: u8,
    pub halftone_code: u8,
    pub halftone_id: u8,
    pub padding_type: u8,
    pub negative: bool,
    pub custom_gamma: bool,
}

impl Window {
    fn from_options(options: &OptionSet, x_mm: f64) -> Result<Self> {
        let mode = Mode::from_options(options)?;
        let feed = Feed::from_options(options)?;

        let (tl_x, tl_y) = (options.fixed(names::TL_X)?, options.fixed(names::TL_Y)?);
        let (br_x, br_y) = (options.fixed(names::BR_X)?, options.fixed(names::BR_Y)?);

        let width = (br_x - tl_x).max(0.0) as u32;
        let length = (br_y - tl_y).max(0.0) as u32;

        let mut x = tl_x.max(0.0) as u32;
        if feed != Feed::Flatbed {
            // Sheets are centred in the feeder.
            let offset = ((x_mm - width as f64) / 2.0).max(0.0) as u32;
            log::debug!("Feeder origin offset {offset} mm");
            x += offset;
        }

        let byte = |name: &str| options.int(name).map(|value| match value.clamp(0, 255) {
            // 0 selects the device default of 128.
            128 => 0,
            value => value as u8,
        });

        let halftone_code = match options.string_index(HALFTONE_CODE)? {
            0 => 0x02,
            _ => 0x03,
        };

        Ok(Self {
            mode,
            feed,
            x_resolution: options.int(names::RESOLUTION)?.clamp(0, u16::MAX as i32) as u16,
            y_resolution: options.int(names::Y_RESOLUTION)?.clamp(0, u16::MAX as i32) as u16,
            x,
            y: tl_y.max(0.0) as u32,
            width,
            length,
            brightness: byte(BRIGHTNESS)?,
            threshold: byte(names::THRESHOLD)?,
            contrast: byte(CONTRAST)?,
            halftone_code,
            halftone_id: HALFTONE_PATTERN_IDS
                .get(options.string_index(HALFTONE_PATTERN)?)
                .copied()
                .unwrap_or(HALFTONE_PATTERN_IDS[0]),
            padding_type: options.string_index(PADDING_TYPE)? as u8 + 1,
            negative: flag(options, NEGATIVE),
            custom_gamma: flag(options, names::CUSTOM_GAMMA),
        })
    }

    /// Reject windows the device would refuse.
    fn check(&self, x_res: &RangeInclusive<i32>, y_res: &RangeInclusive<i32>, x_mm: f64, y_mm: f64) -> Result<()> {
        if !x_res.contains(&(self.x_resolution as i32)) || !y_res.contains(&(self.y_resolution as i32)) {
            log::warn!(
                "Resolution {}x{} outside {x_res:?} x {y_res:?}",
                self.x_resolution,
                self.y_resolution
            );
            return Err(SaneError::Inval);
        }

        let inches = self.width as f64 / 25.4;
        let (bytes, limit) = match self.mode {
            Mode::Lineart | Mode::Halftone => (inches * self.x_resolution as f64 / 8.0, MAX_LINEART_BYTES),
            Mode::Gray => (inches * self.x_resolution as f64, MAX_GRAY_BYTES),
        };
        if bytes > limit {
            log::warn!("Line of {bytes:.0} bytes is wider than {limit} bytes");
            return Err(SaneError::Inval);
        }

        let x_max = x_mm as u32;
        let y_max = match self.feed {
            Feed::Flatbed => y_mm as u32,
            Feed::Simplex | Feed::Duplex => ADF_MAX_LENGTH,
        };

        let right = self.x + self.width;
        let bottom = self.y + self.length;
        if right == 0 || right > x_max || bottom == 0 || bottom > y_max {
            log::warn!("Window {right}x{bottom} mm outside {x_max}x{y_max} mm");
            return Err(SaneError::Inval);
        }

        Ok(())
    }

    pub fn parameters(&self) -> Parameters {
        let pixels = self.width as usize * self.x_resolution as usize * 10 / 254;
        let lines = self.length as usize * self.y_resolution as usize * 10 / 254;

        let (pixels_per_line, bytes_per_line, depth) = match self.mode {
            // The device truncates to the byte boundary.
            Mode::Lineart | Mode::Halftone => (pixels / 8 * 8, pixels / 8, 1),
            Mode::Gray => (pixels, pixels, 8),
        };

        Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line,
            pixels_per_line,
            lines,
            depth,
        }
    }

    /// Window descriptor `id`.
    pub fn descriptor(&self, id: u8) -> Result<Vec<u8>> {
        let binary = matches!(self.mode, Mode::Lineart | Mode::Halftone);

        let (halftone_code, halftone_id) = match self.mode {
            Mode::Halftone => (self.halftone_code, self.halftone_id),
            Mode::Lineart | Mode::Gray => (0x02, 0x01),
        };

        let mut byte29 = self.padding_type & 0x07;
        if binary && self.negative {
            byte29 |= 0x80;
        }

        let mut byte42 = 0;
        if self.mode == Mode::Gray {
            if !self.negative {
                byte42 |= 0x80;
            }
            if self.custom_gamma {
                byte42 |= 0x08;
            }
        }

        let block = CommandBlock::new(WINDOW_LEN)
            .byte(0, id)?
            .field(2, 2, self.x_resolution as u64)?
            .field(4, 2, self.y_resolution as u64)?
            .field(6, 4, self.x as u64)?
            .field(10, 4, self.y as u64)?
            .field(14, 4, self.width as u64)?
            .field(18, 4, self.length as u64)?
            .byte(22, self.brightness)?
            .byte(23, self.threshold)?
            .byte(24, self.contrast)?
            .byte(25, self.mode.composition())?
            .byte(26, self.mode.depth())?
            .byte(27, halftone_code)?
            .byte(28, halftone_id)?
            .byte(29, byte29)?
            // Packed gray, MSB first, bit 7 first.
            .field(30, 2, 0x0007)?
            .byte(33, 0x02)?
            .byte(42, byte42)?;

        Ok(block.into_bytes())
    }

    /// SET WINDOW parameter list: header plus two descriptors, the second
    /// one only filled for duplex scans.
    pub fn window_list(&self) -> Result<Vec<u8>> {
        let descriptors = 2 * WINDOW_LEN;
        let header = CommandBlock::new(WINDOW_HEADER_LEN).field(6, 2, descriptors as u64)?;

        let mut list = header.into_bytes();
        list.extend(self.descriptor(0)?);
        if self.feed == Feed::Duplex {
            list.extend(self.descriptor(1)?);
        } else {
            list.extend([0u8; WINDOW_LEN]);
        }

        Ok(list)
    }

    fn window_ids(&self) -> &'static [u8] {
        match self.feed {
            Feed::Duplex => &[0, 1],
            Feed::Flatbed | Feed::Simplex => &[0],
        }
    }

    /// Byte used to pad a page cut short by the feeder, `None` truncates.
    fn fill(&self, padding: bool) -> Option<u8> {
        padding.then_some(if self.negative { 0x00 } else { 0xff })
    }
}

fn flag(options: &OptionSet, name: &str) -> bool {
    options.is_active(name) && options.bool(name) == Ok(true)
}

/// Characters the endorser can print.
fn is_endorser_char(c: u8) -> bool {
    matches!(c, b'0'..=b':' | b'#' | b'\'' | b','..=b'/' | b' ' | b'A'..=b'Z' | b'a'..=b'z')
}

pub fn endorser_data(text: &[u8]) -> Result<Vec<u8>> {
    if text.len() > ENDORSER_LEN {
        log::warn!("Endorser string longer than {ENDORSER_LEN} characters");
        return Err(SaneError::Inval);
    }

    if let Some(c) = text.iter().find(|c| !is_endorser_char(**c)) {
        log::warn!("Endorser cannot print 0x{c:02x}");
        return Err(SaneError::Inval);
    }

    let mut data = vec![b' '; ENDORSER_LEN];
    data[..text.len()].copy_from_slice(text);
    Ok(data)
}

/// Vital product data page 0xC0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// 0 none, 1 simplex, 2 duplex, 3 reverse duplex.
    pub adf: u8,
    pub endorser: bool,
    pub ipu: bool,
    pub compositions: u8,
}

impl Capabilities {
    pub fn parse(raw: &[u8]) -> Self {
        let at = |offset: usize| raw.get(offset).copied().unwrap_or(0);

        Self {
            adf: at(4),
            endorser: at(5) == 1,
            ipu: at(6) & 0x01 != 0,
            compositions: at(7),
        }
    }
}

/// JIS information page 0xF0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JisInfo {
    pub basic: (u32, u32),
    pub step: (i32, i32),
    pub max: (i32, i32),
    pub min: (i32, i32),
    pub standard: Vec<i32>,
    /// Largest window in basic resolution pixels.
    pub window: (u32, u32),
}

impl JisInfo {
    pub fn parse(raw: &[u8]) -> Self {
        let at = |offset, width| get_be(raw, offset, width).unwrap_or(0);
        let bits = (at(18, 2) as u16).reverse_bits();

        let standard = STANDARD_RESOLUTIONS
            .iter()
            .enumerate()
            .filter(|(bit, _)| bits & (1 << bit) != 0)
            .map(|(_, resolution)| *resolution)
            .collect();

        let step = at(9, 1) as i32;

        Self {
            basic: (at(5, 2) as u32, at(7, 2) as u32),
            step: ((step >> 4) & 0x0f, step & 0x0f),
            max: (at(10, 2) as i32, at(12, 2) as i32),
            min: (at(14, 2) as i32, at(16, 2) as i32),
            standard,
            window: (at(20, 4) as u32, at(24, 4) as u32),
        }
    }

    /// Scan area in millimetres, with letter by legal as fallback.
    fn area_mm(&self) -> (f64, f64) {
        let (basic_x, basic_y) = (self.basic.0.max(1) as f64, self.basic.1.max(1) as f64);

        let width = match self.window.0 {
            0 => {
                log::warn!("Invalid window width reported, use 8.5 inches");
                basic_x * 8.5
            }
            width => width as f64,
        };
        let length = match self.window.1 {
            0 => {
                log::warn!("Invalid window length reported, use 14 inches");
                basic_y * 14.0
            }
            length => length as f64,
        };

        (width / basic_x * 25.4, length / basic_y * 25.4)
    }
}

pub fn matches(inquiry: &Inquiry) -> bool {
    inquiry.device_type == device_type::SCANNER
        && inquiry.vendor == VENDOR
        && PRODUCTS.iter().any(|product| inquiry.product.starts_with(product.as_bytes()))
}

pub fn probe(link: &mut Link, inquiry: &Inquiry, name: &str) -> Result<DeviceProfile> {
    // A pending unit attention is reported as ready.
    let ready = link.exchange(&command::test_unit_ready())?;
    from_outcome(ready.outcome)?;

    let caps = Capabilities::parse(&link.run(&command::page_inquiry(VPD_PAGE, 0x20)?)?);
    let jis = JisInfo::parse(&link.run(&command::page_inquiry(JIS_PAGE, 0x20)?)?);
    log::debug!("Capabilities {caps:?}, {jis:?}");

    let variant = PRODUCTS
        .iter()
        .position(|product| inquiry.product.starts_with(product.as_bytes()))
        .unwrap_or(0);

    let mut quirks = Quirks::LongWindowHeader;
    if caps.adf != 0 {
        quirks |= Quirks::Adf;
    }
    if caps.adf == 2 || caps.adf == 3 {
        quirks |= Quirks::Duplex;
    }
    if caps.endorser {
        quirks |= Quirks::Endorser;
    }

    let ty = if quirks.contains(Quirks::Duplex) {
        "flatbed/duplex ADF scanner"
    } else if quirks.contains(Quirks::Adf) {
        "flatbed/ADF scanner"
    } else {
        "flatbed scanner"
    };

    let (x_mm, y_mm) = jis.area_mm();
    let resolutions = |min: i32, max: i32, step: i32| match (min, max) {
        (1.., 1..) if min <= max => Resolutions::Range {
            range: min..=max,
            quant: step.max(1),
        },
        _ => {
            log::warn!("Invalid resolution range {min}..{max}, use standard list");
            Resolutions::List(vec![200, 300])
        }
    };

    Ok(DeviceProfile {
        name: name.to_owned(),
        vendor: inquiry.vendor.clone(),
        model: inquiry.product.clone(),
        revision: inquiry.revision.clone(),
        ty,
        dialect: DialectKind::Hs2p,
        variant,
        x_resolutions: resolutions(jis.min.0, jis.max.0, jis.step.0),
        y_resolutions: resolutions(jis.min.1, jis.max.1, jis.step.1),
        x_range: 0..=x_mm as u32,
        y_range: 0..=y_mm as u32,
        x_mm,
        y_mm,
        max_depth: 8,
        frames: 1,
        focus: None,
        quirks,
    })
}

const KEYS: SenseTable = SenseTable(&[
    SenseRule::key(0x00, Outcome::Ready, "no sense"),
    SenseRule::key(0x01, Outcome::InvalidParameter, "recovered error"),
    SenseRule::key(0x02, Outcome::Busy, "not ready"),
    SenseRule::key(0x03, Outcome::Jammed, "medium error"),
    SenseRule::key(0x04, Outcome::IoError, "hardware error"),
    SenseRule::key(0x05, Outcome::InvalidParameter, "illegal request"),
    SenseRule::key(0x06, Outcome::Ready, "unit attention"),
    SenseRule::key(0x07, Outcome::InvalidParameter, "data protect"),
    SenseRule::key(0x08, Outcome::InvalidParameter, "blank check"),
    SenseRule::key(0x09, Outcome::InvalidParameter, "vendor specific"),
    SenseRule::key(0x0a, Outcome::Cancelled, "copy aborted"),
    SenseRule::key(0x0b, Outcome::Cancelled, "aborted command"),
    SenseRule::catch_all(Outcome::InvalidParameter, "reserved"),
]);

const ADDITIONAL: SenseTable = SenseTable(&[
    SenseRule::additional(0x00, 0x00, Outcome::Ready, "No additional information"),
    SenseRule::additional(0x00, 0x02, Outcome::NoMedium, "End of medium"),
    SenseRule::additional(0x00, 0x05, Outcome::EndOfData, "End of data"),
    SenseRule::additional(0x04, 0x00, Outcome::Busy, "LUN not ready"),
    SenseRule::additional(0x04, 0x01, Outcome::Busy, "LUN becoming ready"),
    SenseRule::additional(0x04, 0x03, Outcome::IoError, "LUN not ready, manual intervention needed"),
    SenseRule::additional(0x05, 0x00, Outcome::InvalidParameter, "LUN does not respond to selection"),
    SenseRule::additional(0x07, 0x00, Outcome::InvalidParameter, "Multiple peripheral devices selected"),
    SenseRule::additional(0x11, 0x00, Outcome::IoError, "Unrecovered read error"),
    SenseRule::additional(0x11, 0x01, Outcome::IoError, "Read retries exhausted"),
    SenseRule::additional(0x15, 0x01, Outcome::IoError, "Mechanical positioning error"),
    SenseRule::additional(0x1a, 0x00, Outcome::InvalidParameter, "Parameter list length error"),
    SenseRule::additional(0x20, 0x00, Outcome::InvalidParameter, "Invalid command operation code"),
    SenseRule::additional(0x24, 0x00, Outcome::InvalidParameter, "Invalid field in CDB"),
    SenseRule::additional(0x25, 0x00, Outcome::Unsupported, "LUN not supported"),
    SenseRule::additional(0x26, 0x00, Outcome::InvalidParameter, "Invalid field in parameter list"),
    SenseRule::additional(0x29, 0x00, Outcome::Ready, "Power on, reset or bus device reset occurred"),
    SenseRule::additional(0x2a, 0x01, Outcome::InvalidParameter, "Mode parameter changed"),
    SenseRule::additional(0x2c, 0x00, Outcome::InvalidParameter, "Command sequence error"),
    SenseRule::additional(0x2c, 0x01, Outcome::InvalidParameter, "Too many windows specified"),
    SenseRule::additional(0x2c, 0x02, Outcome::InvalidParameter, "Invalid combination of windows specified"),
    SenseRule::additional(0x37, 0x00, Outcome::InvalidParameter, "Rounded parameter"),
    SenseRule::additional(0x39, 0x00, Outcome::InvalidParameter, "Saving parameters not supported"),
    SenseRule::additional(0x3a, 0x00, Outcome::NoMedium, "Medium not present"),
    SenseRule::additional(0x3b, 0x09, Outcome::EndOfData, "Read past end of medium"),
    SenseRule::additional(0x3b, 0x0b, Outcome::EndOfData, "Position past end of medium"),
    SenseRule::additional(0x3d, 0x00, Outcome::InvalidParameter, "Invalid bits in IDENTIFY message"),
    SenseRule::additional(0x43, 0x00, Outcome::InvalidParameter, "Message error"),
    SenseRule::additional(0x45, 0x00, Outcome::IoError, "Select/reselect failure"),
    SenseRule::additional(0x47, 0x00, Outcome::IoError, "SCSI parity error"),
    SenseRule::additional(0x48, 0x00, Outcome::IoError, "Initiator detected error message received"),
    SenseRule::additional(0x49, 0x00, Outcome::InvalidParameter, "Invalid message error"),
    SenseRule::additional(0x4b, 0x00, Outcome::IoError, "Data phase error"),
    SenseRule::additional(0x53, 0x00, Outcome::IoError, "Media load/eject failed"),
    SenseRule::additional(0x60, 0x00, Outcome::IoError, "Lamp failure"),
    SenseRule::additional(0x60, 0x01, Outcome::IoError, "Shading error"),
    SenseRule::additional(0x60, 0x02, Outcome::IoError, "White adjustment error"),
    SenseRule::additional(0x60, 0x10, Outcome::IoError, "Reverse side lamp failure"),
    SenseRule::additional(0x62, 0x00, Outcome::IoError, "Scan head positioning error"),
    SenseRule::additional(0x63, 0x00, Outcome::Cancelled, "Document waiting cancel"),
    SenseRule::additional(0x80, 0x00, Outcome::IoError, "PSU overheated"),
    SenseRule::additional(0x80, 0x01, Outcome::IoError, "PSU 24V fuse down"),
    SenseRule::additional(0x80, 0x02, Outcome::IoError, "ADF 24V fuse down"),
    SenseRule::additional(0x80, 0x03, Outcome::IoError, "5V fuse down"),
    SenseRule::additional(0x80, 0x04, Outcome::IoError, "-12V fuse down"),
    SenseRule::additional(0x81, 0x00, Outcome::IoError, "ADF 24V power off"),
    SenseRule::additional(0x81, 0x02, Outcome::IoError, "Base 12V power off"),
    SenseRule::additional(0x81, 0x03, Outcome::IoError, "Lamp cover open (lamp 24V power off)"),
    SenseRule::additional(0x81, 0x04, Outcome::IoError, "-12V power off"),
    SenseRule::additional(0x81, 0x05, Outcome::IoError, "Endorser 6V power off"),
    SenseRule::additional(0x81, 0x06, Outcome::IoError, "SCU 3.3V power down error"),
    SenseRule::additional(0x81, 0x07, Outcome::IoError, "RCU 3.3V power down error"),
    SenseRule::additional(0x81, 0x08, Outcome::IoError, "OIPU 3.3V power down error"),
    SenseRule::additional(0x82, 0x00, Outcome::IoError, "Memory error (bus error)"),
    SenseRule::additional(0x82, 0x10, Outcome::IoError, "Reverse side memory error (bus error)"),
    SenseRule::additional(0x83, 0x00, Outcome::IoError, "Image data processing LSI error"),
    SenseRule::additional(0x83, 0x01, Outcome::IoError, "Interface LSI error"),
    SenseRule::additional(0x83, 0x02, Outcome::IoError, "SCSI controller error"),
    SenseRule::additional(0x83, 0x03, Outcome::IoError, "Compression unit error"),
    SenseRule::additional(0x83, 0x04, Outcome::IoError, "Marker detect unit error"),
    SenseRule::additional(0x84, 0x00, Outcome::IoError, "Endorser error"),
    SenseRule::additional(0x85, 0x00, Outcome::IoError, "Origin positioning error"),
    SenseRule::additional(0x86, 0x00, Outcome::IoError, "Mechanical time out error (pick up roller error)"),
    SenseRule::additional(0x87, 0x00, Outcome::IoError, "Heater error"),
    SenseRule::additional(0x88, 0x00, Outcome::IoError, "Thermistor error"),
    SenseRule::additional(0x89, 0x00, Outcome::CoverOpen, "ADF cover open"),
    SenseRule::additional(0x89, 0x01, Outcome::CoverOpen, "ADF lift up"),
    SenseRule::additional(0x89, 0x02, Outcome::Jammed, "Document jam error for ADF"),
    SenseRule::additional(0x89, 0x03, Outcome::Jammed, "Document misfeed for ADF"),
    SenseRule::additional(0x8a, 0x00, Outcome::CoverOpen, "Interlock open"),
    SenseRule::additional(0x8b, 0x00, Outcome::OutOfMemory, "Not enough memory"),
    SenseRule::additional(0x8c, 0x00, Outcome::IoError, "Size detection failed"),
    SenseRule::catch_all(Outcome::IoError, "unknown additional sense code"),
]);

/// Text for an additional sense code.
pub fn describe(sense: &SenseData) -> &'static str {
    ADDITIONAL.lookup(sense).map_or("unknown", |rule| rule.text)
}

/// Error code 0x70 carries a meaningful ASC/ASCQ which overrides the key,
/// deferred errors (0x71) only have the key.
pub fn classify(sense: &SenseData, status: &mut DeviceStatus) -> Outcome {
    let outcome = match sense.error_code {
        0x70 => ADDITIONAL.classify(sense),
        0x71 => KEYS.classify(sense),
        code => {
            log::warn!("Invalid sense error code 0x{code:02x}");
            Outcome::IoError
        }
    };

    status.set(DeviceStatus::Busy, outcome == Outcome::Busy);
    status.set(DeviceStatus::NoDocs, outcome == Outcome::NoMedium);
    status.set(DeviceStatus::Error, outcome == Outcome::IoError);

    outcome
}

/// Reply to GET DATA BUFFER STATUS: 4 byte header and one status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatus {
    pub len: usize,
    pub window: u8,
    pub free: usize,
    pub filled: usize,
}

impl BufferStatus {
    pub fn parse(raw: &[u8]) -> Self {
        let at = |offset, width| get_be(raw, offset, width).unwrap_or(0) as usize;

        Self {
            len: at(0, 3),
            window: raw.get(4).copied().unwrap_or(0),
            free: at(6, 3),
            filled: at(9, 3),
        }
    }

    fn has_data(&self) -> bool {
        self.len > 8 && self.filled > 0
    }
}

/// Probe once whether scan data is buffered. Only a not-ready report keeps
/// the wait going, a failing device ends it.
fn data_ready(link: &mut Link) -> Result<Probe<()>> {
    let reply = link.exchange(&command::get_data_buffer_status(false, BUFFER_STATUS_LEN)?)?;

    match reply.outcome {
        Outcome::Ready => {}
        Outcome::Busy => return Ok(Probe::Busy),
        outcome => return from_outcome(outcome).map(Probe::Ready),
    }

    let status = BufferStatus::parse(&reply.data);
    log::trace!("Buffer status {status:?}");

    Ok(if status.has_data() {
        Probe::Ready(())
    } else {
        Probe::Busy
    })
}

/// Image data of one side. After an end of medium report the rest of the
/// side is made of padding.
#[derive(Debug)]
struct Hs2pSource {
    remaining: usize,
    line_len: usize,
    fill: Option<u8>,
    end_of_medium: bool,
}

impl BlockSource for Hs2pSource {
    fn line_len(&self) -> usize {
        self.line_len
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn next_block(&mut self, link: &mut Link, max: usize) -> Result<Block> {
        if self.remaining == 0 {
            return Ok(Block::End);
        }

        let len = max.min(self.remaining);

        if self.end_of_medium {
            let Some(fill) = self.fill else {
                self.remaining = 0;
                return Ok(Block::End);
            };

            self.remaining -= len;
            return Ok(Block::Data(vec![fill; len]));
        }

        let reply = link.exchange(&command::read_10(dtc::IMAGE, 0, len)?)?;

        let mut data = match (reply.outcome, reply.sense) {
            (Outcome::Ready, _) => reply.data,
            (Outcome::Busy, _) => return Ok(Block::Busy),
            (Outcome::NoMedium | Outcome::EndOfData, Some(sense)) => {
                let valid = if sense.ili {
                    len.saturating_sub(sense.information as usize)
                } else {
                    reply.data.len()
                };

                log::debug!(
                    "{} after {valid} of {len} bytes, {} left",
                    describe(&sense),
                    self.remaining - valid.min(self.remaining)
                );
                self.end_of_medium = true;

                let mut data = reply.data;
                match self.fill {
                    Some(fill) => data.resize(len, fill),
                    None => data.truncate(valid),
                }
                data
            }
            (outcome, _) => {
                from_outcome(outcome)?;
                reply.data
            }
        };

        if data.is_empty() {
            return if self.end_of_medium {
                self.next_block(link, max)
            } else {
                Ok(Block::Busy)
            };
        }

        data.truncate(self.remaining);
        self.remaining -= data.len();
        Ok(Block::Data(data))
    }
}

#[derive(Debug, Clone, Copy)]
struct Prepared {
    window: Window,
    padding: bool,
}

#[derive(Debug)]
pub struct Hs2p {
    x_mm: f64,
    y_mm: f64,
    x_res: RangeInclusive<i32>,
    y_res: RangeInclusive<i32>,
    quirks: Quirks,
    prepared: Option<Prepared>,
    /// Back side of a duplex sheet still to be served.
    back_side: Option<Prepared>,
}

fn range_of(resolutions: &Resolutions) -> RangeInclusive<i32> {
    match resolutions {
        Resolutions::Range { range, .. } => range.clone(),
        Resolutions::List(list) => {
            list.iter().copied().min().unwrap_or(0)..=list.iter().copied().max().unwrap_or(0)
        }
    }
}

impl Hs2p {
    pub fn new(profile: &DeviceProfile) -> Self {
        Self {
            x_mm: profile.x_mm,
            y_mm: profile.y_mm,
            x_res: range_of(&profile.x_resolutions),
            y_res: range_of(&profile.y_resolutions),
            quirks: profile.quirks,
            prepared: None,
            back_side: None,
        }
    }

    fn window(&self, options: &OptionSet) -> Result<Window> {
        Window::from_options(options, self.x_mm)
    }

    fn plan(prepared: &Prepared) -> FramePlan {
        let params = prepared.window.parameters();
        log::debug!("Side parameters {params:?}");

        FramePlan {
            params,
            stage: Stage::Copy {
                line_len: params.bytes_per_line,
            },
            source: Box::new(Hs2pSource {
                remaining: params.frame_size(),
                line_len: params.bytes_per_line,
                fill: prepared.window.fill(prepared.padding),
                end_of_medium: false,
            }),
        }
    }

    fn mode_select(&self, ctx: &mut Context, page: ModePage) -> Result<()> {
        log::debug!("Select mode page 0x{:02x} {:02x?}", page.code, page.params);
        ctx.run(&self.encode(&Operation::ModeSelect(page), ctx.options)?).map(drop)
    }

    /// Fail early when the feeder is empty or open.
    fn check_feeder(&self, ctx: &mut Context) -> Result<()> {
        let status = ctx.run(&command::read_10(dtc::ADF_STATUS, 0, 1)?)?;
        let status = status.first().copied().unwrap_or(0);
        log::debug!("ADF status 0x{status:02x}");

        if status & 0x01 != 0 {
            log::warn!("No document in the feeder");
            return Err(SaneError::NoDocs);
        }
        if status & 0x02 != 0 {
            log::warn!("Feeder cover open");
            return Err(SaneError::CoverOpen);
        }

        Ok(())
    }

    fn unload_and_release(&mut self, ctx: &mut Context) -> Result<()> {
        self.prepared = None;
        self.back_side = None;

        let unload = ctx.link.exchange(&self.encode(&Operation::Abort, ctx.options)?)?;
        if unload.outcome != Outcome::Ready {
            log::warn!("Object position failed with {}", unload.outcome);
        }

        ctx.run(&self.encode(&Operation::Release, ctx.options)?).map(drop)
    }
}

impl Dialect for Hs2p {
    fn kind(&self) -> DialectKind {
        DialectKind::Hs2p
    }

    fn wait_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(15, Duration::from_secs(1))
    }

    fn encode(&self, op: &Operation, options: &OptionSet) -> Result<Command> {
        match op {
            Operation::SetWindow => command::set_window(self.window(options)?.window_list()?),
            Operation::GetWindow => command::get_window(0, WINDOW_HEADER_LEN + 2 * WINDOW_LEN),
            Operation::TriggerScan => command::scan(self.window(options)?.window_ids()),
            Operation::BufferStatus => command::get_data_buffer_status(false, BUFFER_STATUS_LEN),
            Operation::SendGamma => {
                let mut table = vec![0x08, 0x08];
                table.extend(
                    options
                        .vector(names::GAMMA_VECTOR)?
                        .iter()
                        .map(|word| (*word).clamp(0, 255) as u8),
                );
                command::send_10(dtc::GAMMA, 0, table)
            }
            Operation::SendEndorser(text) => command::send_10(dtc::ENDORSER, 0, endorser_data(text)?),
            Operation::Abort => command::object_position(false),
            op => command::encode_standard(op),
        }
    }

    fn options(&self, profile: &DeviceProfile) -> OptionSet {
        let resolution = |name, title, range: &RangeInclusive<i32>| {
            OptionDescriptor::new(name, title, "Sets the resolution of the scanned image.", Type::Int)
                .unit(Unit::Dpi)
                .range(range.clone(), 1)
        };
        let standard: Vec<i32> = STANDARD_RESOLUTIONS
            .iter()
            .copied()
            .filter(|resolution| self.x_res.contains(resolution))
            .collect();
        let default_resolution = if self.x_res.contains(&400) {
            400
        } else {
            *self.x_res.start()
        };

        let x_max = crate::options::fix(profile.x_mm);
        let y_max = crate::options::fix(profile.y_mm);
        let geometry = |name, title, max| {
            OptionDescriptor::new(name, title, "", Type::Fixed)
                .unit(Unit::Mm)
                .range(0..=max, 0)
        };
        let level = |name, title, description| {
            OptionDescriptor::new(name, title, description, Type::Int).range(1..=255, 1)
        };
        let feeder = |descriptor: OptionDescriptor, quirk| {
            if profile.has(quirk) {
                descriptor
            } else {
                descriptor.inactive()
            }
        };

        let mut options = OptionSet::new()
            .group("Scan Mode")
            .option(
                OptionDescriptor::new(names::MODE, "Scan mode", "Selects the scan mode.", Type::String)
                    .string_list(&MODES),
                Value::String(MODES[0].into()),
            )
            .option(
                OptionDescriptor::new(
                    STD_RESOLUTION,
                    "Standard resolution",
                    "Sets both resolutions to one of the standard values.",
                    Type::Int,
                )
                .unit(Unit::Dpi)
                .word_list(standard),
                Value::Int(default_resolution),
            )
            .option(resolution(names::RESOLUTION, "X-resolution", &self.x_res), Value::Int(default_resolution))
            .option(resolution(names::Y_RESOLUTION, "Y-resolution", &self.y_res), Value::Int(default_resolution))
            .group("Geometry")
            .option(
                OptionDescriptor::new(
                    PADDING,
                    "Pad",
                    "Pad the page with blank lines when the feeder runs out of paper.",
                    Type::Bool,
                ),
                Value::Bool(true),
            )
            .option(geometry(names::TL_X, "Top-left x", x_max), Value::Fixed(0))
            .option(geometry(names::TL_Y, "Top-left y", y_max), Value::Fixed(0))
            .option(geometry(names::BR_X, "Bottom-right x", x_max), Value::Fixed(x_max))
            .option(geometry(names::BR_Y, "Bottom-right y", y_max), Value::Fixed(y_max))
            .group("Feeder")
            .option(
                feeder(
                    OptionDescriptor::new(names::SOURCE, "Scan source", "Selects the scan source.", Type::String)
                        .string_list(&SOURCES),
                    Quirks::Adf,
                ),
                Value::String(SOURCES[0].into()),
            )
            .option(
                OptionDescriptor::new(DUPLEX, "Duplex", "Scan both sides of the sheet.", Type::Bool).inactive(),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(PREFEED, "Prefeed", "Feed the next sheet while scanning.", Type::Bool)
                    .inactive(),
                Value::Bool(false),
            )
            .option(
                feeder(
                    OptionDescriptor::new(ENDORSER, "Endorser", "Print a string on each sheet.", Type::Bool),
                    Quirks::Endorser,
                ),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(ENDORSER_STRING, "Endorser string", "Up to 19 printable characters.", Type::String)
                    .inactive(),
                Value::String(BString::default()),
            )
            .group("Enhancement")
            .option(
                OptionDescriptor::new(HALFTONE_CODE, "Halftone type", "", Type::String)
                    .string_list(&HALFTONE_CODES)
                    .inactive(),
                Value::String(HALFTONE_CODES[0].into()),
            )
            .option(
                OptionDescriptor::new(HALFTONE_PATTERN, "Halftone pattern", "", Type::String)
                    .string_list(&HALFTONE_PATTERNS)
                    .inactive(),
                Value::String(HALFTONE_PATTERNS[0].into()),
            )
            .option(
                OptionDescriptor::new(
                    SCAN_WAIT_MODE,
                    "Scan wait mode",
                    "Wait for the start button before scanning.",
                    Type::Bool,
                ),
                Value::Bool(false),
            )
            .option(level(BRIGHTNESS, "Brightness", "Controls the brightness."), Value::Int(128))
            .option(
                level(names::THRESHOLD, "Threshold", "Select minimum-brightness to get a white point"),
                Value::Int(128),
            )
            .option(level(CONTRAST, "Contrast", "Controls the contrast."), Value::Int(128))
            .option(
                OptionDescriptor::new(
                    names::CUSTOM_GAMMA,
                    "Use custom gamma table",
                    "Determines whether a builtin or a custom gamma-table should be used.",
                    Type::Bool,
                ),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(names::GAMMA_VECTOR, "Image intensity", "", Type::Vector)
                    .vector(GAMMA_LENGTH)
                    .range(0..=255, 0)
                    .inactive(),
                Value::Vector((0..GAMMA_LENGTH as i32).collect()),
            )
            .option(
                OptionDescriptor::new(NEGATIVE, "Negative", "Swap black and white.", Type::Bool),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(
                    WHITE_BALANCE,
                    "White balance",
                    "Use absolute instead of relative white.",
                    Type::Bool,
                )
                .advanced(),
                Value::Bool(false),
            )
            .group("Miscellaneous")
            .option(
                OptionDescriptor::new(PADDING_TYPE, "Padding type", "", Type::String)
                    .string_list(&PADDING_TYPES)
                    .advanced(),
                Value::String(PADDING_TYPES[2].into()),
            );

        apply_mode(&mut options);
        apply_source(&mut options, self.quirks);
        options
    }

    fn on_change(&self, options: &mut OptionSet, index: usize) -> Info {
        match options.name_of(index) {
            Some(names::MODE) => {
                apply_mode(options);
                Info::ReloadOptions | Info::ReloadParams
            }
            Some(names::CUSTOM_GAMMA) => {
                apply_mode(options);
                Info::ReloadOptions
            }
            Some(names::SOURCE) => {
                apply_source(options, self.quirks);
                Info::ReloadOptions | Info::ReloadParams
            }
            Some(ENDORSER) => {
                options.activate(ENDORSER_STRING, flag(options, ENDORSER));
                Info::ReloadOptions
            }
            Some(STD_RESOLUTION) => {
                if let Ok(resolution) = options.int(STD_RESOLUTION) {
                    for name in [names::RESOLUTION, names::Y_RESOLUTION] {
                        _ = options.store(name, Value::Int(resolution));
                    }
                }
                Info::ReloadOptions | Info::ReloadParams
            }
            Some(
                names::RESOLUTION | names::Y_RESOLUTION | names::TL_X | names::TL_Y | names::BR_X
                | names::BR_Y | DUPLEX,
            ) => Info::ReloadParams,
            _ => Info::empty(),
        }
    }

    fn estimate(&self, _profile: &DeviceProfile, options: &OptionSet) -> Result<Parameters> {
        Ok(self.window(options)?.parameters())
    }

    fn configure(&mut self, ctx: &mut Context) -> Result<()> {
        let window = self.window(ctx.options)?;
        window.check(&self.x_res, &self.y_res, self.x_mm, self.y_mm)?;
        log::debug!("Use window {window:?}");

        ctx.wait_unit_ready(&self.wait_policy())?;
        ctx.run(&self.encode(&Operation::Reserve, ctx.options)?)?;

        self.mode_select(ctx, ModePage::measurement_unit(1, 1))?;
        self.mode_select(
            ctx,
            ModePage::adf_control(window.feed as u8, flag(ctx.options, PREFEED), 0),
        )?;

        let endorser = flag(ctx.options, ENDORSER);
        self.mode_select(ctx, ModePage::endorser_control(endorser))?;
        if endorser {
            let text = ctx.options.string(ENDORSER_STRING)?.to_owned();
            log::debug!("Endorser string '{text}'");
            ctx.run(&self.encode(&Operation::SendEndorser(text), ctx.options)?)?;
        }

        self.mode_select(ctx, ModePage::scan_wait(flag(ctx.options, SCAN_WAIT_MODE)))?;
        self.mode_select(ctx, ModePage::white_balance(flag(ctx.options, WHITE_BALANCE)))?;

        if window.custom_gamma {
            ctx.run(&self.encode(&Operation::SendGamma, ctx.options)?)?;
        }

        ctx.run(&self.encode(&Operation::SetWindow, ctx.options)?)?;

        let echo = ctx.run(&self.encode(&Operation::GetWindow, ctx.options)?)?;
        log::debug!(
            "Device holds {} bytes of window data, descriptors of {} bytes",
            get_be(&echo, 0, 2).unwrap_or(0),
            get_be(&echo, 6, 2).unwrap_or(0),
        );

        self.prepared = Some(Prepared {
            window,
            padding: flag(ctx.options, PADDING),
        });
        self.back_side = None;

        Ok(())
    }

    fn trigger(&mut self, ctx: &mut Context) -> Result<FramePlan> {
        let prepared = self.prepared.take().ok_or(SaneError::Inval)?;

        if prepared.window.feed != Feed::Flatbed {
            self.check_feeder(ctx)?;
        }

        ctx.run(&command::scan(prepared.window.window_ids())?)?;
        ctx.wait_ready(&self.wait_policy(), "Scan data", data_ready)?;

        if prepared.window.feed == Feed::Duplex {
            self.back_side = Some(prepared);
        }

        Ok(Self::plan(&prepared))
    }

    fn next_frame(&mut self, _ctx: &mut Context) -> Result<Option<FramePlan>> {
        Ok(self.back_side.take().map(|back| {
            log::debug!("Serve back side");
            Self::plan(&back)
        }))
    }

    fn end_frame(&mut self, _ctx: &mut Context, _side: Vec<u8>) -> Result<bool> {
        Ok(self.back_side.is_some())
    }

    fn finish(&mut self, ctx: &mut Context) -> Result<()> {
        self.unload_and_release(ctx)
    }

    fn abort(&mut self, ctx: &mut Context) -> Result<()> {
        self.unload_and_release(ctx)
    }
}

fn apply_mode(options: &mut OptionSet) {
    let mode = Mode::from_options(options).unwrap_or(Mode::Lineart);
    let gray = mode == Mode::Gray;

    options.activate(names::THRESHOLD, mode == Mode::Lineart);
    options.activate(HALFTONE_CODE, mode == Mode::Halftone);
    options.activate(HALFTONE_PATTERN, mode == Mode::Halftone);
    options.activate(BRIGHTNESS, gray);
    options.activate(CONTRAST, gray);
    options.activate(names::CUSTOM_GAMMA, gray);

    let custom = flag(options, names::CUSTOM_GAMMA);
    options.activate(names::GAMMA_VECTOR, gray && custom);
}

fn apply_source(options: &mut OptionSet, quirks: Quirks) {
    let feeder = options.is_active(names::SOURCE) && options.string_index(names::SOURCE) == Ok(1);

    options.activate(DUPLEX, feeder && quirks.contains(Quirks::Duplex));
    options.activate(PREFEED, feeder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;

    fn vpd_page() -> Vec<u8> {
        let mut raw = vec![0u8; 16];
        raw[..8].copy_from_slice(&[0x06, 0xc0, 0x00, 0x0c, 0x02, 0x01, 0x00, 0x37]);
        raw
    }

    fn jis_page() -> Vec<u8> {
        vec![
            0x06, 0xf0, 0x00, 0x00, 0x19, 0x01, 0x90, 0x01, 0x90, 0x11, 0x03, 0x20, 0x03, 0x20, 0x00, 0x64,
            0x00, 0x64, 0x3f, 0xff, 0x00, 0x00, 0x12, 0xb3, 0x00, 0x00, 0x1a, 0x93, 0x0e, 0x00,
        ]
    }

    fn inquiry() -> Inquiry {
        let mut raw = vec![0u8; 96];
        raw[0] = 0x06;
        raw[4] = 91;
        raw[8..16].copy_from_slice(b"RICOH   ");
        raw[16..32].copy_from_slice(b"IS450           ");
        raw[32..36].copy_from_slice(b"1R08");
        Inquiry::parse(&raw).unwrap()
    }

    fn profile() -> DeviceProfile {
        let mut mock = MockTransport::new();
        mock.reply(&[0x12, 0x01, VPD_PAGE], vpd_page());
        mock.reply(&[0x12, 0x01, JIS_PAGE], jis_page());

        let mut link = Link::new(Box::new(mock)).with_classifier(classify);
        link.open("mock").unwrap();

        let inquiry = inquiry();
        assert!(matches(&inquiry));
        probe(&mut link, &inquiry, "/dev/sg1").unwrap()
    }

    fn set(options: &mut OptionSet, hs2p: &Hs2p, name: &str, value: Value) {
        let index = options.find(name).unwrap();
        options.set(index, value, |options, index| hs2p.on_change(options, index)).unwrap();
    }

    fn sense(error_code: u8, key: u8, asc: u8, ascq: u8) -> SenseData {
        SenseData::parse(&MockTransport::sense_with(error_code, key, 0, asc, ascq))
    }

    #[test]
    fn test_probe_reads_vital_pages() {
        let profile = profile();

        assert_eq!(profile.ty, "flatbed/duplex ADF scanner");
        assert!(profile.has(Quirks::Adf | Quirks::Duplex | Quirks::Endorser));
        assert_eq!(
            profile.x_resolutions,
            Resolutions::Range {
                range: 100..=800,
                quant: 1
            }
        );
        assert_eq!(profile.x_range, 0..=303);
        assert_eq!(profile.y_range, 0..=431);
    }

    #[test]
    fn test_jis_standard_resolutions() {
        let jis = JisInfo::parse(&jis_page());

        assert_eq!(jis.basic, (400, 400));
        assert_eq!(jis.standard, vec![100, 120, 150, 160, 180, 200, 240, 300, 320, 400, 480, 600, 800, 1200]);
    }

    #[test]
    fn test_additional_sense_overrides_key() {
        let mut status = DeviceStatus::empty();

        assert_eq!(classify(&sense(0x70, 0x00, 0x00, 0x02), &mut status), Outcome::NoMedium);
        assert_eq!(status, DeviceStatus::NoDocs);
        assert_eq!(classify(&sense(0x70, 0x03, 0x89, 0x00), &mut status), Outcome::CoverOpen);
        assert_eq!(classify(&sense(0x70, 0x03, 0x89, 0x02), &mut status), Outcome::Jammed);
        assert_eq!(classify(&sense(0x70, 0x06, 0x29, 0x00), &mut status), Outcome::Ready);
        assert_eq!(classify(&sense(0x70, 0x05, 0x25, 0x00), &mut status), Outcome::Unsupported);
        assert_eq!(classify(&sense(0x70, 0x0b, 0x8b, 0x00), &mut status), Outcome::OutOfMemory);
        assert_eq!(classify(&sense(0x70, 0x00, 0x99, 0x01), &mut status), Outcome::IoError);
        assert_eq!(status, DeviceStatus::Error);
    }

    #[test]
    fn test_deferred_sense_uses_key() {
        let mut status = DeviceStatus::empty();

        assert_eq!(classify(&sense(0x71, 0x03, 0x89, 0x00), &mut status), Outcome::Jammed);
        assert_eq!(classify(&sense(0x71, 0x02, 0x00, 0x00), &mut status), Outcome::Busy);
        assert_eq!(status, DeviceStatus::Busy);
        assert_eq!(classify(&sense(0x71, 0x0e, 0x00, 0x00), &mut status), Outcome::InvalidParameter);
        assert_eq!(classify(&sense(0x72, 0x00, 0x00, 0x00), &mut status), Outcome::IoError);
    }

    #[test]
    fn test_sense_description() {
        assert_eq!(describe(&sense(0x70, 0x04, 0x60, 0x00)), "Lamp failure");
        assert_eq!(describe(&sense(0x70, 0x04, 0x89, 0x02)), "Document jam error for ADF");
    }

    #[test]
    fn test_duplex_window_list() {
        let profile = profile();
        let hs2p = Hs2p::new(&profile);
        let mut options = hs2p.options(&profile);
        set(&mut options, &hs2p, names::SOURCE, Value::String("ADF".into()));
        set(&mut options, &hs2p, DUPLEX, Value::Bool(true));
        set(&mut options, &hs2p, names::BR_X, Value::Fixed(crate::options::fix(210.0)));
        set(&mut options, &hs2p, names::BR_Y, Value::Fixed(crate::options::fix(297.0)));

        let command = hs2p.encode(&Operation::SetWindow, &options).unwrap();
        let list = command.data_out.unwrap();

        assert_eq!(command.cdb, vec![0x24, 0, 0, 0, 0, 0, 0x00, 0x02, 0x88, 0]);
        assert_eq!(list.len(), 648);
        assert_eq!(&list[6..8], &[0x02, 0x80]);

        let front = &list[8..8 + WINDOW_LEN];
        let back = &list[8 + WINDOW_LEN..];
        assert_eq!(front[0], 0);
        assert_eq!(back[0], 1);
        assert_eq!(&front[2..6], &[0x01, 0x90, 0x01, 0x90]);
        // (303 - 210) / 2 = 46 mm centring offset.
        assert_eq!(&front[6..10], &[0, 0, 0, 46]);
        assert_eq!(&front[14..22], &[0, 0, 0, 210, 0, 0, 0x01, 0x29]);
        assert_eq!(front[25], 0x00);
        assert_eq!(front[26], 1);
        assert_eq!(front[29], 0x03);
        assert_eq!(front[2..], back[2..]);

        let scan = hs2p.encode(&Operation::TriggerScan, &options).unwrap();
        assert_eq!(scan.cdb, vec![0x1b, 0, 0, 0, 2, 0]);
        assert_eq!(scan.data_out, Some(vec![0, 1]));
    }

    #[test]
    fn test_simplex_second_descriptor_empty() {
        let profile = profile();
        let hs2p = Hs2p::new(&profile);
        let options = hs2p.options(&profile);

        let list = hs2p.window(&options).unwrap().window_list().unwrap();

        assert!(list[8 + WINDOW_LEN..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_window_too_wide_rejected() {
        let profile = profile();
        let hs2p = Hs2p::new(&profile);
        let mut options = hs2p.options(&profile);
        set(&mut options, &hs2p, names::RESOLUTION, Value::Int(800));

        let window = hs2p.window(&options).unwrap();

        assert_eq!(window.check(&hs2p.x_res, &hs2p.y_res, hs2p.x_mm, hs2p.y_mm), Err(SaneError::Inval));
    }

    #[test]
    fn test_estimate_lineart_chops_to_bytes() {
        let profile = profile();
        let hs2p = Hs2p::new(&profile);
        let mut options = hs2p.options(&profile);
        set(&mut options, &hs2p, STD_RESOLUTION, Value::Int(300));
        set(&mut options, &hs2p, names::BR_X, Value::Fixed(crate::options::fix(10.0)));
        set(&mut options, &hs2p, names::BR_Y, Value::Fixed(crate::options::fix(20.0)));

        let params = hs2p.estimate(&profile, &options).unwrap();

        // 10 mm at 300 dpi is 118 pixels.
        assert_eq!(params.bytes_per_line, 14);
        assert_eq!(params.pixels_per_line, 112);
        assert_eq!(params.lines, 236);
        assert_eq!(params.depth, 1);
    }

    #[test]
    fn test_mode_and_source_toggle_options() {
        let profile = profile();
        let hs2p = Hs2p::new(&profile);
        let mut options = hs2p.options(&profile);

        assert!(options.is_active(names::THRESHOLD));
        assert!(!options.is_active(DUPLEX));
        assert!(!options.is_active(names::CUSTOM_GAMMA));

        set(&mut options, &hs2p, names::MODE, Value::String("Gray".into()));
        assert!(!options.is_active(names::THRESHOLD));
        assert!(options.is_active(BRIGHTNESS));
        assert!(options.is_active(names::CUSTOM_GAMMA));

        set(&mut options, &hs2p, names::SOURCE, Value::String("ADF".into()));
        assert!(options.is_active(DUPLEX));
        assert!(options.is_active(PREFEED));

        set(&mut options, &hs2p, ENDORSER, Value::Bool(true));
        assert!(options.is_active(ENDORSER_STRING));
    }

    #[test]
    fn test_endorser_data() {
        assert_eq!(endorser_data(b"No. 12/3").unwrap(), b"No. 12/3           ".to_vec());
        assert_eq!(endorser_data(b"50%"), Err(SaneError::Inval));
        assert_eq!(endorser_data(&[b'A'; 20]), Err(SaneError::Inval));
    }

    #[test]
    fn test_end_of_medium_padded() {
        let mut mock = MockTransport::new();
        mock.push_check_with_data(
            &[0x28],
            MockTransport::sense_with(0xf0, 0x40 | 0x20, 3, 0x00, 0x02),
            vec![1, 2, 3, 4, 5],
        );
        let mut link = Link::new(Box::new(mock)).with_classifier(classify);
        link.open("mock").unwrap();

        let mut source = Hs2pSource {
            remaining: 16,
            line_len: 4,
            fill: Some(0xff),
            end_of_medium: false,
        };

        assert_eq!(
            source.next_block(&mut link, 8),
            Ok(Block::Data(vec![1, 2, 3, 4, 5, 0xff, 0xff, 0xff]))
        );
        assert_eq!(source.next_block(&mut link, 8), Ok(Block::Data(vec![0xff; 8])));
        assert_eq!(source.next_block(&mut link, 8), Ok(Block::End));
    }

    #[test]
    fn test_end_of_medium_truncated() {
        let mut mock = MockTransport::new();
        mock.push_check_with_data(
            &[0x28],
            MockTransport::sense_with(0xf0, 0x40 | 0x20, 6, 0x00, 0x02),
            vec![1, 2],
        );
        let mut link = Link::new(Box::new(mock)).with_classifier(classify);
        link.open("mock").unwrap();

        let mut source = Hs2pSource {
            remaining: 16,
            line_len: 4,
            fill: None,
            end_of_medium: false,
        };

        assert_eq!(source.next_block(&mut link, 8), Ok(Block::Data(vec![1, 2])));
        assert_eq!(source.next_block(&mut link, 8), Ok(Block::End));
    }

    #[test]
    fn test_feeder_status_bits() {
        let profile = profile();
        let hs2p = Hs2p::new(&profile);
        let mut options = hs2p.options(&profile);

        for (status, expected) in [
            (0x00, Ok(())),
            (0x01, Err(SaneError::NoDocs)),
            (0x02, Err(SaneError::CoverOpen)),
        ] {
            let mut mock = MockTransport::new();
            mock.reply(&[0x28, 0x00, dtc::ADF_STATUS], vec![status]);
            let mut link = Link::new(Box::new(mock)).with_classifier(classify);
            link.open("mock").unwrap();

            let mut sleeper = crate::wait::RecordingSleeper::default();
            let mut ctx = Context {
                link: &mut link,
                options: &mut options,
                profile: &profile,
                sleeper: &mut sleeper,
                retries: 0,
            };

            assert_eq!(hs2p.check_feeder(&mut ctx), expected);
        }
    }
}
