//! Relisys / Teco VM3552 flatbed scanners.
//!
//! Geometry is sent in 1/300 inch units. Lineart data arrives inverted with
//! the bits of every byte mirrored. Without the RAM extension the device
//! sends colour rasters one colour at a time, shifted against each other.

use super::{Context, Dialect, DialectKind, FramePlan};
use crate::{
    command::{self, device_type, Command, Operation, SENSE_LEN},
    device::{DeviceProfile, Inquiry, Quirks, Resolutions},
    encode::{get_be, CommandBlock},
    options::{names, Info, OptionDescriptor, OptionSet, Type, Unit, Value},
    parameters::{FrameFormat, Parameters},
    pipeline::{Stage, StaggerReorder},
    reader::{Block, BlockSource},
    result::{Result, SaneError},
    sense::{DeviceStatus, Outcome, SenseData, SenseRule, SenseTable},
    transport::Link,
    wait::RetryPolicy,
};
use bstr::BString;
use std::time::Duration;

pub const UNITS_PER_INCH: u32 = 300;
pub const GAMMA_LENGTH: usize = 1024;
pub const WINDOW_LEN: usize = 69;

const TECO_NAME: &[u8] = b"TECO VM3552";
const TECO_NAME_OFFSET: usize = 0x2a;
const MIN_INQUIRY_LEN: usize = 53;

const X_MM: f64 = 8.5 * 25.4;
const Y_MM: f64 = 14.0 * 25.4;

const PREVIEW_RESOLUTION: u16 = 50;
const BUFFER_STATUS_LEN: u16 = 0x12;
const CALIBRATION_LEN: usize = 0x7800;

pub const MODES: [&str; 3] = ["Black & White", "Grayscale", "Color"];

pub const DITHERS: [&str; 9] = [
    "Line art",
    "2x2",
    "3x3",
    "4x4 bayer",
    "4x4 smooth",
    "8x8 bayer",
    "8x8 smooth",
    "8x8 horizontal",
    "8x8 vertical",
];

const DITHER_VALUES: [u8; 9] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

const DITHER: &str = "dither";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Lineart,
    Gray,
    Color,
}

impl Mode {
    fn from_options(options: &OptionSet) -> Result<Self> {
        Ok(match options.string_index(names::MODE)? {
            0 => Mode::Lineart,
            1 => Mode::Gray,
            _ => Mode::Color,
        })
    }

    /// Image composition byte of the window.
    fn composition(self) -> u8 {
        match self {
            Mode::Lineart => 0x00,
            Mode::Gray => 0x02,
            Mode::Color => 0x05,
        }
    }
}

/// Window geometry in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub mode: Mode,
    pub x_resolution: u16,
    pub y_resolution: u16,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub length: u32,
    pub threshold: u8,
    pub dither: u8,
}

impl Window {
    fn from_options(options: &OptionSet, x_max_resolution: u16) -> Result<Self> {
        let mode = Mode::from_options(options)?;

        let (x_resolution, y_resolution, x_tl, y_tl, x_br, y_br) = if options.bool(names::PREVIEW)? {
            let (x_br, y_br) = (to_units(X_MM), to_units(Y_MM));
            (PREVIEW_RESOLUTION, PREVIEW_RESOLUTION, 0, 0, x_br, y_br)
        } else {
            let resolution = options.int(names::RESOLUTION)?.clamp(1, u16::MAX as i32) as u16;
            (
                resolution.min(x_max_resolution),
                resolution,
                to_units(options.fixed(names::TL_X)?),
                to_units(options.fixed(names::TL_Y)?),
                to_units(options.fixed(names::BR_X)?),
                to_units(options.fixed(names::BR_Y)?),
            )
        };

        let dither = DITHER_VALUES
            .get(options.string_index(DITHER)?)
            .copied()
            .unwrap_or(DITHER_VALUES[0]);

        Ok(Self {
            mode,
            x_resolution,
            y_resolution,
            x: x_tl.min(x_br),
            y: y_tl.min(y_br),
            width: x_tl.abs_diff(x_br),
            length: y_tl.abs_diff(y_br),
            threshold: options.int(names::THRESHOLD)?.clamp(0, 255) as u8,
            dither,
        })
    }

    fn pixels_per_line(&self) -> usize {
        self.width as usize * self.x_resolution as usize / UNITS_PER_INCH as usize
    }

    fn lines(&self) -> usize {
        self.length as usize * self.y_resolution as usize / UNITS_PER_INCH as usize
    }

    fn color_shift(&self) -> usize {
        self.x_resolution as usize / 75
    }

    pub fn parameters(&self) -> Parameters {
        let pixels = self.pixels_per_line();

        let (format, pixels_per_line, bytes_per_line, depth) = match self.mode {
            Mode::Lineart => {
                let pixels = pixels & !0x7;
                (FrameFormat::Gray, pixels, pixels / 8, 1)
            }
            Mode::Gray => (FrameFormat::Gray, pixels, pixels, 8),
            Mode::Color => (FrameFormat::RGB, pixels, pixels * 3, 8),
        };

        Parameters {
            format,
            last_frame: true,
            bytes_per_line,
            pixels_per_line,
            lines: self.lines(),
            depth,
        }
    }

    /// SET WINDOW parameter list.
    pub fn block(&self) -> Result<Vec<u8>> {
        let (threshold, dither) = match self.mode {
            Mode::Lineart => (self.threshold, self.dither),
            Mode::Gray | Mode::Color => (0x80, 0x00),
        };

        let block = CommandBlock::new(WINDOW_LEN)
            .byte(7, (WINDOW_LEN - 8) as u8)?
            .field(10, 2, self.x_resolution as u64)?
            .field(12, 2, self.y_resolution as u64)?
            .field(14, 4, self.x as u64)?
            .field(18, 4, self.y as u64)?
            .field(22, 4, self.width as u64)?
            .field(26, 4, self.length as u64)?
            .byte(31, threshold)?
            .byte(33, self.mode.composition())?
            // Depth is 8 in every mode, lineart included.
            .byte(34, 8)?
            .byte(36, dither)?
            .byte(37, 0x80)?
            .byte(48, 0x01)?
            .byte(50, 0x02)?
            .byte(53, 0xff)?
            .byte(57, 0xff)?
            .byte(61, 0xff)?
            .byte(65, 0xff)?;

        Ok(block.into_bytes())
    }
}

fn to_units(mm: f64) -> u32 {
    super::mm_to_units(mm, UNITS_PER_INCH)
}

/// Reply to GET DATA BUFFER STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatus {
    /// Bytes ready to be read.
    pub filled: usize,
    pub lines: usize,
    pub bytes_per_raster: usize,
    /// No RAM extension, colour rasters are shifted.
    pub color_shift: bool,
}

impl BufferStatus {
    pub fn parse(raw: &[u8]) -> Self {
        if raw.len() < 0x10 {
            log::warn!("Buffer status too short ({} bytes)", raw.len());
        }

        let at = |offset, width| get_be(raw, offset, width).unwrap_or(0) as usize;

        Self {
            filled: at(9, 3),
            lines: at(12, 2),
            bytes_per_raster: at(14, 2),
            color_shift: raw.get(17) == Some(&0x07),
        }
    }
}

pub fn matches(inquiry: &Inquiry) -> bool {
    inquiry.device_type == device_type::SCANNER && inquiry.field(TECO_NAME_OFFSET, TECO_NAME.len()) == TECO_NAME
}

pub fn probe(_link: &mut Link, inquiry: &Inquiry, name: &str) -> Result<DeviceProfile> {
    let len = inquiry.raw.get(4).map_or(0, |len| *len as usize + 5);
    if len < MIN_INQUIRY_LEN {
        log::warn!("Not enough inquiry data to identify '{name}' ({len} bytes)");
        return Err(SaneError::Inval);
    }

    Ok(DeviceProfile {
        name: name.to_owned(),
        vendor: BString::from("Relisys"),
        model: BString::from("Scorpio"),
        revision: inquiry.revision.clone(),
        ty: "flatbed scanner",
        dialect: DialectKind::Teco,
        variant: 0,
        x_resolutions: Resolutions::Range {
            range: 1..=300,
            quant: 1,
        },
        y_resolutions: Resolutions::Range {
            range: 1..=1200,
            quant: 1,
        },
        x_range: 0..=to_units(X_MM),
        y_range: 0..=to_units(Y_MM),
        x_mm: X_MM,
        y_mm: Y_MM,
        max_depth: 8,
        frames: 1,
        focus: None,
        quirks: Quirks::ColorShift,
    })
}

/// The device never sets ASC/ASCQ, only the key matters.
pub fn classify(sense: &SenseData, status: &mut DeviceStatus) -> Outcome {
    const TABLE: SenseTable = SenseTable(&[
        SenseRule::key(0x00, Outcome::Ready, "no sense"),
        SenseRule::key(0x02, Outcome::Busy, "not ready"),
        SenseRule::catch_all(Outcome::IoError, "error"),
    ]);

    if sense.error_code != 0x70 {
        log::warn!("Invalid sense error code 0x{:02x}", sense.error_code);
        status.insert(DeviceStatus::Error);
        return Outcome::IoError;
    }

    if sense.announced_len() < SenseData::MIN_LEN || sense.is_truncated() {
        log::warn!("Sense too short, no ASC/ASCQ");
        status.insert(DeviceStatus::Error);
        return Outcome::IoError;
    }

    let outcome = TABLE.classify(sense);
    status.set(DeviceStatus::Busy, outcome == Outcome::Busy);
    status.set(DeviceStatus::Error, outcome == Outcome::IoError);

    outcome
}

fn gamma_table(options: &OptionSet, mode: Mode) -> Result<Vec<u8>> {
    let default: Vec<u8> = (0..GAMMA_LENGTH).map(|i| (i / 4) as u8).collect();
    let zero = vec![0u8; GAMMA_LENGTH];
    let bytes = |words: &[i32]| words.iter().map(|word| (*word).clamp(0, 255) as u8).collect::<Vec<u8>>();

    let custom = options.is_active(names::CUSTOM_GAMMA) && options.bool(names::CUSTOM_GAMMA)?;

    let (red, green, blue) = match (custom, mode) {
        (true, Mode::Gray) => (zero.clone(), bytes(options.vector(names::GAMMA_VECTOR)?), zero.clone()),
        (true, _) => (
            bytes(options.vector(names::GAMMA_VECTOR_R)?),
            bytes(options.vector(names::GAMMA_VECTOR_G)?),
            bytes(options.vector(names::GAMMA_VECTOR_B)?),
        ),
        (false, _) => (default.clone(), default.clone(), default),
    };

    Ok([red, green, blue, zero].concat())
}

/// Raw image data read whenever the device buffer holds some.
#[derive(Debug)]
struct TecoSource {
    remaining: usize,
    raster_len: usize,
}

impl BlockSource for TecoSource {
    fn line_len(&self) -> usize {
        self.raster_len
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn next_block(&mut self, link: &mut Link, max: usize) -> Result<Block> {
        if self.remaining == 0 {
            return Ok(Block::End);
        }

        let status = BufferStatus::parse(&link.run(&command::get_data_buffer_status(
            true,
            BUFFER_STATUS_LEN,
        )?)?);

        let mut size = status.filled.min(self.remaining).min(max);
        if self.raster_len > 0 {
            size -= size % self.raster_len;
        }
        if size == 0 {
            return Ok(Block::Busy);
        }

        log::trace!("Read {size} of {} bytes left", self.remaining);

        let data = link.run(&command::read_10(0, 0, size)?)?;
        if data.is_empty() {
            return Ok(Block::Busy);
        }

        self.remaining = self.remaining.saturating_sub(data.len());
        Ok(Block::Data(data))
    }

    fn busy_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(600, Duration::from_millis(100))
    }
}

#[derive(Debug)]
pub struct Teco {
    x_max_resolution: u16,
    prepared: Option<(Window, BufferStatus)>,
}

impl Teco {
    pub fn new(profile: &DeviceProfile) -> Self {
        Self {
            x_max_resolution: profile.x_resolutions.max().clamp(1, u16::MAX as i32) as u16,
            prepared: None,
        }
    }

    fn window(&self, options: &OptionSet) -> Result<Window> {
        Window::from_options(options, self.x_max_resolution)
    }

    /// Parameters reported by the device, falling back to the window when
    /// the status carries no geometry.
    fn device_parameters(window: &Window, status: &BufferStatus) -> Parameters {
        let mut params = window.parameters();

        if status.lines == 0 || status.bytes_per_raster == 0 {
            log::debug!("Device reported no geometry, keep {params:?}");
            return params;
        }

        params.lines = status.lines;
        match window.mode {
            Mode::Lineart => {
                params.bytes_per_line = status.bytes_per_raster;
                params.pixels_per_line = status.bytes_per_raster * 8;
            }
            Mode::Gray => {
                params.pixels_per_line = status.bytes_per_raster;
                params.bytes_per_line = status.bytes_per_raster;
            }
            Mode::Color => {
                params.pixels_per_line = status.bytes_per_raster;
                params.bytes_per_line = status.bytes_per_raster * 3;
            }
        }

        params
    }
}

impl Dialect for Teco {
    fn kind(&self) -> DialectKind {
        DialectKind::Teco
    }

    fn wait_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(60, Duration::from_secs(1))
    }

    fn encode(&self, op: &Operation, options: &OptionSet) -> Result<Command> {
        match op {
            Operation::SetWindow => command::set_window(self.window(options)?.block()?),
            Operation::BufferStatus => command::get_data_buffer_status(true, BUFFER_STATUS_LEN),
            Operation::TriggerScan => command::scan(&[]),
            Operation::SendGamma => {
                let mode = Mode::from_options(options)?;
                command::send_10(0x03, 0x02, gamma_table(options, mode)?)
            }
            Operation::Calibrate => {
                let cdb = CommandBlock::new(6).byte(0, 0x09)?.field(3, 2, CALIBRATION_LEN as u64)?;
                Ok(Command::new(cdb).reading(CALIBRATION_LEN))
            }
            Operation::Execute => Ok(Command::new(CommandBlock::new(6).byte(0, 0x0e)?)),
            Operation::Abort => command::object_position(false),
            op => command::encode_standard(op),
        }
    }

    fn options(&self, profile: &DeviceProfile) -> OptionSet {
        let resolution = match &profile.y_resolutions {
            Resolutions::Range { range, quant } => OptionDescriptor::new(
                names::RESOLUTION,
                "Scan resolution",
                "Sets the resolution of the scanned image.",
                Type::Int,
            )
            .range(range.clone(), *quant),
            Resolutions::List(list) => OptionDescriptor::new(
                names::RESOLUTION,
                "Scan resolution",
                "Sets the resolution of the scanned image.",
                Type::Int,
            )
            .word_list(list.clone()),
        }
        .unit(Unit::Dpi);

        let x_max = crate::options::fix(profile.x_mm);
        let y_max = crate::options::fix(profile.y_mm);
        let geometry = |name, title, max| {
            OptionDescriptor::new(name, title, "", Type::Fixed)
                .unit(Unit::Mm)
                .range(0..=max, 0)
        };
        let gamma = |name, title| {
            OptionDescriptor::new(name, title, "", Type::Vector)
                .vector(GAMMA_LENGTH)
                .range(0..=255, 0)
                .inactive()
        };
        let identity: Vec<i32> = (0..GAMMA_LENGTH as i32).map(|i| i / 4).collect();

        let mut options = OptionSet::new()
            .group("Scan Mode")
            .option(
                OptionDescriptor::new(names::MODE, "Scan mode", "Selects the scan mode.", Type::String)
                    .string_list(&MODES),
                Value::String(MODES[0].into()),
            )
            .option(resolution, Value::Int(100))
            .group("Geometry")
            .option(geometry(names::TL_X, "Top-left x", 0), Value::Fixed(0))
            .option(geometry(names::TL_Y, "Top-left y", 0), Value::Fixed(0))
            .option(geometry(names::BR_X, "Bottom-right x", x_max), Value::Fixed(x_max))
            .option(geometry(names::BR_Y, "Bottom-right y", y_max), Value::Fixed(y_max))
            .group("Enhancement")
            .option(
                OptionDescriptor::new(DITHER, "Dither", "Dither", Type::String)
                    .string_list(&DITHERS)
                    .inactive(),
                Value::String(DITHERS[0].into()),
            )
            .option(
                OptionDescriptor::new(
                    names::CUSTOM_GAMMA,
                    "Use custom gamma table",
                    "Determines whether a builtin or a custom gamma-table should be used.",
                    Type::Bool,
                )
                .inactive(),
                Value::Bool(false),
            )
            .option(gamma(names::GAMMA_VECTOR_R, "Red intensity"), Value::Vector(identity.clone()))
            .option(gamma(names::GAMMA_VECTOR_G, "Green intensity"), Value::Vector(identity.clone()))
            .option(gamma(names::GAMMA_VECTOR_B, "Blue intensity"), Value::Vector(identity.clone()))
            .option(gamma(names::GAMMA_VECTOR, "Image intensity"), Value::Vector(identity))
            .option(
                OptionDescriptor::new(
                    names::THRESHOLD,
                    "Threshold",
                    "Select minimum-brightness to get a white point",
                    Type::Int,
                )
                .range(0..=255, 0)
                .inactive(),
                Value::Int(128),
            )
            .option(
                OptionDescriptor::new(
                    names::PREVIEW,
                    "Preview",
                    "Request a preview-quality scan.",
                    Type::Bool,
                ),
                Value::Bool(false),
            );

        apply_mode(&mut options);
        options
    }

    fn on_change(&self, options: &mut OptionSet, index: usize) -> Info {
        match options.name_of(index) {
            Some(names::MODE) => {
                apply_mode(options);
                Info::ReloadOptions | Info::ReloadParams
            }
            Some(names::CUSTOM_GAMMA) => {
                apply_gamma(options);
                Info::ReloadOptions
            }
            Some(
                names::TL_X | names::TL_Y | names::BR_X | names::BR_Y | names::THRESHOLD
                | names::RESOLUTION,
            ) => Info::ReloadParams,
            _ => Info::empty(),
        }
    }

    fn estimate(&self, _profile: &DeviceProfile, options: &OptionSet) -> Result<Parameters> {
        Ok(self.window(options)?.parameters())
    }

    fn configure(&mut self, ctx: &mut Context) -> Result<()> {
        let window = self.window(ctx.options)?;
        log::debug!("Use window {window:?}");

        ctx.wait_unit_ready(&self.wait_policy())?;

        let sense = ctx.link.exchange(&command::request_sense(SENSE_LEN as u8)?)?;
        log::trace!("Pending sense {:02x?}", sense.data);

        // Park the CCD, the device may still hold an old window.
        ctx.link.exchange(&self.encode(&Operation::Abort, ctx.options)?)?;

        ctx.run(&self.encode(&Operation::SetWindow, ctx.options)?)?;

        let status = BufferStatus::parse(&ctx.run(&self.encode(&Operation::BufferStatus, ctx.options)?)?);
        log::debug!("Buffer status {status:?}");

        for op in [Operation::Calibrate, Operation::Execute] {
            let reply = ctx.link.exchange(&self.encode(&op, ctx.options)?)?;
            if reply.outcome != Outcome::Ready {
                log::warn!("Vendor command {op:?} failed with {}, ignore", reply.outcome);
            }
        }

        ctx.run(&self.encode(&Operation::SendGamma, ctx.options)?)?;
        ctx.run(&self.encode(&Operation::SetWindow, ctx.options)?)?;

        self.prepared = Some((window, status));
        Ok(())
    }

    fn trigger(&mut self, ctx: &mut Context) -> Result<FramePlan> {
        let (window, status) = self.prepared.take().ok_or(SaneError::Inval)?;

        ctx.run(&self.encode(&Operation::TriggerScan, ctx.options)?)?;

        let params = Self::device_parameters(&window, &status);
        let shift = window.mode == Mode::Color && status.color_shift;

        let stage = match window.mode {
            Mode::Lineart => Stage::Lineart {
                line_len: params.bytes_per_line,
                invert: true,
                reverse_bits: true,
            },
            Mode::Color if shift => {
                let shift = window.color_shift();
                log::debug!("No RAM extension, reorder rasters shifted by {shift} lines");
                Stage::Stagger(StaggerReorder::new(params.pixels_per_line, shift, params.lines))
            }
            Mode::Gray | Mode::Color => Stage::Copy {
                line_len: params.bytes_per_line,
            },
        };

        let raster_len = match (status.bytes_per_raster, shift) {
            (0, true) => params.pixels_per_line,
            (0, false) => params.bytes_per_line,
            (len, _) => len,
        };

        Ok(FramePlan {
            params,
            stage,
            source: Box::new(TecoSource {
                remaining: params.frame_size(),
                raster_len,
            }),
        })
    }

    fn finish(&mut self, ctx: &mut Context) -> Result<()> {
        ctx.run(&self.encode(&Operation::Abort, ctx.options)?).map(drop)
    }

    fn abort(&mut self, ctx: &mut Context) -> Result<()> {
        self.prepared = None;
        ctx.run(&self.encode(&Operation::Abort, ctx.options)?).map(drop)
    }
}

/// Lineart options are only meaningful in lineart, gamma only otherwise.
fn apply_mode(options: &mut OptionSet) {
    let lineart = options.string_index(names::MODE) == Ok(0);

    options.activate(DITHER, lineart);
    options.activate(names::THRESHOLD, lineart);
    options.activate(names::CUSTOM_GAMMA, !lineart);
    apply_gamma(options);
}

fn apply_gamma(options: &mut OptionSet) {
    let mode = options.string_index(names::MODE).unwrap_or(0);
    let custom = options.is_active(names::CUSTOM_GAMMA) && options.bool(names::CUSTOM_GAMMA) == Ok(true);

    options.activate(names::GAMMA_VECTOR, custom && mode == 1);
    for name in [names::GAMMA_VECTOR_R, names::GAMMA_VECTOR_G, names::GAMMA_VECTOR_B] {
        options.activate(name, custom && mode == 2);
    }
}
