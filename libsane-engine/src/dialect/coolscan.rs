//! Nikon Coolscan film scanners (LS-30 up to LS-8000).
//!
//! Geometry is expressed in pixels of the maximum resolution. Every colour
//! gets its own window and LUT, the device sends planar lines which the
//! pipeline averages and interleaves. The infrared channel is captured with
//! the colour scan and served from memory as a second grey image.

use super::{Context, Dialect, DialectKind, FramePlan};
use crate::{
    command::{self, opcode, Command, Operation},
    device::{DeviceProfile, Inquiry, Quirks, Resolutions},
    encode::{get_be, CommandBlock},
    options::{fix, names, Info, OptionDescriptor, OptionSet, Type, Unit, Value},
    parameters::{FrameFormat, Parameters},
    pipeline::{PlanarLayout, Stage},
    reader::{Block, BlockSource, MemorySource},
    result::{from_outcome, Result, SaneError},
    sense::{DeviceStatus, Match, Outcome, SenseData, SenseRule, SenseTable},
    transport::Link,
    wait::{Probe, RetryPolicy},
};
use std::time::Duration;

const VENDOR: &[u8] = b"Nikon";
const DEVICE_PAGE: u8 = 0xc1;
const WINDOW_HEADER_LEN: usize = 8;
const WINDOW_LEN: usize = 50;
const VENDOR_DATA_LEN: usize = 13;
const EXPOSURE_LEN: usize = 58;

/// Colour codes of windows and LUTs: red, green, blue, infrared.
pub const COLOURS: [u8; 4] = [1, 2, 3, 9];

/// Vendor opcodes.
mod vendor {
    pub const SET: u8 = 0xe0;
    pub const GET: u8 = 0xe1;
    pub const EXECUTE: u8 = 0xc1;
    pub const ABORT: u8 = 0xc0;

    pub const LOAD: u8 = 0xd1;
    pub const EJECT: u8 = 0xd0;
    pub const RESET: u8 = 0x80;
    pub const FOCUS: u8 = 0xc1;
    pub const AUTOFOCUS: u8 = 0xa0;
}

mod dtc {
    pub const IMAGE: u8 = 0x00;
    pub const LUT: u8 = 0x03;
    pub const PADDING: u8 = 0x87;
    pub const BOUNDARY: u8 = 0x88;
}

pub const INFRARED: &str = "infrared";
pub const NEGATIVE: &str = "negative";
pub const SAMPLES_PER_SCAN: &str = "samples-per-scan";
pub const EXPOSURE: &str = "exposure";
pub const EXPOSURE_R: &str = "red-exposure";
pub const EXPOSURE_G: &str = "green-exposure";
pub const EXPOSURE_B: &str = "blue-exposure";
pub const AUTO_EXPOSURE: &str = "ae";
pub const AUTO_EXPOSURE_WB: &str = "ae-wb";
pub const LUT_R: &str = "red-gamma-table";
pub const LUT_G: &str = "green-gamma-table";
pub const LUT_B: &str = "blue-gamma-table";
pub const INDEPENDENT_RES: &str = "independent-res";
pub const PREVIEW_RESOLUTION: &str = "preview-resolution";
pub const FRAME: &str = "frame";
pub const SUBFRAME: &str = "subframe";
pub const LOAD: &str = "load";
pub const EJECT: &str = "eject";
pub const RESET: &str = "reset";
pub const FOCUS_ON_CENTRE: &str = "focus-on-centre";
pub const FOCUS: &str = "focus";
pub const AUTOFOCUS: &str = "autofocus";
pub const FOCUS_X: &str = "focusx";
pub const FOCUS_Y: &str = "focusy";

const EXPOSURES: [&str; 3] = [EXPOSURE_R, EXPOSURE_G, EXPOSURE_B];
const LUTS: [&str; 3] = [LUT_R, LUT_G, LUT_B];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Model {
    #[strum(serialize = "LS-30")]
    Ls30,
    #[strum(serialize = "LS-40")]
    Ls40,
    #[strum(serialize = "LS-50")]
    Ls50,
    #[strum(serialize = "LS-2000")]
    Ls2000,
    #[strum(serialize = "LS-4000")]
    Ls4000,
    #[strum(serialize = "LS-5000")]
    Ls5000,
    #[strum(serialize = "LS-8000")]
    Ls8000,
}

const MODELS: [(&str, Model); 7] = [
    ("COOLSCANIII", Model::Ls30),
    ("LS-40 ED", Model::Ls40),
    ("LS-50 ED", Model::Ls50),
    ("LS-2000", Model::Ls2000),
    ("LS-4000 ED", Model::Ls4000),
    ("LS-5000 ED", Model::Ls5000),
    ("LS-8000 ED", Model::Ls8000),
];

impl Model {
    fn identify(inquiry: &Inquiry) -> Option<(usize, Model)> {
        MODELS
            .iter()
            .position(|(product, _)| inquiry.product == product.as_bytes())
            .map(|index| (index, MODELS[index].1))
    }

    fn has_block_padding(self) -> bool {
        matches!(self, Model::Ls50 | Model::Ls5000)
    }

    fn has_odd_padding(self) -> bool {
        !matches!(self, Model::Ls30 | Model::Ls2000)
    }

    fn has_multi_sample(self) -> bool {
        matches!(self, Model::Ls2000 | Model::Ls4000 | Model::Ls5000 | Model::Ls8000)
    }

    /// Control byte of SET WINDOW.
    fn window_control(self) -> u8 {
        match self {
            Model::Ls40 | Model::Ls4000 => 0x80,
            _ => 0x00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Normal = 0x01,
    AutoExposure = 0x20,
    AutoExposureWhiteBalance = 0x40,
}

/// Page 0xC1 of the vital product data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub max_bits: usize,
    pub x_res: (u32, u32),
    pub y_res: (u32, u32),
    /// Scan area in pixels of the maximum resolution.
    pub boundary: (u32, u32),
    pub frames: usize,
    pub focus: (u32, u32),
}

impl DeviceInfo {
    pub fn parse(raw: &[u8], model: Model) -> Self {
        let at = |offset, width| get_be(raw, offset, width).unwrap_or(0) as u32;

        let max_bits = match model {
            // Claims 12 bits but delivers 10.
            Model::Ls30 => 10,
            _ => at(82, 1) as usize,
        };

        Self {
            max_bits,
            x_res: (at(22, 2), at(20, 2)),
            y_res: (at(44, 2), at(42, 2)),
            boundary: (at(36, 4), at(58, 4)),
            frames: at(75, 1) as usize,
            focus: (at(76, 2), at(78, 2)),
        }
    }

    /// Maximum resolution divided by every integer pitch down to the minimum.
    fn resolutions((min, max): (u32, u32)) -> Vec<i32> {
        let pitches = max / min.max(1);
        (1..=pitches.max(1)).map(|pitch| (max / pitch) as i32).collect()
    }
}

pub fn matches(inquiry: &Inquiry) -> bool {
    inquiry.vendor == VENDOR && Model::identify(inquiry).is_some()
}

pub fn probe(link: &mut Link, inquiry: &Inquiry, name: &str) -> Result<DeviceProfile> {
    let (variant, model) = Model::identify(inquiry).ok_or(SaneError::Unsupported)?;

    let header = link.run(&command::page_inquiry(DEVICE_PAGE, 4)?)?;
    let len = header.get(3).copied().unwrap_or(0).saturating_add(4);
    let info = DeviceInfo::parse(&link.run(&command::page_inquiry(DEVICE_PAGE, len)?)?, model);
    log::debug!("{model} reports {info:?}");

    if info.x_res.1 == 0 || info.y_res.1 == 0 || info.boundary.0 == 0 || info.boundary.1 == 0 {
        log::warn!("{model} reported an empty scan area");
        return Err(SaneError::IO);
    }

    let mut quirks = Quirks::Infrared;
    if model.has_block_padding() {
        quirks |= Quirks::BlockPadding;
    }
    if model.has_odd_padding() {
        quirks |= Quirks::OddPadding;
    }
    if model.has_multi_sample() {
        quirks |= Quirks::MultiSample;
    }
    if info.frames > 1 {
        quirks |= Quirks::FilmLoader;
    }

    let unit_dpi = info.x_res.1 as f64;

    Ok(DeviceProfile {
        name: name.to_owned(),
        vendor: inquiry.vendor.clone(),
        model: inquiry.product.clone(),
        revision: inquiry.revision.clone(),
        ty: "film scanner",
        dialect: DialectKind::Coolscan,
        variant,
        x_resolutions: Resolutions::List(DeviceInfo::resolutions(info.x_res)),
        y_resolutions: Resolutions::List(DeviceInfo::resolutions(info.y_res)),
        x_range: 0..=info.boundary.0 - 1,
        y_range: 0..=info.boundary.1 - 1,
        x_mm: info.boundary.0 as f64 * 25.4 / unit_dpi,
        y_mm: info.boundary.1 as f64 * 25.4 / info.y_res.1 as f64,
        max_depth: info.max_bits.max(8),
        frames: info.frames.max(1),
        focus: Some(info.focus.0..=info.focus.1),
        quirks,
    })
}

const REISSUE: SenseRule = SenseRule {
    key: Match::Exactly(0x09),
    asc: Match::Exactly(0x80),
    ascq: Match::Exactly(0x06),
    outcome: Outcome::Ready,
    text: "scan must be reissued",
};

const SENSE: SenseTable = SenseTable(&[
    SenseRule::key(0x00, Outcome::Ready, "no sense"),
    SenseRule::key_asc(0x02, 0x04, Outcome::Busy, "processing"),
    SenseRule::key_asc(0x02, 0x3a, Outcome::NoMedium, "no film loaded"),
    REISSUE,
    SenseRule::catch_all(Outcome::IoError, "error"),
]);

pub fn classify(sense: &SenseData, status: &mut DeviceStatus) -> Outcome {
    // The reissue code carries a qualifier of 0 or 1 in the information byte.
    let qualifier = sense.information >> 24;
    let outcome = if REISSUE.matches(sense) && qualifier > 1 {
        log::warn!("Unknown reissue qualifier {qualifier} ({sense})");
        Outcome::IoError
    } else {
        SENSE.classify(sense)
    };

    status.set(DeviceStatus::Busy, outcome == Outcome::Busy);
    status.set(DeviceStatus::Processing, outcome == Outcome::Busy);
    status.set(DeviceStatus::NoDocs, outcome == Outcome::NoMedium);
    status.set(DeviceStatus::Error, outcome == Outcome::IoError);
    status.set(DeviceStatus::Reissue, REISSUE.matches(sense) && outcome == Outcome::Ready);

    outcome
}

/// Wait out processing; an empty holder is fine for media commands.
fn settled(link: &mut Link) -> Result<Probe<()>> {
    let reply = link.exchange(&command::test_unit_ready())?;

    match reply.outcome {
        Outcome::Busy => Ok(Probe::Busy),
        Outcome::Ready | Outcome::NoMedium => Ok(Probe::Ready(())),
        outcome => from_outcome(outcome).map(Probe::Ready),
    }
}

/// Scan geometry converted to device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub depth: usize,
    pub bytes_per_sample: usize,
    pub shift_bits: u32,
    pub x_resolution: u32,
    pub y_resolution: u32,
    pub x: u32,
    pub y: u32,
    /// Window size in pixels of the maximum resolution.
    pub width: u32,
    pub height: u32,
    /// Image size in output pixels.
    pub pixels: usize,
    pub lines: usize,
    pub odd_padding: usize,
    pub samples: usize,
    pub infrared: bool,
    pub negative: bool,
    /// Offset of the window within its frame.
    pub subframe: u32,
    pub focus_point: (u32, u32),
    /// Exposure times in units of 10 ns.
    pub exposure: [u32; 3],
}

fn flag(options: &OptionSet, name: &str) -> bool {
    options.is_active(name) && options.bool(name) == Ok(true)
}

fn int(options: &OptionSet, name: &str) -> Result<u32> {
    Ok(options.int(name)?.max(0) as u32)
}

impl Geometry {
    fn colours(&self) -> &'static [u8] {
        if self.infrared {
            &COLOURS
        } else {
            &COLOURS[..3]
        }
    }

    pub fn parameters(&self) -> Parameters {
        Parameters {
            format: FrameFormat::RGB,
            last_frame: true,
            bytes_per_line: 3 * self.pixels * self.bytes_per_sample,
            pixels_per_line: self.pixels,
            lines: self.lines,
            depth: 8 * self.bytes_per_sample,
        }
    }

    pub fn infrared_parameters(&self) -> Parameters {
        Parameters {
            format: FrameFormat::Gray,
            bytes_per_line: self.pixels * self.bytes_per_sample,
            ..self.parameters()
        }
    }

    pub fn layout(&self, block_padding: usize) -> PlanarLayout {
        PlanarLayout {
            width: self.pixels,
            channels: 3,
            infrared: self.infrared,
            samples: self.samples,
            bytes_per_sample: self.bytes_per_sample,
            shift_bits: self.shift_bits,
            odd_padding: self.odd_padding,
            block_padding,
        }
    }

    /// SET WINDOW parameter list for one colour.
    pub fn window(&self, colour: u8, kind: ScanKind, model: Model) -> Result<Vec<u8>> {
        let exposure = match COLOURS.iter().position(|c| *c == colour) {
            Some(index @ 0..=2) => self.exposure[index],
            // Infrared exposure is automatic.
            _ => 0,
        };

        let averaging = match model {
            Model::Ls50 | Model::Ls5000 => 0x00,
            _ => 0x80,
        };
        let multi = if self.samples > 1 { 0x10 } else { 0x02 };

        let w = WINDOW_HEADER_LEN;
        let block = CommandBlock::new(WINDOW_HEADER_LEN + WINDOW_LEN)
            .field(6, 2, WINDOW_LEN as u64)?
            .byte(w, colour)?
            .field(w + 2, 2, self.x_resolution as u64)?
            .field(w + 4, 2, self.y_resolution as u64)?
            .field(w + 6, 4, self.x as u64)?
            .field(w + 10, 4, self.y as u64)?
            .field(w + 14, 4, self.width as u64)?
            .field(w + 18, 4, self.height as u64)?
            .byte(w + 25, 0x05)?
            .byte(w + 26, self.depth as u8)?
            .byte(w + 40, ((self.samples.clamp(1, 16) - 1) << 4) as u8)?
            .byte(w + 41, averaging | !self.negative as u8)?
            .byte(w + 42, kind as u8)?
            .byte(w + 43, multi)?
            .byte(w + 44, 0x02)?
            .byte(w + 45, 0xff)?
            .field(w + 46, 4, exposure as u64)?;

        Ok(block.into_bytes())
    }
}

/// Planar raw lines read with READ(10).
#[derive(Debug)]
struct CoolscanSource {
    remaining: usize,
    line_len: usize,
}

impl BlockSource for CoolscanSource {
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
        let reply = link.exchange(&command::read_10(dtc::IMAGE, 0, len)?)?;

        match reply.outcome {
            Outcome::Ready => {}
            Outcome::Busy => return Ok(Block::Busy),
            outcome => from_outcome(outcome)?,
        }

        if reply.data.is_empty() {
            return Ok(Block::Busy);
        }

        let mut data = reply.data;
        data.truncate(self.remaining);
        self.remaining -= data.len();

        Ok(Block::Data(data))
    }

    fn busy_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(240, Duration::from_millis(500))
    }
}

#[derive(Debug)]
pub struct Coolscan {
    model: Model,
    max_res: (u32, u32),
    boundary: (u32, u32),
    /// Distance between two frames of a film strip, in pixels.
    frame_offset: u32,
    unit_dpi: u32,
    lut_len: usize,
    prepared: Option<Geometry>,
    block_padding: usize,
    /// Colour frame whose infrared channel is still being captured.
    capturing: Option<Geometry>,
    /// Captured infrared frame waiting for its `start`.
    infrared: Option<(Geometry, Vec<u8>)>,
}

impl Coolscan {
    pub fn new(profile: &DeviceProfile) -> Self {
        let max_res = (
            profile.x_resolutions.max().max(1) as u32,
            profile.y_resolutions.max().max(1) as u32,
        );

        Self {
            model: MODELS.get(profile.variant).map_or(Model::Ls30, |(_, model)| *model),
            max_res,
            boundary: (profile.x_range.end() + 1, profile.y_range.end() + 1),
            frame_offset: max_res.1 * 3 / 2 + 1,
            unit_dpi: max_res.0,
            lut_len: 1 << profile.max_depth.min(16),
            prepared: None,
            block_padding: 0,
            capturing: None,
            infrared: None,
        }
    }

    pub fn geometry(&self, options: &OptionSet) -> Result<Geometry> {
        let preview = options.bool(names::PREVIEW)?;

        let depth = if preview {
            8
        } else {
            options.int(names::DEPTH)?.clamp(8, 16) as usize
        };
        let bytes_per_sample = if depth > 8 { 2 } else { 1 };

        let (res_x, res_y) = if preview {
            let resolution = int(options, PREVIEW_RESOLUTION)?;
            (resolution, resolution)
        } else if flag(options, INDEPENDENT_RES) {
            (int(options, names::X_RESOLUTION)?, int(options, names::Y_RESOLUTION)?)
        } else {
            let resolution = int(options, names::RESOLUTION)?;
            (resolution, resolution)
        };

        let pitch_x = (self.max_res.0 / res_x.max(1)).max(1);
        let pitch_y = (self.max_res.1 / res_y.max(1)).max(1);

        let (x0, x1) = (int(options, names::TL_X)?, int(options, names::BR_X)?);
        let (y0, y1) = (int(options, names::TL_Y)?, int(options, names::BR_Y)?);
        let (x_min, x_max) = (x0.min(x1), x0.max(x1));
        let (y_min, y_max) = (y0.min(y1), y0.max(y1));

        let frame = int(options, FRAME)?.max(1) - 1;
        let subframe = (options.fixed(SUBFRAME)? * self.unit_dpi as f64 / 25.4).max(0.0) as u32;
        let strip_offset = frame * self.frame_offset + subframe;

        let pixels = (x_max - x_min + 1) / pitch_x;
        let lines = (y_max - y_min + 1) / pitch_y;
        let width = pixels * pitch_x;
        let height = lines * pitch_y;
        let x = x_min;
        let y = y_min + strip_offset;

        let odd_padding = (bytes_per_sample == 1 && pixels % 2 == 1 && self.model.has_odd_padding()) as usize;

        let focus_point = if options.bool(FOCUS_ON_CENTRE)? {
            (x + width / 2, y + height / 2)
        } else {
            (int(options, FOCUS_X)?, int(options, FOCUS_Y)? + strip_offset)
        };

        let multiplier = options.fixed(EXPOSURE)?;
        let mut exposure = [1; 3];
        for (time, name) in exposure.iter_mut().zip(EXPOSURES) {
            *time = ((multiplier * options.fixed(name)? * 100.0) as u32).max(1);
        }

        let samples = if options.is_active(SAMPLES_PER_SCAN) {
            options.int(SAMPLES_PER_SCAN)?.clamp(1, 16) as usize
        } else {
            1
        };

        Ok(Geometry {
            depth,
            bytes_per_sample,
            shift_bits: (8 * bytes_per_sample - depth) as u32,
            x_resolution: self.max_res.0 / pitch_x,
            y_resolution: self.max_res.1 / pitch_y,
            x,
            y,
            width,
            height,
            pixels: pixels as usize,
            lines: lines as usize,
            odd_padding,
            samples,
            infrared: !preview && flag(options, INFRARED),
            negative: flag(options, NEGATIVE),
            subframe,
            focus_point,
            exposure,
        })
    }

    /// MODE SELECT switching the measurement unit to `dpi`.
    fn unit_command(&self) -> Result<Command> {
        let dpi = self.unit_dpi as u64;

        let data = if self.model.has_block_padding() {
            // Header with an 8 byte block descriptor.
            CommandBlock::new(20)
                .byte(3, 0x08)?
                .byte(11, 0x01)?
                .byte(12, 0x03)?
                .byte(13, 0x06)?
                .field(16, 2, dpi)?
        } else {
            CommandBlock::new(12)
                .byte(4, 0x03)?
                .byte(5, 0x06)?
                .field(8, 2, dpi)?
        };

        let cdb = CommandBlock::new(6)
            .byte(0, opcode::MODE_SELECT_6)?
            .byte(1, 0x10)?
            .field(4, 1, data.len() as u64)?;

        Ok(Command::new(cdb).with_data(data.into_bytes()))
    }

    /// Frame boundaries of the whole film strip.
    fn boundary_command(&self, geometry: &Geometry, frames: usize) -> Result<Command> {
        let frames = frames.max(1);
        let len = 4 + 16 * frames;

        let mut data = CommandBlock::new(len)
            .field(0, 2, len as u64)?
            .byte(2, frames as u8)?
            .byte(3, frames as u8)?;

        for frame in 0..frames {
            let offset = 4 + 16 * frame;
            let start = self.frame_offset * frame as u32 + geometry.subframe;

            data = data
                .field(offset, 4, start as u64)?
                .field(offset + 8, 4, (start + self.frame_offset - 1) as u64)?
                .field(offset + 12, 4, (self.boundary.0 - 1) as u64)?;
        }

        command::send_10(dtc::BOUNDARY, 0x03, data.into_bytes())
    }

    fn window_command(&self, geometry: &Geometry, colour: u8, kind: ScanKind) -> Result<Command> {
        let data = geometry.window(colour, kind, self.model)?;

        let cdb = CommandBlock::new(10)
            .byte(0, opcode::SET_WINDOW)?
            .field(6, 3, data.len() as u64)?
            .byte(9, self.model.window_control())?;

        Ok(Command::new(cdb).with_data(data))
    }

    fn vendor_set(op: u8, data: Vec<u8>) -> Result<Command> {
        let cdb = CommandBlock::new(10)
            .byte(0, vendor::SET)?
            .byte(2, op)?
            .field(6, 3, data.len() as u64)?;
        Ok(Command::new(cdb).with_data(data))
    }

    fn vendor_get(op: u8, len: usize) -> Result<Command> {
        let cdb = CommandBlock::new(10)
            .byte(0, vendor::GET)?
            .byte(2, op)?
            .field(6, 3, len as u64)?;
        Ok(Command::new(cdb).reading(len))
    }

    fn lut_data(&self, options: &OptionSet, index: usize) -> Result<Vec<u8>> {
        let max = self.lut_len.saturating_sub(1) as i32;

        let words: Vec<i32> = match LUTS.get(index) {
            Some(name) => options.vector(name)?.to_vec(),
            None => (0..self.lut_len as i32).collect(),
        };

        Ok(words
            .into_iter()
            .flat_map(|word| (word.clamp(0, max) as u16).to_be_bytes())
            .collect())
    }

    /// Send everything a scan of `kind` needs, up to the focus.
    fn setup(&mut self, ctx: &mut Context, kind: ScanKind) -> Result<Geometry> {
        ctx.wait_unit_ready(&self.wait_policy())?;
        ctx.run(&self.unit_command()?)?;

        let geometry = self.geometry(ctx.options)?;
        log::debug!("Use geometry {geometry:?}");

        self.block_padding = 0;
        ctx.run(&self.boundary_command(&geometry, ctx.profile.frames)?)?;

        if kind == ScanKind::Normal {
            for index in 0..geometry.colours().len() {
                ctx.run(&self.encode(&Operation::SendLut(index as u8), ctx.options)?)?;
            }
        }

        for colour in geometry.colours() {
            ctx.run(&self.window_command(&geometry, *colour, kind)?)?;
        }

        ctx.wait_unit_ready(&self.wait_policy())?;
        let focus = int(ctx.options, FOCUS)?;
        ctx.run(&self.encode(&Operation::Focus(focus), ctx.options)?)?;
        ctx.run(&self.encode(&Operation::Execute, ctx.options)?)?;

        Ok(geometry)
    }

    /// SCAN, repeated once when the device asks for it.
    fn scan(&mut self, ctx: &mut Context, geometry: &Geometry) -> Result<()> {
        let scan = command::scan(geometry.colours())?;

        ctx.wait_unit_ready(&self.wait_policy())?;
        ctx.run(&scan)?;

        if !ctx.link.status().contains(DeviceStatus::Reissue) {
            return Ok(());
        }

        log::debug!("{} asks to reissue the scan", self.model);

        if self.model.has_block_padding() {
            let header = ctx.run(&command::read_10(dtc::PADDING, 0, 6)?)?;
            let len = header.get(5).copied().unwrap_or(0) as usize + 6;
            let info = ctx.run(&command::read_10(dtc::PADDING, 0, len)?)?;

            if info.get(11..13) != Some(&[0x08, 0x00][..]) {
                log::warn!("Unexpected block padding position in {info:02x?}");
            }
            self.block_padding = get_be(&info, 19, 2).unwrap_or(0) as usize;
            log::debug!("Block padding {} bytes", self.block_padding);
        }

        ctx.run(&scan).map(drop)
    }

    fn plan(&self, geometry: &Geometry) -> FramePlan {
        let layout = geometry.layout(self.block_padding);
        let params = geometry.parameters();

        FramePlan {
            params,
            stage: Stage::Planar(layout),
            source: Box::new(CoolscanSource {
                remaining: layout.unit_len() * geometry.lines,
                line_len: layout.unit_len(),
            }),
        }
    }

    fn media(&mut self, ctx: &mut Context, op: Operation) -> Result<Info> {
        ctx.wait_ready(&self.wait_policy(), "Film holder", settled)?;
        ctx.run(&self.encode(&op, ctx.options)?)?;
        ctx.run(&self.encode(&Operation::Execute, ctx.options)?)?;
        Ok(Info::empty())
    }

    fn autofocus(&mut self, ctx: &mut Context) -> Result<Info> {
        let geometry = self.geometry(ctx.options)?;
        let (x, y) = geometry.focus_point;
        log::debug!("Autofocus at {x}x{y}");

        ctx.wait_unit_ready(&self.wait_policy())?;
        ctx.run(&self.encode(&Operation::Autofocus { x, y }, ctx.options)?)?;
        ctx.run(&self.encode(&Operation::Execute, ctx.options)?)?;

        ctx.wait_unit_ready(&self.wait_policy())?;
        let reply = ctx.run(&self.encode(&Operation::ReadFocus, ctx.options)?)?;
        let focus = get_be(&reply, 1, 4).unwrap_or(0);
        log::debug!("Focus position {focus}");

        ctx.options.store(FOCUS, Value::Int(focus as i32))?;
        Ok(Info::ReloadOptions)
    }

    fn auto_exposure(&mut self, ctx: &mut Context, kind: ScanKind) -> Result<Info> {
        ctx.wait_ready(&self.wait_policy(), "Film holder", settled)?;

        let geometry = self.setup(ctx, kind)?;
        self.scan(ctx, &geometry)?;

        for (index, colour) in COLOURS[..3].iter().enumerate() {
            ctx.wait_ready(&self.wait_policy(), "Exposure", settled)?;
            let reply = ctx.run(&self.encode(&Operation::GetExposure(*colour), ctx.options)?)?;
            let time = get_be(&reply, 54, 4).unwrap_or(0);
            log::debug!("Exposure of colour {colour}: {time} x 10 ns");

            ctx.options.store(EXPOSURES[index], Value::Fixed(fix(time as f64 / 100.0)))?;
        }
        ctx.options.store(EXPOSURE, Value::Fixed(fix(1.0)))?;

        Ok(Info::ReloadOptions | Info::ReloadParams)
    }
}

impl Dialect for Coolscan {
    fn kind(&self) -> DialectKind {
        DialectKind::Coolscan
    }

    fn wait_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(240, Duration::from_millis(500))
    }

    fn encode(&self, op: &Operation, options: &OptionSet) -> Result<Command> {
        let zeros = || vec![0u8; VENDOR_DATA_LEN];

        match op {
            Operation::LoadMedia => Self::vendor_set(vendor::LOAD, zeros()),
            Operation::EjectMedia => Self::vendor_set(vendor::EJECT, zeros()),
            Operation::ResetMedia => Self::vendor_set(vendor::RESET, zeros()),
            Operation::Focus(position) => {
                let data = CommandBlock::new(VENDOR_DATA_LEN).field(1, 4, *position as u64)?;
                Self::vendor_set(vendor::FOCUS, data.into_bytes())
            }
            Operation::Autofocus { x, y } => {
                let data = CommandBlock::new(VENDOR_DATA_LEN)
                    .field(1, 4, *x as u64)?
                    .field(5, 4, *y as u64)?;
                Self::vendor_set(vendor::AUTOFOCUS, data.into_bytes())
            }
            Operation::ReadFocus => Self::vendor_get(vendor::FOCUS, VENDOR_DATA_LEN),
            Operation::GetExposure(colour) => {
                let cdb = CommandBlock::new(10)
                    .byte(0, opcode::GET_WINDOW)?
                    .byte(1, 0x01)?
                    .byte(5, *colour)?
                    .field(6, 3, EXPOSURE_LEN as u64)?;
                Ok(Command::new(cdb).reading(EXPOSURE_LEN))
            }
            Operation::SendLut(index) => {
                let colour = COLOURS.get(*index as usize).copied().ok_or(SaneError::Inval)?;
                // DTQ: colour, bytes per entry minus one.
                let dtq = (colour as u16) << 8 | 0x01;
                command::send_10(dtc::LUT, dtq, self.lut_data(options, *index as usize)?)
            }
            Operation::TriggerScan => command::scan(self.geometry(options)?.colours()),
            Operation::Execute => Ok(Command::new(CommandBlock::new(6).byte(0, vendor::EXECUTE)?)),
            Operation::Abort => Ok(Command::new(CommandBlock::new(6).byte(0, vendor::ABORT)?)),
            op => command::encode_standard(op),
        }
    }

    fn options(&self, profile: &DeviceProfile) -> OptionSet {
        let resolutions = |list: &Resolutions| match list {
            Resolutions::List(list) => list.clone(),
            Resolutions::Range { range, .. } => vec![*range.end()],
        };
        let x_list = resolutions(&profile.x_resolutions);
        let y_list = resolutions(&profile.y_resolutions);
        let preview_default = x_list
            .iter()
            .copied()
            .filter(|resolution| *resolution >= self.max_res.0 as i32 / 10)
            .min()
            .unwrap_or(self.max_res.0 as i32);

        let x_max = *profile.x_range.end() as i32;
        let y_max = *profile.y_range.end() as i32;
        let pixels = |name, title, max| {
            OptionDescriptor::new(name, title, "", Type::Int)
                .unit(Unit::Pixel)
                .range(0..=max, 1)
        };
        let exposure = |name, title| {
            OptionDescriptor::new(name, title, "Exposure time of one channel.", Type::Fixed)
                .unit(Unit::Microsecond)
                .range(fix(50.0)..=fix(20000.0), fix(10.0))
        };
        let lut = |name, title| {
            OptionDescriptor::new(name, title, "", Type::Vector)
                .vector(self.lut_len)
                .range(0..=self.lut_len as i32 - 1, 1)
                .advanced()
        };
        let identity = || Value::Vector((0..self.lut_len as i32).collect());
        let button = |name, title, description| OptionDescriptor::new(name, title, description, Type::Button);
        let focus = profile.focus.clone().unwrap_or(0..=0);

        let mut samples = OptionDescriptor::new(SAMPLES_PER_SCAN, "Samples per scan", "Number of samples per scan", Type::Int)
            .range(1..=16, 1);
        if !profile.has(Quirks::MultiSample) {
            samples = samples.inactive();
        }

        let mut frame = OptionDescriptor::new(FRAME, "Frame number", "Number of frame to be scanned, starting with 1", Type::Int)
            .range(1..=profile.frames.max(1) as i32, 1);
        if profile.frames <= 1 {
            frame = frame.inactive();
        }

        OptionSet::new()
            .group("Scan Mode")
            .option(
                OptionDescriptor::new(names::PREVIEW, "Preview mode", "Preview mode", Type::Bool).advanced(),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(NEGATIVE, "Negative", "Negative film: make scanner invert colours", Type::Bool),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(
                    INFRARED,
                    "Read infrared channel",
                    "Read infrared channel in addition to scan colours",
                    Type::Bool,
                ),
                Value::Bool(false),
            )
            .option(samples, Value::Int(1))
            .option(
                OptionDescriptor::new(
                    names::DEPTH,
                    "Bit depth per channel",
                    "Number of bits output by scanner for each channel",
                    Type::Int,
                )
                .word_list(vec![8, profile.max_depth as i32]),
                Value::Int(8),
            )
            .group("Enhancement")
            .option(
                OptionDescriptor::new(EXPOSURE, "Exposure multiplier", "Exposure multiplier for all channels", Type::Fixed)
                    .range(fix(0.0)..=fix(10.0), fix(0.1)),
                Value::Fixed(fix(1.0)),
            )
            .option(exposure(EXPOSURE_R, "Red exposure time"), Value::Fixed(fix(1200.0)))
            .option(exposure(EXPOSURE_G, "Green exposure time"), Value::Fixed(fix(1200.0)))
            .option(exposure(EXPOSURE_B, "Blue exposure time"), Value::Fixed(fix(1000.0)))
            .option(
                button(AUTO_EXPOSURE, "Auto-exposure", "Perform auto-exposure before scan"),
                Value::Button,
            )
            .option(
                button(
                    AUTO_EXPOSURE_WB,
                    "Auto-exposure with white balance",
                    "Perform auto-exposure with white balance before scan",
                ),
                Value::Button,
            )
            .option(lut(LUT_R, "LUT for red channel"), identity())
            .option(lut(LUT_G, "LUT for green channel"), identity())
            .option(lut(LUT_B, "LUT for blue channel"), identity())
            .group("Resolution")
            .option(
                OptionDescriptor::new(names::RESOLUTION, "Resolution", "Sets the resolution of the scanned image.", Type::Int)
                    .unit(Unit::Dpi)
                    .word_list(x_list.clone()),
                Value::Int(self.max_res.0 as i32),
            )
            .option(
                OptionDescriptor::new(names::X_RESOLUTION, "X-resolution", "", Type::Int)
                    .unit(Unit::Dpi)
                    .word_list(x_list.clone())
                    .inactive()
                    .advanced(),
                Value::Int(self.max_res.0 as i32),
            )
            .option(
                OptionDescriptor::new(names::Y_RESOLUTION, "Y-resolution", "", Type::Int)
                    .unit(Unit::Dpi)
                    .word_list(y_list)
                    .inactive()
                    .advanced(),
                Value::Int(self.max_res.1 as i32),
            )
            .option(
                OptionDescriptor::new(
                    INDEPENDENT_RES,
                    "Independent x/y resolutions",
                    "Enable independent controls for scan resolution in x and y direction",
                    Type::Bool,
                )
                .advanced(),
                Value::Bool(false),
            )
            .option(
                OptionDescriptor::new(PREVIEW_RESOLUTION, "Preview resolution", "", Type::Int)
                    .unit(Unit::Dpi)
                    .word_list(x_list)
                    .advanced(),
                Value::Int(preview_default),
            )
            .group("Geometry")
            .option(frame, Value::Int(1))
            .option(
                OptionDescriptor::new(SUBFRAME, "Frame shift", "Fine position within the selected frame", Type::Fixed)
                    .unit(Unit::Mm)
                    .range(0..=fix(profile.y_mm), 0),
                Value::Fixed(0),
            )
            .option(pixels(names::TL_X, "Left x value of scan area", x_max), Value::Int(0))
            .option(pixels(names::BR_X, "Right x value of scan area", x_max), Value::Int(x_max))
            .option(pixels(names::TL_Y, "Top y value of scan area", y_max), Value::Int(0))
            .option(pixels(names::BR_Y, "Bottom y value of scan area", y_max), Value::Int(y_max))
            .group("Focus")
            .option(
                OptionDescriptor::new(
                    FOCUS_ON_CENTRE,
                    "Use centre of scan area as AF point",
                    "Use centre of scan area as AF point instead of manual AF point selection",
                    Type::Bool,
                ),
                Value::Bool(true),
            )
            .option(
                OptionDescriptor::new(FOCUS, "Focus position", "Focus position for manual focus", Type::Int)
                    .range(*focus.start() as i32..=*focus.end() as i32, 1),
                Value::Int(*focus.start() as i32),
            )
            .option(button(AUTOFOCUS, "Autofocus", "Perform autofocus before scan"), Value::Button)
            .option(pixels(FOCUS_X, "X coordinate of AF point", x_max).inactive(), Value::Int(0))
            .option(pixels(FOCUS_Y, "Y coordinate of AF point", y_max).inactive(), Value::Int(0))
            .group("Media")
            .option(button(LOAD, "Load", "Load next slide"), Value::Button)
            .option(button(EJECT, "Eject", "Eject loaded medium"), Value::Button)
            .option(button(RESET, "Reset scanner", "Initialize scanner"), Value::Button)
    }

    fn on_change(&self, options: &mut OptionSet, index: usize) -> Info {
        match options.name_of(index) {
            Some(INDEPENDENT_RES) => {
                let independent = flag(options, INDEPENDENT_RES);
                options.activate(names::RESOLUTION, !independent);
                options.activate(names::X_RESOLUTION, independent);
                options.activate(names::Y_RESOLUTION, independent);
                Info::ReloadOptions | Info::ReloadParams
            }
            Some(FOCUS_ON_CENTRE) => {
                let manual = options.bool(FOCUS_ON_CENTRE) == Ok(false);
                options.activate(FOCUS_X, manual);
                options.activate(FOCUS_Y, manual);
                Info::ReloadOptions
            }
            Some(
                names::PREVIEW | names::DEPTH | names::RESOLUTION | names::X_RESOLUTION | names::Y_RESOLUTION
                | PREVIEW_RESOLUTION | names::TL_X | names::TL_Y | names::BR_X | names::BR_Y | FRAME | SUBFRAME
                | INFRARED,
            ) => Info::ReloadParams,
            _ => Info::empty(),
        }
    }

    fn press(&mut self, ctx: &mut Context, name: &str) -> Result<Info> {
        log::debug!("Press '{name}' on {}", self.model);

        match name {
            LOAD => self.media(ctx, Operation::LoadMedia),
            EJECT => self.media(ctx, Operation::EjectMedia),
            RESET => self.media(ctx, Operation::ResetMedia),
            AUTOFOCUS => self.autofocus(ctx),
            AUTO_EXPOSURE => self.auto_exposure(ctx, ScanKind::AutoExposure),
            AUTO_EXPOSURE_WB => self.auto_exposure(ctx, ScanKind::AutoExposureWhiteBalance),
            _ => Err(SaneError::Unsupported),
        }
    }

    fn estimate(&self, _profile: &DeviceProfile, options: &OptionSet) -> Result<Parameters> {
        Ok(self.geometry(options)?.parameters())
    }

    fn configure(&mut self, ctx: &mut Context) -> Result<()> {
        self.capturing = None;
        self.infrared = None;

        let geometry = self.setup(ctx, ScanKind::Normal)?;
        self.prepared = Some(geometry);

        Ok(())
    }

    fn trigger(&mut self, ctx: &mut Context) -> Result<FramePlan> {
        let geometry = self.prepared.take().ok_or(SaneError::Inval)?;

        self.scan(ctx, &geometry)?;
        self.capturing = Some(geometry);

        let plan = self.plan(&geometry);
        log::debug!("Colour frame {:?}", plan.params);
        Ok(plan)
    }

    fn end_frame(&mut self, _ctx: &mut Context, side: Vec<u8>) -> Result<bool> {
        let Some(geometry) = self.capturing.take() else {
            return Ok(false);
        };

        if !geometry.infrared {
            return Ok(false);
        }

        log::debug!("Keep {} bytes of infrared data", side.len());
        self.infrared = Some((geometry, side));
        Ok(true)
    }

    fn next_frame(&mut self, _ctx: &mut Context) -> Result<Option<FramePlan>> {
        let Some((geometry, mut data)) = self.infrared.take() else {
            return Ok(None);
        };

        let params = geometry.infrared_parameters();
        if data.len() != params.frame_size() {
            log::warn!("Infrared frame has {} bytes, expected {}", data.len(), params.frame_size());
            data.resize(params.frame_size(), 0);
        }

        Ok(Some(FramePlan {
            params,
            stage: Stage::Copy {
                line_len: params.bytes_per_line,
            },
            source: Box::new(MemorySource::new(data, params.bytes_per_line)),
        }))
    }

    fn finish(&mut self, _ctx: &mut Context) -> Result<()> {
        self.prepared = None;
        self.capturing = None;
        self.infrared = None;
        Ok(())
    }

    fn abort(&mut self, ctx: &mut Context) -> Result<()> {
        self.prepared = None;
        self.infrared = None;

        // Nothing to stop while the infrared frame is served from memory.
        if self.capturing.take().is_some() {
            let reply = ctx.link.exchange(&self.encode(&Operation::Abort, ctx.options)?)?;
            if reply.outcome != Outcome::Ready {
                log::warn!("Abort failed with {}", reply.outcome);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{transport::mock::MockTransport, wait::RecordingSleeper};
    use pretty_assertions::assert_eq;

    fn device_page() -> Vec<u8> {
        let mut page = vec![0u8; 84];
        page[1] = DEVICE_PAGE;
        page[3] = 80;
        page[18..24].copy_from_slice(&[0x0f, 0xa0, 0x0f, 0xa0, 0x03, 0xe8]);
        page[36..40].copy_from_slice(&3946u32.to_be_bytes());
        page[40..46].copy_from_slice(&[0x0f, 0xa0, 0x0f, 0xa0, 0x03, 0xe8]);
        page[58..62].copy_from_slice(&5959u32.to_be_bytes());
        page[75] = 1;
        page[76..80].copy_from_slice(&[0x00, 0x00, 0x0c, 0x80]);
        page[82] = 14;
        page
    }

    fn inquiry() -> Inquiry {
        let mut raw = vec![0u8; 36];
        raw[0] = 0x06;
        raw[8..16].copy_from_slice(b"Nikon   ");
        raw[16..32].copy_from_slice(b"LS-4000 ED      ");
        raw[32..36].copy_from_slice(b"1.02");
        Inquiry::parse(&raw).unwrap()
    }

    fn open_link(mock: MockTransport) -> Link {
        let mut link = Link::new(Box::new(mock)).with_classifier(classify);
        link.open("mock").unwrap();
        link
    }

    fn profile() -> DeviceProfile {
        let mut mock = MockTransport::new();
        mock.reply(&[0x12, 0x01, DEVICE_PAGE], device_page());
        let mut link = open_link(mock);

        let inquiry = inquiry();
        assert!(matches(&inquiry));
        probe(&mut link, &inquiry, "/dev/sg3").unwrap()
    }

    fn set(options: &mut OptionSet, coolscan: &Coolscan, name: &str, value: Value) {
        let index = options.find(name).unwrap();
        options
            .set(index, value, |options, index| coolscan.on_change(options, index))
            .unwrap();
    }

    fn sense(key: u8, qualifier: u32, asc: u8, ascq: u8) -> SenseData {
        SenseData::parse(&MockTransport::sense_with(0x70, key, qualifier << 24, asc, ascq))
    }

    #[test]
    fn test_probe_reads_device_page() {
        let profile = profile();

        assert_eq!(profile.ty, "film scanner");
        assert_eq!(profile.x_resolutions, Resolutions::List(vec![4000, 2000, 1333, 1000]));
        assert_eq!(profile.x_range, 0..=3945);
        assert_eq!(profile.y_range, 0..=5958);
        assert_eq!(profile.max_depth, 14);
        assert_eq!(profile.focus, Some(0..=3200));
        assert!(profile.has(Quirks::Infrared | Quirks::MultiSample | Quirks::OddPadding));
        assert!(!profile.has(Quirks::BlockPadding));
    }

    #[test]
    fn test_unknown_product_rejected() {
        let mut raw = vec![0u8; 36];
        raw[8..16].copy_from_slice(b"Nikon   ");
        raw[16..32].copy_from_slice(b"LS-9000 ED      ");

        assert!(!matches(&Inquiry::parse(&raw).unwrap()));
    }

    #[test]
    fn test_sense_reissue_flag() {
        let mut status = DeviceStatus::empty();

        assert_eq!(classify(&sense(0x09, 1, 0x80, 0x06), &mut status), Outcome::Ready);
        assert_eq!(status, DeviceStatus::Reissue);

        assert_eq!(classify(&sense(0x09, 0, 0x80, 0x06), &mut status), Outcome::Ready);
        assert_eq!(status, DeviceStatus::Reissue);

        assert_eq!(classify(&sense(0x09, 2, 0x80, 0x06), &mut status), Outcome::IoError);
        assert_eq!(status, DeviceStatus::Error);

        assert_eq!(classify(&sense(0x02, 0, 0x04, 0x01), &mut status), Outcome::Busy);
        assert_eq!(status, DeviceStatus::Busy | DeviceStatus::Processing);

        assert_eq!(classify(&sense(0x02, 0, 0x3a, 0x00), &mut status), Outcome::NoMedium);
        assert_eq!(status, DeviceStatus::NoDocs);
    }

    #[test]
    fn test_geometry_pitch_and_odd_padding() {
        let profile = profile();
        let coolscan = Coolscan::new(&profile);
        let mut options = coolscan.options(&profile);
        set(&mut options, &coolscan, names::RESOLUTION, Value::Int(1333));

        let geometry = coolscan.geometry(&options).unwrap();

        assert_eq!(geometry.x_resolution, 1333);
        assert_eq!(geometry.pixels, 1315);
        assert_eq!(geometry.width, 3945);
        assert_eq!(geometry.odd_padding, 1);
        assert_eq!(geometry.exposure, [120_000, 120_000, 100_000]);
        assert_eq!(geometry.focus_point, (1972, 2979));
    }

    #[test]
    fn test_deep_samples_shifted() {
        let profile = profile();
        let coolscan = Coolscan::new(&profile);
        let mut options = coolscan.options(&profile);
        set(&mut options, &coolscan, names::DEPTH, Value::Int(14));
        set(&mut options, &coolscan, names::RESOLUTION, Value::Int(1000));
        set(&mut options, &coolscan, INFRARED, Value::Bool(true));

        let geometry = coolscan.geometry(&options).unwrap();
        let params = coolscan.estimate(&profile, &options).unwrap();

        assert_eq!(geometry.shift_bits, 2);
        assert_eq!(geometry.odd_padding, 0);
        assert_eq!(geometry.colours(), &COLOURS);
        assert_eq!(params.depth, 16);
        assert_eq!(params.pixels_per_line, 986);
        assert_eq!(params.bytes_per_line, 986 * 6);
        assert_eq!(geometry.infrared_parameters().bytes_per_line, 986 * 2);
    }

    #[test]
    fn test_window_layout() {
        let profile = profile();
        let coolscan = Coolscan::new(&profile);
        let options = coolscan.options(&profile);
        let geometry = coolscan.geometry(&options).unwrap();

        let command = coolscan.window_command(&geometry, 2, ScanKind::Normal).unwrap();
        let data = command.data_out.unwrap();

        assert_eq!(command.cdb, vec![0x24, 0, 0, 0, 0, 0, 0, 0, 0x3a, 0x80]);
        assert_eq!(data.len(), 58);
        assert_eq!(&data[..8], &[0, 0, 0, 0, 0, 0, 0, 0x32]);
        assert_eq!(&data[8..12], &[2, 0, 0x0f, 0xa0]);
        assert_eq!(&data[22..26], &3946u32.to_be_bytes());
        assert_eq!(data[33], 0x05);
        assert_eq!(data[34], 8);
        assert_eq!(&data[48..54], &[0x00, 0x81, 0x01, 0x02, 0x02, 0xff]);
        assert_eq!(&data[54..58], &120_000u32.to_be_bytes());
    }

    #[test]
    fn test_lut_upload_layout() {
        let profile = profile();
        let coolscan = Coolscan::new(&profile);
        let options = coolscan.options(&profile);

        let command = coolscan.encode(&Operation::SendLut(3), &options).unwrap();
        let data = command.data_out.unwrap();

        assert_eq!(&command.cdb[..6], &[0x2a, 0x00, 0x03, 0x00, 0x09, 0x01]);
        assert_eq!(data.len(), 2 * 16384);
        assert_eq!(&data[..6], &[0, 0, 0, 1, 0, 2]);
    }

    #[test]
    fn test_autofocus_stores_position() {
        let profile = profile();
        let mut coolscan = Coolscan::new(&profile);
        let mut options = coolscan.options(&profile);

        let mut mock = MockTransport::new();
        mock.reply(&[0xe1, 0x00, 0xc1], vec![0, 0, 0, 0x01, 0x23, 0, 0, 0, 0, 0, 0, 0, 0]);
        let log = mock.log();
        let mut link = open_link(mock);
        let mut sleeper = RecordingSleeper::default();

        let mut ctx = Context {
            link: &mut link,
            options: &mut options,
            profile: &profile,
            sleeper: &mut sleeper,
            retries: 0,
        };
        let info = coolscan.press(&mut ctx, AUTOFOCUS).unwrap();

        assert_eq!(info, Info::ReloadOptions);
        assert_eq!(options.int(FOCUS), Ok(0x123));

        let log = log.lock().unwrap();
        let autofocus = log.iter().find(|exchange| exchange.cdb[..3] == [0xe0, 0x00, 0xa0]).unwrap();
        let data = autofocus.data_out.as_ref().unwrap();
        assert_eq!(data.len(), VENDOR_DATA_LEN);
        assert_eq!(&data[1..9], &[0, 0, 0x07, 0xb5, 0, 0, 0x0b, 0xa3]);
    }

    #[test]
    fn test_independent_resolution_toggles() {
        let profile = profile();
        let coolscan = Coolscan::new(&profile);
        let mut options = coolscan.options(&profile);

        assert!(!options.is_active(names::X_RESOLUTION));
        set(&mut options, &coolscan, INDEPENDENT_RES, Value::Bool(true));
        assert!(options.is_active(names::X_RESOLUTION));
        assert!(!options.is_active(names::RESOLUTION));

        set(&mut options, &coolscan, FOCUS_ON_CENTRE, Value::Bool(false));
        assert!(options.is_active(FOCUS_X));
    }
}
