//! Reassembly of raw device data into packed rows.
//!
//! Raw bytes are accumulated until one raw unit (a line, or a single colour
//! raster) is complete, the unit goes through a [`Stage`] and the produced
//! bytes wait in an output queue until the caller pulls them.

use crate::result::{Result, SaneError};
use std::collections::{BTreeMap, VecDeque};

/// Layout of one planar line as sent by film scanners.
///
/// A line holds `samples` passes. Each pass holds one segment per raw channel
/// followed by `block_padding` bytes, and each segment starts with
/// `odd_padding` bytes followed by `width` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanarLayout {
    pub width: usize,
    /// Colour channels interleaved into the output, 1 or 3.
    pub channels: usize,
    /// An extra infrared channel follows the colour channels.
    pub infrared: bool,
    pub samples: usize,
    pub bytes_per_sample: usize,
    pub shift_bits: u32,
    pub odd_padding: usize,
    pub block_padding: usize,
}

impl PlanarLayout {
    fn raw_channels(&self) -> usize {
        self.channels + self.infrared as usize
    }

    fn segment_len(&self) -> usize {
        self.width * self.bytes_per_sample + self.odd_padding
    }

    fn pass_len(&self) -> usize {
        self.raw_channels() * self.segment_len() + self.block_padding
    }

    pub fn unit_len(&self) -> usize {
        self.samples.max(1) * self.pass_len()
    }

    pub fn output_len(&self) -> usize {
        self.width * self.channels * self.bytes_per_sample
    }

    fn sample(&self, unit: &[u8], pass: usize, channel: usize, x: usize) -> u32 {
        let offset = pass * self.pass_len()
            + channel * self.segment_len()
            + self.odd_padding
            + x * self.bytes_per_sample;

        match self.bytes_per_sample {
            1 => unit[offset] as u32,
            _ => u16::from_be_bytes([unit[offset], unit[offset + 1]]) as u32,
        }
    }

    fn process(&self, unit: &[u8], out: &mut VecDeque<u8>, side: &mut Vec<u8>) {
        let samples = self.samples.max(1) as u32;

        for x in 0..self.width {
            for channel in 0..self.raw_channels() {
                let sum: u32 = (0..samples as usize)
                    .map(|pass| self.sample(unit, pass, channel, x))
                    .sum();
                let average = (sum + samples / 2) / samples;

                let (bytes, len) = match self.bytes_per_sample {
                    1 => ([average as u8, 0], 1),
                    _ => (((average << self.shift_bits) as u16).to_ne_bytes(), 2),
                };

                if channel == self.channels {
                    side.extend_from_slice(&bytes[..len]);
                } else {
                    out.extend(&bytes[..len]);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRow {
    data: Vec<u8>,
    mask: u8,
}

/// Reorders single-colour rasters of a sensor whose colour rows are `shift`
/// lines apart into interleaved RGB lines.
///
/// At time step `t` the sensor emits blue of line `t`, green of line
/// `t - shift` and red of line `t - 2 * shift`, skipping lines outside the
/// image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaggerReorder {
    width: usize,
    shift: usize,
    lines: usize,
    step: usize,
    slot: usize,
    next_line: usize,
    pending: BTreeMap<usize, PendingRow>,
}

impl StaggerReorder {
    const COMPLETE: u8 = 0b111;

    pub fn new(width: usize, shift: usize, lines: usize) -> Self {
        Self {
            width,
            shift,
            lines,
            step: 0,
            slot: 0,
            next_line: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Line and colour (0 red, 1 green, 2 blue) of the next raster.
    fn next_target(&mut self) -> Option<(usize, usize)> {
        while self.step < self.lines + 2 * self.shift {
            let slot = self.slot;
            let step = self.step;

            self.slot += 1;
            if self.slot == 3 {
                self.slot = 0;
                self.step += 1;
            }

            let Some(line) = step.checked_sub(slot * self.shift) else {
                continue;
            };

            if line < self.lines {
                return Some((line, 2 - slot));
            }
        }

        None
    }

    fn process(&mut self, raster: &[u8], out: &mut VecDeque<u8>) {
        let Some((line, colour)) = self.next_target() else {
            log::warn!("Unexpected raster after the last line, dropped");
            return;
        };

        let width = self.width;
        let row = self.pending.entry(line).or_insert_with(|| PendingRow {
            data: vec![0; width * 3],
            mask: 0,
        });

        for (x, &value) in raster.iter().enumerate() {
            row.data[x * 3 + colour] = value;
        }
        row.mask |= 1 << colour;

        while let Some(row) = self.pending.get(&self.next_line) {
            if row.mask != Self::COMPLETE {
                break;
            }

            if let Some(row) = self.pending.remove(&self.next_line) {
                out.extend(row.data);
            }
            self.next_line += 1;
        }
    }

    pub fn pending_lines(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Copy { line_len: usize },
    /// One bit per pixel rows, optionally inverted and with bits mirrored.
    Lineart {
        line_len: usize,
        invert: bool,
        reverse_bits: bool,
    },
    Planar(PlanarLayout),
    Stagger(StaggerReorder),
}

impl Stage {
    pub fn unit_len(&self) -> usize {
        match self {
            Stage::Copy { line_len } | Stage::Lineart { line_len, .. } => *line_len,
            Stage::Planar(layout) => layout.unit_len(),
            Stage::Stagger(stagger) => stagger.width,
        }
    }

    fn process(&mut self, unit: &[u8], out: &mut VecDeque<u8>, side: &mut Vec<u8>) {
        match self {
            Stage::Copy { .. } => out.extend(unit),
            Stage::Lineart {
                invert,
                reverse_bits,
                ..
            } => out.extend(unit.iter().map(|&byte| {
                let byte = if *invert { !byte } else { byte };
                if *reverse_bits {
                    byte.reverse_bits()
                } else {
                    byte
                }
            })),
            Stage::Planar(layout) => layout.process(unit, out, side),
            Stage::Stagger(stagger) => stagger.process(unit, out),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stage: Stage,
    carry: Vec<u8>,
    output: VecDeque<u8>,
    side: Vec<u8>,
}

impl Pipeline {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            carry: Vec::new(),
            output: VecDeque::new(),
            side: Vec::new(),
        }
    }

    pub fn unit_len(&self) -> usize {
        self.stage.unit_len()
    }

    pub fn push(&mut self, raw: &[u8]) -> Result<()> {
        let unit_len = self.stage.unit_len();
        if unit_len == 0 {
            return Err(SaneError::Inval);
        }

        let mut raw = raw;

        if !self.carry.is_empty() {
            let missing = unit_len - self.carry.len();
            let take = missing.min(raw.len());
            self.carry.extend_from_slice(&raw[..take]);
            raw = &raw[take..];

            if self.carry.len() < unit_len {
                return Ok(());
            }

            let unit = std::mem::take(&mut self.carry);
            self.stage.process(&unit, &mut self.output, &mut self.side);
        }

        let mut units = raw.chunks_exact(unit_len);
        for unit in &mut units {
            self.stage.process(unit, &mut self.output, &mut self.side);
        }
        self.carry.extend_from_slice(units.remainder());

        Ok(())
    }

    pub fn pull(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.output.len());

        for (dst, src) in out.iter_mut().zip(self.output.drain(..count)) {
            *dst = src;
        }

        count
    }

    pub fn available(&self) -> usize {
        self.output.len()
    }

    /// Drop incomplete data left at the end of a frame.
    pub fn finish(&mut self) {
        if !self.carry.is_empty() {
            log::warn!("Dropping {} bytes of an incomplete raw unit", self.carry.len());
            self.carry.clear();
        }

        if let Stage::Stagger(stagger) = &mut self.stage {
            if stagger.pending_lines() > 0 {
                log::warn!("Dropping {} incomplete colour lines", stagger.pending_lines());
                stagger.pending.clear();
            }
        }
    }

    /// Side channel (infrared) collected so far.
    pub fn take_side(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pull_all(pipeline: &mut Pipeline) -> Vec<u8> {
        let mut out = vec![0; pipeline.available()];
        let count = pipeline.pull(&mut out);
        out.truncate(count);
        out
    }

    #[test]
    fn test_copy_carries_partial_units() {
        let mut pipeline = Pipeline::new(Stage::Copy { line_len: 4 });

        pipeline.push(&[1, 2, 3]).unwrap();
        assert_eq!(pipeline.available(), 0);

        pipeline.push(&[4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(pull_all(&mut pipeline), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        pipeline.push(&[10, 11, 12]).unwrap();
        assert_eq!(pull_all(&mut pipeline), vec![9, 10, 11, 12]);
    }

    #[test]
    fn test_pull_in_small_pieces() {
        let mut pipeline = Pipeline::new(Stage::Copy { line_len: 4 });
        pipeline.push(&[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 3];
        assert_eq!(pipeline.pull(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(pipeline.pull(&mut out), 1);
        assert_eq!(out[0], 4);
        assert_eq!(pipeline.pull(&mut out), 0);
    }

    #[test]
    fn test_lineart_invert_and_reverse() {
        let mut pipeline = Pipeline::new(Stage::Lineart {
            line_len: 2,
            invert: true,
            reverse_bits: true,
        });

        pipeline.push(&[0b1111_0000, 0b0000_0001]).unwrap();

        assert_eq!(pull_all(&mut pipeline), vec![0b1111_0000, 0b0111_1111]);
    }

    #[test]
    fn test_planar_interleaves_colours() {
        let layout = PlanarLayout {
            width: 2,
            channels: 3,
            infrared: false,
            samples: 1,
            bytes_per_sample: 1,
            shift_bits: 0,
            odd_padding: 0,
            block_padding: 0,
        };
        let mut pipeline = Pipeline::new(Stage::Planar(layout));

        pipeline.push(&[10, 11, 20, 21, 30, 31]).unwrap();

        assert_eq!(pull_all(&mut pipeline), vec![10, 20, 30, 11, 21, 31]);
    }

    #[test]
    fn test_planar_padding_skipped() {
        let layout = PlanarLayout {
            width: 1,
            channels: 3,
            infrared: false,
            samples: 1,
            bytes_per_sample: 1,
            shift_bits: 0,
            odd_padding: 1,
            block_padding: 2,
        };
        let mut pipeline = Pipeline::new(Stage::Planar(layout));
        assert_eq!(pipeline.unit_len(), 8);

        pipeline.push(&[0xee, 1, 0xee, 2, 0xee, 3, 0xff, 0xff]).unwrap();

        assert_eq!(pull_all(&mut pipeline), vec![1, 2, 3]);
    }

    #[test]
    fn test_averaging_identical_samples_is_identity() {
        let layout = PlanarLayout {
            width: 3,
            channels: 1,
            infrared: false,
            samples: 4,
            bytes_per_sample: 1,
            shift_bits: 0,
            odd_padding: 0,
            block_padding: 0,
        };
        let line = [0u8, 127, 255];

        let mut pipeline = Pipeline::new(Stage::Planar(layout));
        pipeline.push(&line.repeat(4)).unwrap();

        assert_eq!(pull_all(&mut pipeline), line.to_vec());
    }

    #[test]
    fn test_averaging_rounds_half_up() {
        let layout = PlanarLayout {
            width: 1,
            channels: 1,
            infrared: false,
            samples: 2,
            bytes_per_sample: 1,
            shift_bits: 0,
            odd_padding: 0,
            block_padding: 0,
        };

        let mut pipeline = Pipeline::new(Stage::Planar(layout));
        pipeline.push(&[10, 11]).unwrap();

        assert_eq!(pull_all(&mut pipeline), vec![11]);
    }

    #[test]
    fn test_planar_16_bit_shift_and_infrared() {
        let layout = PlanarLayout {
            width: 1,
            channels: 1,
            infrared: true,
            samples: 1,
            bytes_per_sample: 2,
            shift_bits: 2,
            odd_padding: 0,
            block_padding: 0,
        };

        let mut pipeline = Pipeline::new(Stage::Planar(layout));
        pipeline.push(&[0x01, 0x02, 0x00, 0x10]).unwrap();

        assert_eq!(pull_all(&mut pipeline), (0x0102u16 << 2).to_ne_bytes().to_vec());
        assert_eq!(pipeline.take_side(), (0x0010u16 << 2).to_ne_bytes().to_vec());
    }

    /// Emit rasters in sensor order for an image whose pixel values encode
    /// line and colour, then check every output pixel.
    fn stagger_ramp(lines: usize, shift: usize) {
        let width = 2;

        let mut rasters = Vec::new();
        for t in 0..lines + 2 * shift {
            for slot in 0..3 {
                if let Some(line) = t.checked_sub(slot * shift).filter(|line| *line < lines) {
                    let colour = 2 - slot;
                    rasters.extend(std::iter::repeat((line * 3 + colour) as u8).take(width));
                }
            }
        }

        let mut pipeline = Pipeline::new(Stage::Stagger(StaggerReorder::new(width, shift, lines)));
        for chunk in rasters.chunks(5) {
            pipeline.push(chunk).unwrap();
        }

        let output = pull_all(&mut pipeline);
        assert_eq!(output.len(), lines * width * 3, "lines {lines}, shift {shift}");

        for (index, value) in output.iter().enumerate() {
            let line = index / (width * 3);
            let colour = index % 3;
            assert_eq!(*value as usize, line * 3 + colour, "lines {lines}, shift {shift}");
        }
    }

    #[test]
    fn test_stagger_ramp_has_no_misalignment() {
        for lines in [1, 2, 5, 17] {
            for shift in [0, 1, 2, 4, 8] {
                stagger_ramp(lines, shift);
            }
        }
    }

    #[test]
    fn test_stagger_rows_wait_for_all_colours() {
        let mut pipeline = Pipeline::new(Stage::Stagger(StaggerReorder::new(1, 1, 3)));

        // t = 0: blue of line 0 only.
        pipeline.push(&[2]).unwrap();
        assert_eq!(pipeline.available(), 0);

        // t = 1: blue 1, green 0. t = 2: blue 2, green 1, red 0.
        pipeline.push(&[5, 1, 8, 4, 0]).unwrap();
        assert_eq!(pull_all(&mut pipeline), vec![0, 1, 2]);
    }
}
