#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub format: FrameFormat,
    pub last_frame: bool,
    pub bytes_per_line: usize,
    pub pixels_per_line: usize,
    pub lines: usize,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FrameFormat {
    Gray,
    RGB,
    Red,
    Green,
    Blue,
}

impl Parameters {
    pub fn frame_size(&self) -> usize {
        self.bytes_per_line * self.lines
    }

    pub fn channels(&self) -> usize {
        match self.format {
            FrameFormat::RGB => 3,
            _ => 1,
        }
    }
}
