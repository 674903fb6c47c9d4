//! Portable anymap output.

use anyhow::{bail, ensure, Context};
use libsane_engine::{FrameFormat, Parameters};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum Magic {
    /// Bitmap, one bit per pixel, 1 is black.
    P4,
    /// Graymap.
    P5,
    /// Pixmap.
    P6,
}

/// Write one image. 16 bit samples arrive in host order and are stored big
/// endian.
pub fn write<W: Write>(mut out: W, params: &Parameters, data: &[u8]) -> anyhow::Result<()> {
    let (magic, maxval) = match (params.format, params.depth) {
        (FrameFormat::Gray, 1) => (Magic::P4, None),
        (FrameFormat::Gray, 8) => (Magic::P5, Some(255)),
        (FrameFormat::Gray, 16) => (Magic::P5, Some(65535)),
        (FrameFormat::RGB, 8) => (Magic::P6, Some(255)),
        (FrameFormat::RGB, 16) => (Magic::P6, Some(65535)),
        (format, depth) => bail!("unsupported frame format {format} with depth {depth}"),
    };

    ensure!(
        data.len() == params.frame_size(),
        "image has {} bytes, expected {}",
        data.len(),
        params.frame_size()
    );

    writeln!(out, "{magic}")?;
    writeln!(out, "# {} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "{} {}", params.pixels_per_line, params.lines)?;
    if let Some(maxval) = maxval {
        writeln!(out, "{maxval}")?;
    }

    if params.depth == 16 {
        let swapped: Vec<u8> = data
            .chunks_exact(2)
            .flat_map(|sample| u16::from_ne_bytes([sample[0], sample[1]]).to_be_bytes())
            .collect();
        out.write_all(&swapped)?;
    } else {
        out.write_all(data)?;
    }

    out.flush()?;
    Ok(())
}

pub fn save(path: &Path, params: &Parameters, data: &[u8]) -> anyhow::Result<()> {
    let dpath = path.display();
    let file = File::create(path).with_context(|| format!("creating file '{dpath}'"))?;

    write(BufWriter::new(file), params, data).with_context(|| format!("writing file '{dpath}'"))
}

/// Path of the `index`th image: the first one as given, the rest numbered.
pub fn numbered(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_owned();
    }

    let stem = path.file_stem().map(|stem| stem.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{}.{}", index + 1, ext.to_string_lossy()),
        None => format!("{stem}-{}", index + 1),
    };

    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(format: FrameFormat, depth: usize, bytes_per_line: usize) -> Parameters {
        Parameters {
            format,
            last_frame: true,
            bytes_per_line,
            pixels_per_line: 2,
            lines: 2,
            depth,
        }
    }

    fn header() -> String {
        format!("# {} version {}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    #[test]
    fn test_gray_image() {
        let mut out = Vec::new();
        write(&mut out, &params(FrameFormat::Gray, 8, 2), &[1, 2, 3, 4]).unwrap();

        let mut expected = format!("P5\n{}2 2\n255\n", header()).into_bytes();
        expected.extend([1, 2, 3, 4]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_lineart_has_no_maxval() {
        let mut out = Vec::new();
        write(&mut out, &params(FrameFormat::Gray, 1, 1), &[0x80, 0x40]).unwrap();

        let mut expected = format!("P4\n{}2 2\n", header()).into_bytes();
        expected.extend([0x80, 0x40]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_deep_colour_stored_big_endian() {
        let data: Vec<u8> = (0..6u16).flat_map(|sample| (sample * 0x0101 + 0x0100).to_ne_bytes()).collect();
        let mut params = params(FrameFormat::RGB, 16, 12);
        params.lines = 1;

        let mut out = Vec::new();
        write(&mut out, &params, &data).unwrap();

        let body = &out[out.len() - 12..];
        assert_eq!(body[..4], [0x01, 0x00, 0x02, 0x01]);
        assert!(out.starts_with(b"P6\n"));
    }

    #[test]
    fn test_short_image_rejected() {
        let result = write(Vec::new(), &params(FrameFormat::Gray, 8, 2), &[1, 2, 3]);

        assert_eq!(result.unwrap_err().to_string(), "image has 3 bytes, expected 4");
    }

    #[test]
    fn test_single_channel_frames_unsupported() {
        assert!(write(Vec::new(), &params(FrameFormat::Red, 8, 2), &[0; 4]).is_err());
    }

    #[test]
    fn test_numbered_paths() {
        let path = Path::new("/tmp/scan.pnm");

        assert_eq!(numbered(path, 0), PathBuf::from("/tmp/scan.pnm"));
        assert_eq!(numbered(path, 1), PathBuf::from("/tmp/scan-2.pnm"));
        assert_eq!(numbered(Path::new("page"), 2), PathBuf::from("page-3"));
    }
}
