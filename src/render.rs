//! Converting rendered RGBA8 frames to files and window buffers

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

fn check_len(width: u32, height: u32, rgba: &[u8]) -> io::Result<()> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() < expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}x{} frame needs {} bytes, got {}", width, height, expected, rgba.len()),
        ));
    }
    Ok(())
}

/// Write a frame as plain PPM, each pixel repeated `scale` times per axis.
/// Alpha is dropped.
pub fn write_ppm(out: &mut impl Write, width: u32, height: u32, rgba: &[u8], scale: u32) -> io::Result<()> {
    check_len(width, height, rgba)?;
    let scale = scale.max(1);
    let img_width = width * scale;
    let img_height = height * scale;

    writeln!(out, "P3")?;
    writeln!(out, "{} {}", img_width, img_height)?;
    writeln!(out, "255")?;

    for img_y in 0..img_height {
        for img_x in 0..img_width {
            let x = img_x / scale;
            let y = img_y / scale;
            let at = ((y * width + x) * 4) as usize;
            write!(out, "{} {} {} ", rgba[at], rgba[at + 1], rgba[at + 2])?;
        }
        writeln!(out)?;
    }

    Ok(())
}

/// Save a frame read back from the engine to a PPM file
pub fn save_ppm(path: impl AsRef<Path>, width: u32, height: u32, rgba: &[u8]) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_ppm(&mut file, width, height, rgba, 1)?;
    file.flush()
}

/// RGBA8 bytes to minifb's 0x00RRGGBB pixels
pub fn rgba_to_rgb32(rgba: &[u8], out: &mut Vec<u32>) {
    out.clear();
    out.extend(
        rgba.chunks_exact(4)
            .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ppm_header_and_pixels() {
        let rgba = [255, 0, 0, 255, 0, 128, 255, 255];
        let mut out = Vec::new();
        write_ppm(&mut out, 2, 1, &rgba, 1).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "P3");
        assert_eq!(lines[1], "2 1");
        assert_eq!(lines[2], "255");
        assert_eq!(lines[3].trim_end(), "255 0 0 0 128 255");
    }

    #[test]
    fn test_ppm_scale_repeats_pixels() {
        let rgba = [10, 20, 30, 255];
        let mut out = Vec::new();
        write_ppm(&mut out, 1, 1, &rgba, 2).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("P3\n2 2\n255\n"));
        assert_eq!(text.matches("10 20 30").count(), 4);
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let mut out = Vec::new();
        let err = write_ppm(&mut out, 4, 4, &[0u8; 8], 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_rgb32_packing() {
        let mut pixels = Vec::new();
        rgba_to_rgb32(&[0x12, 0x34, 0x56, 0xff, 1, 2, 3, 0], &mut pixels);
        assert_eq!(pixels, vec![0x0012_3456, 0x0001_0203]);
    }
}
