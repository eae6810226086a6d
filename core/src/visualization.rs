use anyhow::{bail, Context, Result};
use base64::Engine;
use image::{codecs::png::PngEncoder, ColorType, ImageEncoder};

/// Encode a planar (channel-major, values in [0, 1]) image as a PNG data URL.
///
/// One channel is written as grayscale, three as RGB.
pub fn encode_planar_png_data_url(
    channels: usize,
    width: u32,
    height: u32,
    planes: &[f32],
) -> Result<String> {
    let plane_len = (width * height) as usize;
    if planes.len() != channels * plane_len {
        bail!(
            "pixel buffer length {} does not match {} channel(s) of {}x{}",
            planes.len(),
            channels,
            width,
            height
        );
    }

    let color = match channels {
        1 => ColorType::L8,
        3 => ColorType::Rgb8,
        other => bail!("cannot encode an image with {} channels", other),
    };

    let mut interleaved = Vec::with_capacity(planes.len());
    for pixel in 0..plane_len {
        for channel in 0..channels {
            interleaved.push(to_byte(planes[channel * plane_len + pixel]));
        }
    }

    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(&interleaved, width, height, color)
        .context("failed to encode PNG data")?;

    let base64 = base64::engine::general_purpose::STANDARD.encode(&buffer);
    Ok(format!("data:image/png;base64,{base64}"))
}

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
