//! Looping GIF animations made from a single still image.

use std::f64::consts::PI;

use anyhow::{bail, Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{Delay, DynamicImage, Frame, Rgb, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::GenerationError;

const FRAME_SIZE: u32 = 512;
pub const MAX_FRAMES: usize = 300;
pub const MAX_FPS: u32 = 100;
pub const MAX_MOTION_SCALE: f64 = 512.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    ZoomPan,
    Rotate,
    Wave,
}

serde_plain::derive_display_from_serialize!(Effect);

impl Effect {
    /// Parses an effect name, anything unknown becomes `ZoomPan`.
    pub fn from_name(name: &str) -> Self {
        serde_plain::from_str(name).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationOptions {
    pub frames: usize,
    pub fps: u32,
    pub motion_scale: f64,
    pub effect: Effect,
}

impl AnimationOptions {
    /// Rejects frame counts, rates and motion scales outside the supported range.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.frames == 0 || self.frames > MAX_FRAMES {
            return Err(GenerationError::InvalidRequest(format!(
                "frames must be between 1 and {MAX_FRAMES}, got {}",
                self.frames
            )));
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(GenerationError::InvalidRequest(format!(
                "fps must be between 1 and {MAX_FPS}, got {}",
                self.fps
            )));
        }
        if !self.motion_scale.is_finite() || self.motion_scale.abs() > MAX_MOTION_SCALE {
            return Err(GenerationError::InvalidRequest(format!(
                "motion_scale must be a number within +/-{MAX_MOTION_SCALE}, got {}",
                self.motion_scale
            )));
        }
        Ok(())
    }
}

impl Default for AnimationOptions {
    fn default() -> Self {
        Self {
            frames: 30,
            fps: 15,
            motion_scale: 25.0,
            effect: Effect::ZoomPan,
        }
    }
}

/// 2x3 affine transform in the layout of OpenCV's `getRotationMatrix2D`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine([[f64; 3]; 2]);

impl Affine {
    fn rotation(center: (f64, f64), angle_degrees: f64, scale: f64) -> Self {
        let angle = angle_degrees.to_radians();
        let alpha = scale * angle.cos();
        let beta = scale * angle.sin();
        let (cx, cy) = center;
        Self([
            [alpha, beta, (1.0 - alpha) * cx - beta * cy],
            [-beta, alpha, beta * cx + (1.0 - alpha) * cy],
        ])
    }

    fn translate(mut self, dx: f64, dy: f64) -> Self {
        self.0[0][2] += dx;
        self.0[1][2] += dy;
        self
    }

    fn invert(&self) -> Result<Self> {
        let [[a, b, tx], [c, d, ty]] = self.0;
        let det = a * d - b * c;
        if det.abs() < f64::EPSILON {
            bail!("affine transform is not invertible");
        }
        let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);
        Ok(Self([
            [ia, ib, -(ia * tx + ib * ty)],
            [ic, id, -(ic * tx + id * ty)],
        ]))
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [[a, b, tx], [c, d, ty]] = self.0;
        (a * x + b * y + tx, c * x + d * y + ty)
    }
}

/// Mirrors an out-of-range index back into `0..len`, repeating the edge pixel.
fn reflect(index: i64, len: u32) -> u32 {
    let len = len as i64;
    let period = 2 * len;
    let m = index.rem_euclid(period);
    (if m < len { m } else { period - 1 - m }) as u32
}

fn sample_bilinear(src: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = src.dimensions();
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);
    let px = |dx: i64, dy: i64| {
        src.get_pixel(reflect(x0.saturating_add(dx), w), reflect(y0.saturating_add(dy), h))
            .0
    };
    let (p00, p10, p01, p11) = (px(0, 0), px(1, 0), px(0, 1), px(1, 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn warp_affine(src: &RgbImage, transform: &Affine) -> Result<RgbImage> {
    let inverse = transform.invert()?;
    let (w, h) = src.dimensions();
    Ok(RgbImage::from_fn(w, h, |x, y| {
        let (sx, sy) = inverse.apply(x as f64, y as f64);
        sample_bilinear(src, sx, sy)
    }))
}

fn progress(index: usize, frames: usize) -> f64 {
    if frames <= 1 {
        0.0
    } else {
        index as f64 / (frames - 1) as f64
    }
}

fn zoom_pan_frame(src: &RgbImage, index: usize, frames: usize, scale: f64) -> Result<RgbImage> {
    let p = progress(index, frames);
    let zoom = 1.0 + 0.2 * (p * PI).sin();
    let dx = (scale * (p * 2.0 * PI).sin()).trunc();
    let dy = (scale * (p * 2.0 * PI).cos()).trunc();
    let (w, h) = src.dimensions();
    let transform = Affine::rotation((w as f64 / 2.0, h as f64 / 2.0), 0.0, zoom).translate(dx, dy);
    warp_affine(src, &transform)
}

fn rotate_frame(src: &RgbImage, index: usize, frames: usize, scale: f64) -> Result<RgbImage> {
    let p = progress(index, frames);
    let angle = scale * (p * 2.0 * PI).sin();
    let zoom = 1.0 + 0.1 * (p * 2.0 * PI + PI / 2.0).sin();
    let (w, h) = src.dimensions();
    warp_affine(src, &Affine::rotation((w as f64 / 2.0, h as f64 / 2.0), angle, zoom))
}

fn wave_frame(src: &RgbImage, index: usize, frames: usize, scale: f64) -> RgbImage {
    let time = index as f64 / frames as f64 * 2.0 * PI;
    let amplitude = scale / 10.0;
    let (w, h) = src.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let offset = (amplitude * (10.0 * y as f64 / h as f64 + time).sin()).trunc() as i64;
        let src_x = (x as i64 - offset).rem_euclid(w as i64) as u32;
        *src.get_pixel(src_x, y)
    })
}

/// Renders the animation frames for `source`, resized to 512x512.
pub fn render_frames(source: &DynamicImage, options: &AnimationOptions) -> Result<Vec<RgbImage>> {
    options.validate()?;
    let src = source
        .resize_exact(FRAME_SIZE, FRAME_SIZE, FilterType::Triangle)
        .to_rgb8();
    let n = options.frames;
    let s = options.motion_scale;

    (0..n)
        .into_par_iter()
        .map(|i| match options.effect {
            Effect::ZoomPan => zoom_pan_frame(&src, i, n, s),
            Effect::Rotate => rotate_frame(&src, i, n, s),
            Effect::Wave => Ok(wave_frame(&src, i, n, s)),
        })
        .collect()
}

/// Encodes `frames` as an infinitely looping GIF.
pub fn encode_gif(frames: Vec<RgbImage>, fps: u32) -> Result<Vec<u8>> {
    if fps == 0 {
        bail!("fps must be greater than zero");
    }
    let delay = Delay::from_numer_denom_ms(1000 / fps, 1);
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        encoder.set_repeat(Repeat::Infinite).context("failed to set gif loop")?;
        let frames = frames
            .into_iter()
            .map(|frame| Frame::from_parts(DynamicImage::ImageRgb8(frame).to_rgba8(), 0, 0, delay));
        encoder.encode_frames(frames).context("failed to encode gif")?;
    }
    Ok(bytes)
}

pub fn animate(source: &DynamicImage, options: &AnimationOptions) -> Result<Vec<u8>> {
    options.validate()?;
    info!(
        frames = options.frames,
        fps = options.fps,
        effect = %options.effect,
        motion_scale = options.motion_scale,
        "Rendering animation"
    );
    let frames = render_frames(source, options)?;
    let gif = encode_gif(frames, options.fps)?;
    info!(bytes = gif.len(), "Animation encoded");
    Ok(gif)
}
