//! Pixel comparison of two screenshots
//!
//! Pixels are compared in YIQ space after blending over white, the metric
//! used by pixelmatch. A pixel differs when its perceived colour distance
//! exceeds `threshold` on a 0..1 scale.

use image::{Rgba, RgbaImage};

/// Largest possible YIQ distance between two pixels
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Options for [`diff`]
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// 0.0 demands exact colours; 1.0 accepts anything
    pub threshold: f64,

    /// Render a diff image
    pub diff_image: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            threshold: crate::config::DIFF_THRESHOLD,
            diff_image: true,
        }
    }
}

/// Result of a comparison
#[derive(Debug, Clone)]
pub struct DiffResult {
    /// No pixel exceeded the threshold
    pub equal: bool,

    /// Number of differing pixels
    pub pixels_differing: u64,

    /// Differing pixels in red over a dimmed copy of `a`
    pub image: Option<RgbaImage>,
}

/// Compare two images of equal size. Callers check dimensions first.
pub fn diff(a: &RgbaImage, b: &RgbaImage, opts: &DiffOptions) -> DiffResult {
    debug_assert_eq!(a.dimensions(), b.dimensions());

    let max_delta = MAX_YIQ_DELTA * opts.threshold * opts.threshold;
    let (width, height) = a.dimensions();
    let mut out = opts.diff_image.then(|| RgbaImage::new(width, height));
    let mut pixels_differing = 0u64;

    for (x, y, pa) in a.enumerate_pixels() {
        let pb = b.get_pixel(x, y);
        let differs = pa != pb && color_delta(pa, pb) > max_delta;
        if differs {
            pixels_differing += 1;
        }
        if let Some(img) = out.as_mut() {
            img.put_pixel(x, y, if differs { Rgba([255, 0, 0, 255]) } else { dim(pa) });
        }
    }

    DiffResult {
        equal: pixels_differing == 0,
        pixels_differing,
        image: out,
    }
}

fn dim(p: &Rgba<u8>) -> Rgba<u8> {
    // Grey, faded toward white so the red stands out
    let [r, g, b] = blend_white(p);
    let y = rgb2y(r, g, b);
    let v = (255.0 + (y - 255.0) * 0.1).clamp(0.0, 255.0) as u8;
    Rgba([v, v, v, 255])
}

fn blend_white(p: &Rgba<u8>) -> [f64; 3] {
    let a = f64::from(p[3]) / 255.0;
    let blend = |c: u8| 255.0 + (f64::from(c) - 255.0) * a;
    [blend(p[0]), blend(p[1]), blend(p[2])]
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let [r1, g1, b1] = blend_white(a);
    let [r2, g2, b2] = blend_white(b);
    let y = rgb2y(r1, g1, b1) - rgb2y(r2, g2, b2);
    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q
}
