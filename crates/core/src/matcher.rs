use std::sync::Arc;

use image::imageops;
use image::GrayImage;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};

use crate::scaling::ScaledFrame;
use crate::types::{Bitmap, Point, Rect};

/// Best match of a template inside a search area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    /// Normalized score in `[0, 1]`.
    pub confidence: f64,
    /// Center of the best match, in the coordinates of the frame that was searched.
    pub position: Option<Point>,
}

impl MatchOutcome {
    pub const NONE: MatchOutcome = MatchOutcome { confidence: 0.0, position: None };
}

/// Finds a reference bitmap in a frame. `area` is already in frame coordinates.
pub trait TemplateMatcher: Send {
    fn find(&mut self, frame: &ScaledFrame, template: &Bitmap, area: Rect) -> MatchOutcome;
}

/// Zero-mean normalized cross-correlation over grayscale pixels, capped by how
/// close the window's mean color is to the reference's.
#[derive(Default)]
pub struct NccMatcher {
    gray: Option<(u64, GrayImage)>,
}

impl NccMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn gray_frame(&mut self, frame: &ScaledFrame) -> &GrayImage {
        if self.gray.as_ref().is_some_and(|(seq, _)| *seq != frame.seq) {
            self.gray = None;
        }
        &self
            .gray
            .get_or_insert_with(|| (frame.seq, imageops::grayscale(frame.image.as_ref())))
            .1
    }
}

/// Template pixels with their mean removed, plus the sums the score needs.
struct CenteredTemplate {
    width: u32,
    height: u32,
    values: Vec<f64>,
    /// Sum of squared centered values; 0 for a flat template.
    energy: f64,
    colors: [f64; 3],
}

impl CenteredTemplate {
    fn new(template: &Bitmap) -> Self {
        let gray = imageops::grayscale(template);
        let n = f64::from(gray.width() * gray.height());
        let mean = gray.pixels().map(|p| f64::from(p[0])).sum::<f64>() / n;
        let values: Vec<f64> = gray.pixels().map(|p| f64::from(p[0]) - mean).collect();
        let energy = values.iter().map(|v| v * v).sum();

        let mut colors = [0.0; 3];
        for px in template.pixels() {
            for (sum, c) in colors.iter_mut().zip(px.0) {
                *sum += f64::from(c);
            }
        }
        colors.iter_mut().for_each(|c| *c /= n);
        Self { width: gray.width(), height: gray.height(), values, energy, colors }
    }

    fn len(&self) -> f64 {
        f64::from(self.width * self.height)
    }

    /// Correlation of the window at (x, y) with the centered template. The
    /// window mean drops out because the centered values sum to 0.
    fn correlate(&self, region: &GrayImage, x: u32, y: u32) -> f64 {
        let mut sum = 0.0;
        for ty in 0..self.height {
            let row = &self.values[(ty * self.width) as usize..((ty + 1) * self.width) as usize];
            for (tx, t) in row.iter().enumerate() {
                sum += f64::from(region.get_pixel(x + tx as u32, y + ty)[0]) * t;
            }
        }
        sum
    }
}

/// 1 for identical mean colors, 0 for black against white.
fn color_similarity(window: [f64; 3], template: [f64; 3]) -> f64 {
    let diff: f64 = window.iter().zip(template).map(|(w, t)| (w - t).abs()).sum();
    1.0 - diff / (255.0 * 3.0)
}

impl TemplateMatcher for NccMatcher {
    fn find(&mut self, frame: &ScaledFrame, template: &Bitmap, area: Rect) -> MatchOutcome {
        let color_frame = Arc::clone(&frame.image);
        let gray = self.gray_frame(frame);
        let area = area.clamp_to(gray.width(), gray.height());
        if area.is_empty() || template.width() > area.width || template.height() > area.height {
            return MatchOutcome::NONE;
        }
        if template.width() == 0 || template.height() == 0 {
            return MatchOutcome::NONE;
        }

        let (left, top) = (area.left as u32, area.top as u32);
        let region = imageops::crop_imm(gray, left, top, area.width, area.height).to_image();
        let colors = imageops::crop_imm(color_frame.as_ref(), left, top, area.width, area.height).to_image();
        let sums = integral_image::<_, u64>(&region);
        let squares = integral_squared_image::<_, u64>(&region);
        let color_sums = integral_image::<_, u64>(&colors);

        let needle = CenteredTemplate::new(template);
        let n = needle.len();
        let count = u128::from(needle.width * needle.height);
        let mut best = (f64::MIN, 0, 0);
        for y in 0..=area.height - needle.height {
            for x in 0..=area.width - needle.width {
                let (right, bottom) = (x + needle.width - 1, y + needle.height - 1);
                let [sum] = sum_image_pixels(&sums, x, y, right, bottom);
                let [sum_sq] = sum_image_pixels(&squares, x, y, right, bottom);
                // n * variance, exact in integers.
                let spread = (count * u128::from(sum_sq)).saturating_sub(u128::from(sum) * u128::from(sum)) as f64 / n;

                let shape = match (spread > 0.0, needle.energy > 0.0) {
                    (true, true) => needle.correlate(&region, x, y) / (spread * needle.energy).sqrt(),
                    (false, false) => 1.0,
                    // Flat windows carry no shape to correlate with.
                    _ => 0.0,
                };
                let [r, g, b, _] = sum_image_pixels(&color_sums, x, y, right, bottom);
                let mean = [r as f64 / n, g as f64 / n, b as f64 / n];
                let mut score = shape.min(color_similarity(mean, needle.colors));
                if !score.is_finite() {
                    score = 0.0;
                }
                if score > best.0 {
                    best = (score, x, y);
                }
            }
        }

        let (score, x, y) = best;
        let position = Point::new(
            area.left + x as i32 + (needle.width / 2) as i32,
            area.top + y as i32 + (needle.height / 2) as i32,
        );
        MatchOutcome { confidence: score.clamp(0.0, 1.0), position: Some(position) }
    }
}
