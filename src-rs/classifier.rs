use crate::config::Region;
use crate::ocr::{TextRecognizer, NUMERIC_WHITELIST};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("region {region} lies outside the {width}x{height} screenshot")]
    RegionOutOfBounds {
        region: Region,
        width: u32,
        height: u32,
    },
    #[error("region {0} is empty")]
    EmptyRegion(Region),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }
}

/// Dominant-hue test: the target channel mean must clear `floor` and beat
/// every other channel mean by the factor `margin`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorRule {
    pub channel: Channel,
    pub floor: f64,
    pub margin: f64,
}

impl Default for ColorRule {
    fn default() -> Self {
        Self {
            channel: Channel::Blue,
            floor: 100.0,
            margin: 1.2,
        }
    }
}

impl ColorRule {
    pub fn matches(&self, mean: [f64; 3]) -> bool {
        let target = self.channel.index();
        let value = mean[target];
        value > self.floor
            && mean
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != target)
                .all(|(_, other)| value > other * self.margin)
    }
}

/// One OCR read. Confidence 0 with empty text means "no signal".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

impl Recognition {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
        }
    }
}

const CONTRAST_FACTOR: f64 = 2.0;

/// Crops screenshots to configured regions and reads color/text signals.
///
/// Nothing here returns an error to the loop: failures collapse into
/// `false` or [`Recognition::empty`].
pub struct RegionClassifier {
    color_rule: ColorRule,
    recognizer: Option<Box<dyn TextRecognizer>>,
}

impl RegionClassifier {
    pub fn new(color_rule: ColorRule, recognizer: Option<Box<dyn TextRecognizer>>) -> Self {
        Self {
            color_rule,
            recognizer,
        }
    }

    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn recognizer_name(&self) -> Option<&str> {
        self.recognizer.as_deref().map(|r| r.name())
    }

    /// `image` is `None` when the capture failed; that reads as "not active".
    pub fn classify_color(&self, image: Option<&DynamicImage>, region: Region) -> bool {
        let Some(image) = image else {
            return false;
        };
        match crop(image, region) {
            Ok(rgb) => {
                let mean = mean_rgb(&rgb);
                let active = self.color_rule.matches(mean);
                log::debug!(
                    "color {region}: mean=({:.1}, {:.1}, {:.1}) active={active}",
                    mean[0],
                    mean[1],
                    mean[2]
                );
                active
            }
            Err(err) => {
                log::warn!("color check skipped: {err}");
                false
            }
        }
    }

    pub fn recognize_text(&self, image: Option<&DynamicImage>, region: Region) -> Recognition {
        let (Some(image), Some(engine)) = (image, self.recognizer.as_deref()) else {
            return Recognition::empty();
        };
        let rgb = match crop(image, region) {
            Ok(rgb) => rgb,
            Err(err) => {
                log::warn!("OCR skipped: {err}");
                return Recognition::empty();
            }
        };
        let prepared = preprocess(&rgb);
        match engine.recognize(&prepared, NUMERIC_WHITELIST) {
            Ok(text) => Recognition {
                text: text.trim().to_string(),
                confidence: 1.0,
            },
            Err(err) => {
                log::warn!("OCR failed on {region}: {err:#}");
                Recognition::empty()
            }
        }
    }
}

/// Copies `region` out of `image` as RGB, refusing rectangles that leave the frame.
pub fn crop(image: &DynamicImage, region: Region) -> Result<RgbImage, ClassifyError> {
    if region.width == 0 || region.height == 0 {
        return Err(ClassifyError::EmptyRegion(region));
    }
    let (width, height) = image.dimensions();
    if region.right() > u64::from(width) || region.bottom() > u64::from(height) {
        return Err(ClassifyError::RegionOutOfBounds {
            region,
            width,
            height,
        });
    }
    Ok(image
        .crop_imm(region.x, region.y, region.width, region.height)
        .to_rgb8())
}

pub fn mean_rgb(image: &RgbImage) -> [f64; 3] {
    let count = f64::from(image.width()) * f64::from(image.height());
    if count == 0.0 {
        return [0.0; 3];
    }
    let mut sums = [0u64; 3];
    for pixel in image.pixels() {
        for (sum, channel) in sums.iter_mut().zip(pixel.0) {
            *sum += u64::from(channel);
        }
    }
    sums.map(|s| s as f64 / count)
}

/// Grayscale, contrast ×2 around the mean, then binarize at the median.
pub fn preprocess(rgb: &RgbImage) -> GrayImage {
    let gray = DynamicImage::ImageRgb8(rgb.clone()).to_luma8();
    let contrasted = boost_contrast(&gray, CONTRAST_FACTOR);
    let threshold = median_intensity(&contrasted);
    binarize(&contrasted, threshold)
}

fn boost_contrast(gray: &GrayImage, factor: f64) -> GrayImage {
    let count = u64::from(gray.width()) * u64::from(gray.height());
    if count == 0 {
        return gray.clone();
    }
    let total: u64 = gray.pixels().map(|p| u64::from(p.0[0])).sum();
    let mean = (total as f64 / count as f64 + 0.5).floor();
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = f64::from(gray.get_pixel(x, y).0[0]);
        let out = mean + factor * (value - mean);
        Luma([out.round().clamp(0.0, 255.0) as u8])
    })
}

/// Median pixel value; for even counts the mean of the two middle values.
pub fn median_intensity(gray: &GrayImage) -> f64 {
    let mut values: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (f64::from(values[mid - 1]) + f64::from(values[mid])) / 2.0
    } else {
        f64::from(values[mid])
    }
}

fn binarize(gray: &GrayImage, threshold: f64) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = f64::from(gray.get_pixel(x, y).0[0]);
        Luma([if value > threshold { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRecognizer;
    use image::Rgb;

    fn solid(r: u8, g: u8, b: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([r, g, b])))
    }

    fn classifier() -> RegionClassifier {
        RegionClassifier::new(ColorRule::default(), None)
    }

    const WHOLE: Region = Region::new(0, 0, 40, 30);

    #[test]
    fn blue_dominant_crop_is_active() {
        let c = classifier();
        assert!(c.classify_color(Some(&solid(40, 60, 200)), WHOLE));
        assert!(c.classify_color(Some(&solid(0, 0, 101)), WHOLE));
    }

    #[test]
    fn color_rule_grid() {
        let rule = ColorRule::default();
        for r in (0..=250u32).step_by(25) {
            for g in (0..=250u32).step_by(25) {
                for b in (0..=250u32).step_by(25) {
                    let (rf, gf, bf) = (r as f64, g as f64, b as f64);
                    let expected = bf > 100.0 && bf > rf * 1.2 && bf > gf * 1.2;
                    assert_eq!(rule.matches([rf, gf, bf]), expected, "rgb=({r},{g},{b})");
                }
            }
        }
    }

    #[test]
    fn dim_or_desaturated_blue_is_not_active() {
        let c = classifier();
        assert!(!c.classify_color(Some(&solid(10, 10, 90)), WHOLE));
        assert!(!c.classify_color(Some(&solid(150, 150, 170)), WHOLE));
        assert!(!c.classify_color(Some(&solid(110, 110, 120)), WHOLE));
    }

    #[test]
    fn only_the_region_is_measured() {
        let mut img = RgbImage::from_pixel(40, 30, Rgb([200, 200, 200]));
        for y in 10..20 {
            for x in 10..20 {
                img.put_pixel(x, y, Rgb([0, 0, 255]));
            }
        }
        let img = DynamicImage::ImageRgb8(img);
        let c = classifier();
        assert!(c.classify_color(Some(&img), Region::new(10, 10, 10, 10)));
        assert!(!c.classify_color(Some(&img), WHOLE));
    }

    #[test]
    fn missing_image_is_not_active() {
        assert!(!classifier().classify_color(None, WHOLE));
    }

    #[test]
    fn out_of_bounds_region_fails_crop_and_reads_inactive() {
        let img = solid(0, 0, 255);
        let region = Region::new(30, 20, 20, 20);
        assert_eq!(
            crop(&img, region).unwrap_err(),
            ClassifyError::RegionOutOfBounds {
                region,
                width: 40,
                height: 30
            }
        );
        assert!(!classifier().classify_color(Some(&img), region));
        assert_eq!(
            crop(&img, Region::new(0, 0, 0, 5)).unwrap_err(),
            ClassifyError::EmptyRegion(Region::new(0, 0, 0, 5))
        );
    }

    #[test]
    fn recognize_without_engine_is_empty() {
        let read = classifier().recognize_text(Some(&solid(0, 0, 0)), WHOLE);
        assert_eq!(read, Recognition::empty());
    }

    #[test]
    fn recognize_uses_engine_and_trims() {
        let engine = ScriptedRecognizer::new(["  $15\n"]);
        let c = RegionClassifier::new(ColorRule::default(), Some(Box::new(engine.clone())));
        let read = c.recognize_text(Some(&solid(0, 0, 0)), WHOLE);
        assert_eq!(read.text, "$15");
        assert_eq!(read.confidence, 1.0);
        assert_eq!(engine.whitelists(), vec![NUMERIC_WHITELIST.to_string()]);
    }

    #[test]
    fn recognize_engine_error_is_soft() {
        let engine = ScriptedRecognizer::failing();
        let c = RegionClassifier::new(ColorRule::default(), Some(Box::new(engine)));
        let read = c.recognize_text(Some(&solid(0, 0, 0)), WHOLE);
        assert_eq!(read, Recognition::empty());
    }

    #[test]
    fn recognize_out_of_bounds_is_soft() {
        let engine = ScriptedRecognizer::new(["1"]);
        let c = RegionClassifier::new(ColorRule::default(), Some(Box::new(engine.clone())));
        let read = c.recognize_text(Some(&solid(0, 0, 0)), Region::new(39, 0, 5, 5));
        assert_eq!(read, Recognition::empty());
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn preprocess_binarizes_at_median() {
        let mut img = RgbImage::from_pixel(4, 1, Rgb([0, 0, 0]));
        img.put_pixel(0, 0, Rgb([20, 20, 20]));
        img.put_pixel(1, 0, Rgb([60, 60, 60]));
        img.put_pixel(2, 0, Rgb([140, 140, 140]));
        img.put_pixel(3, 0, Rgb([220, 220, 220]));
        let out = preprocess(&img);
        let values: Vec<u8> = out.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![0, 0, 255, 255]);
    }

    #[test]
    fn uniform_crop_binarizes_to_black() {
        let img = RgbImage::from_pixel(5, 5, Rgb([128, 128, 128]));
        let out = preprocess(&img);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn median_of_even_and_odd_counts() {
        let even = GrayImage::from_raw(4, 1, vec![1, 3, 5, 7]).unwrap();
        assert_eq!(median_intensity(&even), 4.0);
        let odd = GrayImage::from_raw(3, 1, vec![9, 1, 5]).unwrap();
        assert_eq!(median_intensity(&odd), 5.0);
    }

    #[test]
    fn mean_rgb_averages_channels() {
        let mut img = RgbImage::from_pixel(2, 1, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([100, 50, 200]));
        assert_eq!(mean_rgb(&img), [50.0, 25.0, 100.0]);
    }
}
