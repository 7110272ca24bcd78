use image::GrayImage;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::LegendConfig;
use crate::image_ops;
use crate::ocr::OcrEngine;
use crate::plan::{LegendData, RoomType};

/// Keywords searched for in legend text
pub const ROOM_KEYWORDS: &[&str] = &[
    "bedroom", "bath", "bathroom", "kitchen", "living", "dining", "office", "study", "closet",
    "pantry", "laundry", "garage", "hall", "hallway", "entry", "foyer", "stair", "staircase",
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScaleForm {
    /// `Scale: 1:N`
    LabelledRatio,
    /// `a/b" = c'-d"`
    ImperialFraction,
    /// `N" = M'-K"`
    ImperialInches,
    /// `N inch(es) = M feet`
    InchesToFeet,
    /// `1:N` or `1/N`
    Ratio,
    /// `Nmm = Mm`
    Metric,
}

const SCALE_PATTERNS: &[(ScaleForm, &str)] = &[
    (ScaleForm::LabelledRatio, r"(?i)scale\s*:?\s*1\s*[:/]\s*(\d+)"),
    (ScaleForm::ImperialFraction, r#"(?i)(\d+)\s*/\s*(\d+)\s*"\s*=\s*(\d+)['\-\s]*(\d+)?"?"#),
    (ScaleForm::ImperialInches, r#"(?i)(\d+)\s*"\s*=\s*(\d+)['\-\s]*(\d+)?"?"#),
    (ScaleForm::InchesToFeet, r"(?i)(\d+)\s*inch(?:es)?\s*=\s*(\d+)\s*f(?:ee|oo)?t"),
    (ScaleForm::Ratio, r"1\s*[:/]\s*(\d+)"),
    (ScaleForm::Metric, r"(?i)(\d+)\s*mm\s*=\s*(\d+)\s*m\b"),
];

fn scale_regexes() -> &'static [(ScaleForm, Regex)] {
    static PATTERNS: OnceLock<Vec<(ScaleForm, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SCALE_PATTERNS
            .iter()
            .filter_map(|(form, pattern)| Regex::new(pattern).ok().map(|re| (*form, re)))
            .collect()
    })
}

fn label_regexes() -> &'static [(&'static str, Regex, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        ROOM_KEYWORDS
            .iter()
            .filter_map(|kw| {
                let qualified = Regex::new(&format!(r"\b(\w+)[ \t]+{}\b", kw)).ok()?;
                let bare = Regex::new(&format!(r"\b{}\b", kw)).ok()?;
                Some((*kw, qualified, bare))
            })
            .collect()
    })
}

fn group_u32(caps: &Captures, index: usize) -> Option<u32> {
    caps.get(index).and_then(|m| m.as_str().parse().ok())
}

/// Legend symbol vocabulary
pub fn standard_symbols() -> BTreeMap<String, String> {
    [("door_swing", "door"), ("window", "window"), ("wall", "wall"), ("column", "column")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Line style vocabulary
pub fn standard_line_types() -> BTreeMap<String, String> {
    [("solid", "wall"), ("dashed", "hidden"), ("dotted", "centerline")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Finds the legend box of a sketch and reads scale and room labels from it
pub struct LegendParser {
    config: LegendConfig,
    ocr: Arc<dyn OcrEngine>,
}

impl LegendParser {
    pub fn new(config: LegendConfig, ocr: Arc<dyn OcrEngine>) -> Self {
        Self { config, ocr }
    }

    /// Parse the legend of an image file. Never fails: an unreadable file
    /// yields the default legend (scale 0.01, confidence 0).
    pub fn parse_legend_from_sketch(&self, image_path: &Path) -> LegendData {
        match image_ops::load_gray(image_path) {
            Ok(gray) => self.parse_image(&gray),
            Err(e) => {
                warn!("Could not read image for legend parsing: {:#}", e);
                self.empty_legend()
            }
        }
    }

    pub fn parse_image(&self, gray: &GrayImage) -> LegendData {
        let Some(region) = self.detect_legend_region(gray) else {
            info!("No legend region detected in sketch");
            return self.parse_without_region(gray);
        };

        let [x, y, w, h] = region;
        let crop = image_ops::crop(gray, x, y, w, h);
        let enhanced = image_ops::clahe(&crop, 2.0, 8);
        let text = self.ocr.recognize(&enhanced);

        let mut legend = self.empty_legend();
        legend.region = Some(region);
        if let Some((scale_text, ratio)) = self.extract_scale(&text) {
            legend.scale_text = Some(scale_text);
            legend.scale_ratio = ratio;
        }
        legend.labels = extract_room_labels(&text);
        legend.symbols = standard_symbols();
        legend.line_types = standard_line_types();
        legend.raw_text = text;
        legend.confidence = legend_confidence(&legend);

        info!(
            "Legend parsed: scale={}, rooms={}, confidence={:.2}",
            legend.scale_text.as_deref().unwrap_or("none"),
            legend.labels.len(),
            legend.confidence
        );
        legend
    }

    /// Whole-image OCR, used only for a scale expression
    fn parse_without_region(&self, gray: &GrayImage) -> LegendData {
        let mut legend = self.empty_legend();
        legend.line_types = standard_line_types();
        if !self.ocr.is_available() {
            debug!("OCR unavailable; legend defaults to scale {}", legend.scale_ratio);
            return legend;
        }

        let text = self.ocr.recognize(gray);
        if let Some((scale_text, ratio)) = self.extract_scale(&text) {
            legend.scale_text = Some(scale_text);
            legend.scale_ratio = ratio;
            legend.confidence = 0.3;
        }
        legend.raw_text = text;
        legend
    }

    fn empty_legend(&self) -> LegendData {
        LegendData {
            scale_ratio: self.config.default_scale_ratio,
            ..LegendData::default()
        }
    }

    /// First corner region (bottom-right, bottom-left, top-right) that looks like a legend.
    /// Returns `[x, y, width, height]`.
    pub fn detect_legend_region(&self, gray: &GrayImage) -> Option<[u32; 4]> {
        let (width, height) = gray.dimensions();
        let f = self.config.region_fraction.clamp(0.0, 1.0);
        let w = (width as f64 * f) as u32;
        let h = (height as f64 * f) as u32;
        if w == 0 || h == 0 {
            return None;
        }
        let far_x = (width as f64 * (1.0 - f)) as u32;
        let far_y = (height as f64 * (1.0 - f)) as u32;
        let near_x = (width as f64 * 0.05) as u32;
        let near_y = (height as f64 * 0.05) as u32;

        let candidates = [[far_x, far_y, w, h], [near_x, far_y, w, h], [far_x, near_y, w, h]];
        let ocr_available = self.ocr.is_available();

        for candidate in candidates {
            let [x, y, cw, ch] = candidate;
            let region = image_ops::crop(gray, x, y, cw, ch);
            if region.width() == 0 || region.height() == 0 {
                continue;
            }
            let edge_density = image_ops::nonzero_fraction(&image_ops::canny_edges(&region, 50.0, 150.0));

            if ocr_available {
                let text = self.ocr.recognize(&region);
                let chars = text.trim().chars().count();
                debug!(
                    "Legend candidate ({}, {}): {} chars, edge density {:.3}",
                    x, y, chars, edge_density
                );
                if chars >= self.config.min_text_chars && edge_density >= self.config.min_edge_density_with_ocr {
                    info!("Legend region detected at ({}, {}, {}, {})", x, y, region.width(), region.height());
                    return Some([x, y, region.width(), region.height()]);
                }
            } else if edge_density >= self.config.min_edge_density_without_ocr {
                info!(
                    "Legend region detected at ({}, {}, {}, {}) (edge density only)",
                    x,
                    y,
                    region.width(),
                    region.height()
                );
                return Some([x, y, region.width(), region.height()]);
            }
        }
        None
    }

    /// First scale expression in `text`, in pattern precedence order, with
    /// its metres-per-pixel value
    pub fn extract_scale(&self, text: &str) -> Option<(String, f64)> {
        for (form, re) in scale_regexes() {
            for caps in re.captures_iter(text) {
                let Some(ratio) = self.scale_ratio(*form, &caps) else {
                    continue;
                };
                if ratio.is_finite() && ratio > 0.0 {
                    let scale_text = caps.get(0).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
                    info!("Scale found: {}, ratio: {}", scale_text, ratio);
                    return Some((scale_text, ratio));
                }
            }
        }
        None
    }

    fn scale_ratio(&self, form: ScaleForm, caps: &Captures) -> Option<f64> {
        let ppdm = self.config.pixels_per_drawing_metre;
        let dpi = self.config.assumed_dpi;
        let imperial = |drawing_inches: f64, real_inches: f64| {
            let pixels = drawing_inches * dpi;
            (pixels > 0.0).then(|| real_inches * 0.0254 / pixels)
        };

        match form {
            ScaleForm::LabelledRatio | ScaleForm::Ratio => {
                let n = group_u32(caps, 1)? as f64;
                Some(n / ppdm)
            }
            ScaleForm::ImperialFraction => {
                let a = group_u32(caps, 1)? as f64;
                let b = group_u32(caps, 2)?.max(1) as f64;
                let feet = group_u32(caps, 3)? as f64;
                let inches = group_u32(caps, 4).unwrap_or(0) as f64;
                imperial(a / b, feet * 12.0 + inches)
            }
            ScaleForm::ImperialInches => {
                let a = group_u32(caps, 1)? as f64;
                let feet = group_u32(caps, 2)? as f64;
                let inches = group_u32(caps, 3).unwrap_or(0) as f64;
                imperial(a, feet * 12.0 + inches)
            }
            ScaleForm::InchesToFeet => {
                let a = group_u32(caps, 1)? as f64;
                let feet = group_u32(caps, 2)? as f64;
                imperial(a, feet * 12.0)
            }
            ScaleForm::Metric => {
                let mm = group_u32(caps, 1)? as f64;
                let metres = group_u32(caps, 2)? as f64;
                if mm <= 0.0 {
                    return None;
                }
                Some(metres / (mm / 1000.0) / ppdm)
            }
        }
    }
}

/// Room labels found in OCR text: `"{word} {keyword}"` and bare keywords,
/// each mapped to the keyword's room type
pub fn extract_room_labels(text: &str) -> BTreeMap<String, RoomType> {
    let lower = text.to_lowercase();
    let mut labels = BTreeMap::new();
    for (keyword, qualified, bare) in label_regexes() {
        let Some(room_type) = RoomType::from_keyword(keyword) else {
            continue;
        };
        for m in qualified.find_iter(&lower) {
            labels.insert(m.as_str().split_whitespace().collect::<Vec<_>>().join(" "), room_type.clone());
        }
        if bare.is_match(&lower) {
            labels.insert(keyword.to_string(), room_type.clone());
        }
    }
    labels
}

/// `0.3·region + 0.3·scale + 0.2·min(1, labels/5) + 0.2·symbols`
pub fn legend_confidence(legend: &LegendData) -> f64 {
    let mut confidence = 0.0;
    if legend.region.is_some() {
        confidence += 0.3;
    }
    if legend.has_scale() {
        confidence += 0.3;
    }
    confidence += 0.2 * (legend.labels.len() as f64 / 5.0).min(1.0);
    if !legend.symbols.is_empty() {
        confidence += 0.2;
    }
    confidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::NoOcr;
    use image::Luma;
    use imageproc::drawing::draw_line_segment_mut;

    struct FixedOcr(&'static str);

    impl OcrEngine for FixedOcr {
        fn recognize(&self, _region: &GrayImage) -> String {
            self.0.to_string()
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn parser(ocr: Arc<dyn OcrEngine>) -> LegendParser {
        LegendParser::new(LegendConfig::default(), ocr)
    }

    fn hatched_corner(size: u32, corner: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(size, size, Luma([255]));
        let start = size - corner;
        let mut y = start;
        while y + 2 < size {
            for dy in 0..3 {
                let row = (y + dy) as f32;
                draw_line_segment_mut(&mut img, (start as f32, row), ((size - 1) as f32, row), Luma([0]));
            }
            y += 10;
        }
        img
    }

    #[test]
    fn test_ratio_scales() {
        let p = parser(Arc::new(NoOcr));
        let (text, ratio) = p.extract_scale("LEGEND\nScale: 1:100\n").unwrap();
        assert_eq!(text, "Scale: 1:100");
        assert!((ratio - 1.0).abs() < 1e-12);

        let (_, ratio) = p.extract_scale("drawn at 1/50").unwrap();
        assert!((ratio - 0.5).abs() < 1e-12);

        assert!(p.extract_scale("no scale here").is_none());
        assert!(p.extract_scale("1:0").is_none());
    }

    #[test]
    fn test_imperial_scales() {
        let p = parser(Arc::new(NoOcr));
        let (_, ratio) = p.extract_scale(r#"1/4" = 1'-0""#).unwrap();
        // 0.25 in at 100 dpi covers 12 in
        assert!((ratio - 12.0 * 0.0254 / 25.0).abs() < 1e-12);

        let (_, ratio) = p.extract_scale(r#"1" = 10'-0""#).unwrap();
        assert!((ratio - 120.0 * 0.0254 / 100.0).abs() < 1e-12);

        let (_, ratio) = p.extract_scale("1 inch = 8 feet").unwrap();
        assert!((ratio - 96.0 * 0.0254 / 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_metric_scale() {
        let p = parser(Arc::new(NoOcr));
        let (_, ratio) = p.extract_scale("10mm = 1m").unwrap();
        assert!((ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pixels_per_drawing_metre_is_configurable() {
        let config = LegendConfig {
            pixels_per_drawing_metre: 200.0,
            ..LegendConfig::default()
        };
        let p = LegendParser::new(config, Arc::new(NoOcr));
        let (_, ratio) = p.extract_scale("1:100").unwrap();
        assert!((ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_room_labels() {
        let labels = extract_room_labels("MASTER BEDROOM\nGuest  Bath\nKitchen");
        assert_eq!(labels.get("master bedroom"), Some(&RoomType::Bedroom));
        assert_eq!(labels.get("guest bath"), Some(&RoomType::Bathroom));
        assert_eq!(labels.get("kitchen"), Some(&RoomType::Kitchen));
        assert!(!labels.contains_key("bathroom"));
    }

    #[test]
    fn test_legend_region_with_ocr() {
        let p = parser(Arc::new(FixedOcr("LEGEND\nScale: 1:100\nMaster Bedroom\nKitchen")));
        let legend = p.parse_image(&hatched_corner(200, 60));

        assert_eq!(legend.region, Some([140, 140, 60, 60]));
        assert_eq!(legend.scale_text.as_deref(), Some("Scale: 1:100"));
        assert!((legend.scale_ratio - 1.0).abs() < 1e-12);
        assert!(legend.labels.contains_key("master bedroom"));
        assert_eq!(legend.symbols.get("door_swing").map(String::as_str), Some("door"));
        // region + scale + 3 labels + symbols
        assert!((legend.confidence - (0.3 + 0.3 + 0.2 * 3.0 / 5.0 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_region_needs_enough_text() {
        let p = parser(Arc::new(FixedOcr("1:50")));
        let legend = p.parse_image(&hatched_corner(200, 60));
        assert!(legend.region.is_none());
        // whole-image fallback still finds the scale
        assert!((legend.scale_ratio - 0.5).abs() < 1e-12);
        assert!((legend.confidence - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_edge_density_only_without_ocr() {
        let p = parser(Arc::new(NoOcr));
        let legend = p.parse_image(&hatched_corner(200, 60));
        assert!(legend.region.is_some());
        assert!(legend.scale_text.is_none());
        assert_eq!(legend.scale_ratio, 0.01);
        assert!((legend.confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_blank_sketch_has_no_legend() {
        let p = parser(Arc::new(NoOcr));
        let legend = p.parse_image(&GrayImage::from_pixel(200, 200, Luma([255])));
        assert!(legend.region.is_none());
        assert_eq!(legend.confidence, 0.0);
        assert_eq!(legend.scale_ratio, 0.01);
    }

    #[test]
    fn test_unreadable_file_defaults() {
        let p = parser(Arc::new(NoOcr));
        let legend = p.parse_legend_from_sketch(Path::new("/nonexistent/sketch.png"));
        assert_eq!(legend, LegendData::default());
    }
}
