//! Sketch reader: raster floor plan to walls, rooms and openings.
//!
//! Pipeline: grayscale, deskew, CLAHE, non-local means, open 2×2, close 3×3;
//! Otsu-guided Canny at three blur levels OR'd together and morphologically
//! linked; probabilistic Hough for walls, hole contours for rooms, wall gaps
//! and small contours for openings.

use image::GrayImage;
use ordered_float::OrderedFloat;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ReaderConfig, SymbolConfig};
use crate::error::PipelineError;
use crate::hough::{hough_lines, hough_lines_p};
use crate::image_ops;
use crate::opening_detector::detect_openings;
use crate::plan::{LegendData, Opening, PlanData, Room, Wall, DEFAULT_SCALE_RATIO};
use crate::room_detector::detect_rooms;
use crate::symbol_detector::detect_symbols;
use crate::wall_merger::merge_wall_segments;

const MAX_SYMBOLS: usize = 200;
const DESKEW_LINES: usize = 20;
const MIN_SIDE_PX: u32 = 16;

/// Anything that turns a sketch into plan data. The processing agent only
/// talks to this trait.
pub trait PlanReader: Send + Sync {
    fn read_sketch(&self, image_path: &Path, legend: Option<&LegendData>) -> Result<PlanData, PipelineError>;

    fn reader_type(&self) -> &str;
}

/// Raster reader built on classical image processing
#[derive(Debug, Clone, Default)]
pub struct SketchReader {
    config: ReaderConfig,
    symbols: SymbolConfig,
}

impl SketchReader {
    pub fn new(config: ReaderConfig, symbols: SymbolConfig) -> Self {
        Self { config, symbols }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Deskew, contrast, denoise and clean up a grayscale sketch
    pub fn preprocess(&self, gray: &GrayImage) -> GrayImage {
        let c = &self.config;
        let deskewed = self.deskew(gray);
        let enhanced = image_ops::clahe(&deskewed, c.clahe_clip_limit, c.clahe_tiles);
        let denoised = image_ops::non_local_means(&enhanced, c.nlm_h, c.nlm_template_window, c.nlm_search_window);
        let opened = image_ops::open_rect(&denoised, 2, 2);
        image_ops::close_rect(&opened, 3, 3)
    }

    /// Median angle of the strongest Hough lines, mapped into (-45°, 45°].
    /// None when fewer than two lines are found.
    pub fn estimate_skew(&self, gray: &GrayImage) -> Option<f64> {
        let edges = image_ops::canny_edges(gray, 50.0, 150.0);
        let lines = hough_lines(&edges, self.config.deskew_vote_threshold);
        if lines.len() < 2 {
            return None;
        }

        let mut angles: Vec<f64> = lines
            .iter()
            .take(DESKEW_LINES)
            .map(|line| {
                let mut angle = line.theta.to_degrees() - 90.0;
                if angle <= -45.0 {
                    angle += 90.0;
                } else if angle > 45.0 {
                    angle -= 90.0;
                }
                angle
            })
            .collect();
        angles.sort_by_key(|a| OrderedFloat(*a));

        let mid = angles.len() / 2;
        let median = if angles.len() % 2 == 0 {
            (angles[mid - 1] + angles[mid]) / 2.0
        } else {
            angles[mid]
        };
        Some(median)
    }

    pub fn deskew(&self, gray: &GrayImage) -> GrayImage {
        match self.estimate_skew(gray) {
            Some(angle) if angle.abs() >= self.config.deskew_min_angle_deg => {
                debug!("Deskewing by {:.2} degrees", angle);
                image_ops::rotate_white(gray, -angle)
            }
            _ => gray.clone(),
        }
    }

    /// Canny with Otsu-derived thresholds at three blur levels, OR'd together
    pub fn detect_edges(&self, preprocessed: &GrayImage) -> GrayImage {
        let t = image_ops::otsu(preprocessed) as f32;
        let (low, high) = (0.5 * t, 1.5 * t);

        let original = image_ops::canny_edges(preprocessed, low, high);
        let soft = image_ops::canny_edges(&image_ops::gaussian_blur(preprocessed, 1.0), low, high);
        let softer = image_ops::canny_edges(&image_ops::gaussian_blur(preprocessed, 1.5), low, high);
        image_ops::bitwise_or(&image_ops::bitwise_or(&original, &soft), &softer)
    }

    /// Dilate 3×3 twice, erode 2×2, close 3×3
    pub fn link_edges(edges: &GrayImage) -> GrayImage {
        let dilated = image_ops::dilate_rect(edges, 3, 3, 2);
        let eroded = image_ops::erode_rect(&dilated, 2, 2, 1);
        image_ops::close_rect(&eroded, 3, 3)
    }

    /// Geometry extraction on an already decoded image (no symbol pass)
    pub fn read_image(&self, gray: &GrayImage, legend: Option<&LegendData>) -> PlanData {
        let c = &self.config;
        let scale_ratio = legend
            .map(|l| l.scale_ratio)
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or(DEFAULT_SCALE_RATIO);

        let (width, height) = gray.dimensions();
        if width < MIN_SIDE_PX || height < MIN_SIDE_PX {
            warn!("Sketch is {}x{} px; nothing to read", width, height);
            return PlanData::empty(scale_ratio);
        }
        let gradient = image_ops::mean_gradient(gray);
        if gradient > c.max_mean_gradient {
            warn!(
                "Mean gradient {:.1} exceeds {:.1}; treating sketch as unreadable texture",
                gradient, c.max_mean_gradient
            );
            return PlanData::empty(scale_ratio);
        }

        let start = Instant::now();
        let preprocessed = self.preprocess(gray);
        let linked = Self::link_edges(&self.detect_edges(&preprocessed));
        debug!("Preprocessing and edges took {}ms", start.elapsed().as_millis());

        let coverage = image_ops::nonzero_fraction(&linked);
        if coverage > c.max_edge_coverage {
            warn!(
                "Edge coverage {:.2} exceeds {:.2}; treating sketch as unreadable texture",
                coverage, c.max_edge_coverage
            );
            return PlanData::empty(scale_ratio);
        }

        let start = Instant::now();
        let rooms = detect_rooms(&linked, scale_ratio, c);
        let segments = hough_lines_p(&linked, c.hough_threshold, c.min_line_length, c.max_line_gap);
        let walls = merge_wall_segments(&segments, scale_ratio, c).walls;
        let openings = detect_openings(&linked, &walls, scale_ratio, c);
        info!(
            "Detected {} rooms, {} walls, {} openings in {}ms",
            rooms.len(),
            walls.len(),
            openings.len(),
            start.elapsed().as_millis()
        );

        let confidence = plan_confidence(&rooms, &walls, &openings, legend);
        PlanData {
            rooms,
            walls,
            openings,
            symbols: Vec::new(),
            confidence,
            scale_ratio,
            symbol_metadata: Default::default(),
        }
    }
}

impl PlanReader for SketchReader {
    fn read_sketch(&self, image_path: &Path, legend: Option<&LegendData>) -> Result<PlanData, PipelineError> {
        let is_pdf = image_path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if is_pdf {
            return Err(PipelineError::InvalidImage(format!(
                "{}: PDF pages must be rasterised before reading",
                image_path.display()
            )));
        }

        let gray = image_ops::load_gray(image_path).map_err(|e| PipelineError::InvalidImage(format!("{:#}", e)))?;
        let mut plan = self.read_image(&gray, legend);

        let detection = detect_symbols(image_path, &self.symbols);
        plan.symbols = detection.symbols;
        plan.symbols.truncate(MAX_SYMBOLS);
        plan.symbol_metadata = detection.metadata;
        Ok(plan)
    }

    fn reader_type(&self) -> &str {
        "opencv"
    }
}

/// Weighted blend of five [0, 100] components: counts (0.4), feature quality
/// (0.3), spatial consistency (0.2), scale presence (0.05) and legend content
/// (0.05). Zero without rooms.
pub fn plan_confidence(rooms: &[Room], walls: &[Wall], openings: &[Opening], legend: Option<&LegendData>) -> f64 {
    if rooms.is_empty() {
        return 0.0;
    }

    let base = (rooms.len() as f64 * 15.0 + walls.len() as f64 * 0.3).min(100.0);

    let avg_area = rooms.iter().map(|r| r.area_meters).sum::<f64>() / rooms.len() as f64;
    let area_bucket = if (10.0..=50.0).contains(&avg_area) {
        15.0
    } else if (5.0..=100.0).contains(&avg_area) {
        10.0
    } else {
        0.0
    };
    let alignment = if walls.is_empty() {
        0.0
    } else {
        let aligned = walls
            .iter()
            .filter(|w| {
                let r = w.angle_deg.rem_euclid(90.0);
                r.min(90.0 - r) < 5.0
            })
            .count();
        aligned as f64 / walls.len() as f64
    };
    let quality = (area_bucket + 10.0 * alignment) * 4.0;

    let mut consistency = 0.0;
    if !walls.is_empty() {
        let near = rooms
            .iter()
            .filter(|room| walls.iter().any(|w| room.boundary_distance(&w.midpoint()) < 100.0))
            .count();
        consistency += 15.0 * near as f64 / rooms.len() as f64;

        if !openings.is_empty() {
            let on_walls = openings
                .iter()
                .filter(|o| walls.iter().any(|w| w.distance_to_point(&o.position) < 50.0))
                .count();
            consistency += 10.0 * on_walls as f64 / openings.len() as f64;
        }
    }
    let consistency = consistency * 4.0;

    let (scale, legend_score) = match legend {
        Some(l) => {
            let raw = if l.has_scale() { 10.0 } else { 0.0 }
                + if l.labels.is_empty() { 0.0 } else { 5.0 }
                + 30.0 * l.confidence;
            (100.0, (raw * 100.0 / 15.0).min(100.0))
        }
        None => (0.0, 0.0),
    };

    (base * 0.4 + quality * 0.3 + consistency * 0.2 + scale * 0.05 + legend_score * 0.05).clamp(0.0, 100.0)
}
