use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::config::QualityConfig;
use crate::error::PipelineError;
use crate::ifc_validator::QcReport;
use crate::image_ops;
use crate::plan::PlanData;

/// Image-level quality measures (gate 1)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SketchQualityMetrics {
    /// Laplacian variance
    pub sharpness: f64,
    /// σ / 255
    pub contrast: f64,
    pub noise: f64,
    /// Mean intensity / 255
    pub brightness: f64,
    pub edge_density: f64,
    /// min(width, height) / 1000
    pub resolution: f64,
    /// 0–100
    pub overall: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Geometry-level quality measures (gate 2)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub room_count: usize,
    pub wall_count: usize,
    pub opening_count: usize,
    pub geometry_coherence: f64,
    pub area_consistency: f64,
    pub connectivity_score: f64,
    /// Plan confidence, 0–100
    pub confidence: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Summary of a QC report as seen by gate 3
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IfcGateMetrics {
    pub confidence: f64,
    pub critical_errors: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum GateMetrics {
    Sketch(SketchQualityMetrics),
    Detection(DetectionMetrics),
    Ifc(IfcGateMetrics),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub confidence: f64,
    pub metrics: GateMetrics,
    pub threshold_used: f64,
    pub message: String,
    pub recommendations: Vec<String>,
    /// Set when the gate could not evaluate its input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every gate that had input, plus the blended confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateReport {
    pub pre_processing: GateResult,
    pub detection: Option<GateResult>,
    pub post_ifc: Option<GateResult>,
    pub overall_confidence: f64,
    pub all_passed: bool,
}

/// Runs the three quality gates with configurable thresholds
#[derive(Debug, Clone, Default)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Decode `image_path` and measure it
    pub fn assess_sketch_quality(&self, image_path: &Path) -> Result<SketchQualityMetrics, PipelineError> {
        let gray = image_ops::load_gray(image_path)
            .map_err(|e| PipelineError::AssessmentFailure(format!("{:#}", e)))?;
        Ok(self.assess_image(&gray))
    }

    pub fn assess_image(&self, gray: &GrayImage) -> SketchQualityMetrics {
        let c = &self.config;
        let mut metrics = SketchQualityMetrics::default();
        let (width, height) = gray.dimensions();
        let (mean, std) = image_ops::mean_std(gray);

        metrics.sharpness = image_ops::laplacian_variance(gray);
        metrics.contrast = std / 255.0;
        metrics.noise = image_ops::median_noise(gray);
        metrics.brightness = mean / 255.0;
        metrics.edge_density = image_ops::nonzero_fraction(&image_ops::canny_edges(gray, 50.0, 150.0));
        let min_dimension = width.min(height);
        metrics.resolution = min_dimension as f64 / 1000.0;

        let mut flag = |issue: &str, recommendation: &str| {
            metrics.issues.push(issue.to_string());
            metrics.recommendations.push(recommendation.to_string());
        };
        if metrics.sharpness < c.min_sharpness {
            flag("Low sharpness detected", "Apply sharpening filter before processing");
        }
        if metrics.contrast < c.min_contrast {
            flag("Low contrast", "Enhance contrast using CLAHE");
        }
        if metrics.noise > c.max_noise {
            flag("High noise level", "Apply denoising filter");
        }
        if metrics.brightness < c.min_brightness {
            flag("Image too dark", "Brighten image before processing");
        } else if metrics.brightness > c.max_brightness {
            flag("Image too bright", "Darken image before processing");
        }
        if metrics.edge_density < c.min_edge_density {
            flag("Low edge density", "Verify sketch contains sufficient detail");
        }
        if min_dimension < c.min_resolution {
            flag("Low resolution", "Use higher resolution image if available");
        }

        let sharpness_norm = (metrics.sharpness / 100.0).clamp(0.0, 1.0);
        let contrast_norm = (metrics.contrast / 0.5).clamp(0.0, 1.0);
        let noise_norm = 1.0 - (metrics.noise / 0.2).clamp(0.0, 1.0);
        let brightness_norm = (1.0 - (metrics.brightness - 0.5).abs() * 2.0).clamp(0.0, 1.0);
        let edge_norm = (metrics.edge_density / 0.1).clamp(0.0, 1.0);
        let resolution_norm = metrics.resolution.clamp(0.0, 1.0);

        metrics.overall = (0.25 * sharpness_norm
            + 0.25 * contrast_norm
            + 0.20 * noise_norm
            + 0.10 * brightness_norm
            + 0.15 * edge_norm
            + 0.05 * resolution_norm)
            * 100.0;

        info!("Sketch quality assessment: {:.1}/100", metrics.overall);
        metrics
    }

    pub fn assess_detection_quality(&self, plan: &PlanData) -> DetectionMetrics {
        let c = &self.config;
        let mut metrics = DetectionMetrics {
            room_count: plan.rooms.len(),
            wall_count: plan.walls.len(),
            opening_count: plan.openings.len(),
            confidence: plan.confidence,
            ..Default::default()
        };

        if metrics.room_count < c.min_rooms {
            metrics.issues.push("No rooms detected".to_string());
            metrics.recommendations.push("Check sketch for closed room boundaries".to_string());
        }
        if metrics.wall_count < c.min_walls {
            metrics.issues.push("Insufficient walls detected".to_string());
            metrics.recommendations.push("Verify wall lines are clear and continuous".to_string());
        }

        let areas: Vec<f64> = plan.rooms.iter().map(|r| r.area_meters).filter(|a| *a > 0.0).collect();
        if !areas.is_empty() {
            let n = areas.len() as f64;
            let mean = areas.iter().sum::<f64>() / n;
            let std = (areas.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n).sqrt();
            let cv = if mean > 0.0 { std / mean } else { 1.0 };
            metrics.area_consistency = (1.0 - cv).max(0.0);
            if metrics.area_consistency < c.min_area_consistency {
                metrics.issues.push("Inconsistent room areas".to_string());
            }

            let unreasonable = areas.iter().filter(|a| **a < 3.0 || **a > 100.0).count();
            if unreasonable > 0 {
                metrics
                    .issues
                    .push(format!("Some rooms have unreasonable sizes ({} outside 3-100 m²)", unreasonable));
                metrics.recommendations.push("Verify scale ratio is correct".to_string());
            }
        }

        metrics.connectivity_score = connectivity(plan);
        if metrics.connectivity_score < c.min_connectivity {
            metrics.issues.push("Openings not connected to walls".to_string());
        }

        let mut factors = Vec::new();
        if metrics.wall_count > 0 {
            let ratio = metrics.room_count as f64 / metrics.wall_count as f64;
            factors.push(if (0.1..=0.5).contains(&ratio) { 1.0 } else { 0.5 });
        }
        if metrics.room_count > 0 {
            let ratio = metrics.opening_count as f64 / metrics.room_count as f64;
            factors.push(if (0.5..=3.0).contains(&ratio) { 1.0 } else { 0.7 });
        }
        metrics.geometry_coherence = if factors.is_empty() {
            0.0
        } else {
            factors.iter().sum::<f64>() / factors.len() as f64
        };

        if metrics.confidence < c.detection_threshold {
            metrics.issues.push(format!("Low detection confidence ({:.1}%)", metrics.confidence));
            metrics
                .recommendations
                .push("Consider retrying with enhanced preprocessing".to_string());
        }
        if metrics.geometry_coherence < c.min_geometry_coherence {
            metrics.issues.push(format!("Low geometry coherence ({:.2})", metrics.geometry_coherence));
            metrics.recommendations.push("Review detected geometry for consistency".to_string());
        }

        info!(
            "Detection quality: confidence={:.1}%, coherence={:.2}",
            metrics.confidence, metrics.geometry_coherence
        );
        metrics
    }

    /// Gate 1. An undecodable image yields a failed gate carrying the error.
    pub fn pre_processing_gate(&self, image_path: &Path, threshold: Option<f64>) -> GateResult {
        let threshold_used = threshold.unwrap_or(self.config.pre_gate_threshold);
        match self.assess_sketch_quality(image_path) {
            Ok(metrics) => self.pre_processing_gate_from(metrics, threshold_used),
            Err(e) => {
                warn!("Pre-processing gate could not assess {}: {}", image_path.display(), e);
                let metrics = SketchQualityMetrics {
                    issues: vec!["Failed to load image".to_string()],
                    ..Default::default()
                };
                GateResult {
                    passed: false,
                    confidence: 0.0,
                    metrics: GateMetrics::Sketch(metrics),
                    threshold_used,
                    message: format!("Assessment error: {}", e),
                    recommendations: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn pre_processing_gate_from(&self, metrics: SketchQualityMetrics, threshold_used: f64) -> GateResult {
        let passed = metrics.overall >= threshold_used;
        let mut message = format!("Pre-processing gate: {:.1}/100", metrics.overall);
        if !passed {
            message.push_str(&format!(" (threshold: {:.1})", threshold_used));
        }
        GateResult {
            passed,
            confidence: metrics.overall,
            recommendations: metrics.recommendations.clone(),
            metrics: GateMetrics::Sketch(metrics),
            threshold_used,
            message,
            error: None,
        }
    }

    /// Gate 2: `0.5·confidence + 30·coherence + 20·rooms_ok` against the threshold
    pub fn detection_gate(&self, plan: &PlanData, threshold: Option<f64>) -> GateResult {
        let threshold_used = threshold.unwrap_or(self.config.detection_threshold);
        let metrics = self.assess_detection_quality(plan);
        let rooms_ok = if metrics.room_count >= self.config.min_rooms { 1.0 } else { 0.0 };
        let score = metrics.confidence * 0.5 + metrics.geometry_coherence * 100.0 * 0.3 + rooms_ok * 100.0 * 0.2;
        let passed = score >= threshold_used;

        GateResult {
            passed,
            confidence: score,
            message: format!(
                "Detection gate: {:.1}/100 (confidence: {:.1}%, coherence: {:.2})",
                score, metrics.confidence, metrics.geometry_coherence
            ),
            recommendations: metrics.recommendations.clone(),
            metrics: GateMetrics::Detection(metrics),
            threshold_used,
            error: None,
        }
    }

    /// Gate 3: QC confidence, critical errors and warning count
    pub fn post_ifc_gate(&self, report: &QcReport) -> GateResult {
        let c = &self.config;
        let critical = report.critical_count();
        let warnings = report.warnings.len();
        let confidence = report.confidence;
        let passed = confidence >= c.post_ifc_threshold && critical == 0 && warnings <= c.max_post_ifc_warnings;

        let mut recommendations = Vec::new();
        if !passed {
            if confidence < c.post_ifc_threshold {
                recommendations.push(format!("IFC confidence ({:.1}%) below threshold", confidence));
            }
            if critical > 0 {
                recommendations.push(format!("Too many critical errors ({})", critical));
            }
            if warnings > c.max_post_ifc_warnings {
                recommendations.push(format!("Too many warnings ({})", warnings));
            }
        }
        recommendations.extend(report.recommendations.iter().cloned());

        GateResult {
            passed,
            confidence,
            metrics: GateMetrics::Ifc(IfcGateMetrics {
                confidence,
                critical_errors: critical,
                warnings,
            }),
            threshold_used: c.post_ifc_threshold,
            message: format!(
                "IFC quality: {:.1}% confidence, {} errors, {} warnings",
                confidence, critical, warnings
            ),
            recommendations,
            error: None,
        }
    }

    /// Run whichever gates have input
    pub fn run_quality_gates(
        &self,
        image_path: &Path,
        plan: Option<&PlanData>,
        report: Option<&QcReport>,
    ) -> QualityGateReport {
        let pre_processing = self.pre_processing_gate(image_path, None);
        let detection = plan.map(|p| self.detection_gate(p, None));
        let post_ifc = report.map(|r| self.post_ifc_gate(r));

        let sketch_score = match &pre_processing.metrics {
            GateMetrics::Sketch(m) => m.overall,
            _ => 0.0,
        };
        let overall = overall_confidence(
            sketch_score,
            plan.map(|p| p.confidence).unwrap_or(0.0),
            report.map(|r| r.confidence).unwrap_or(0.0),
        );
        let all_passed = pre_processing.passed
            && detection.as_ref().map(|g| g.passed).unwrap_or(true)
            && post_ifc.as_ref().map(|g| g.passed).unwrap_or(true);

        QualityGateReport {
            pre_processing,
            detection,
            post_ifc,
            overall_confidence: overall,
            all_passed,
        }
    }
}

/// `0.20·sketch + 0.50·detection + 0.30·ifc`
pub fn overall_confidence(sketch: f64, detection: f64, ifc: f64) -> f64 {
    0.20 * sketch + 0.50 * detection + 0.30 * ifc
}

/// Fraction of openings within 50 px of an endpoint of one of the first ten walls
fn connectivity(plan: &PlanData) -> f64 {
    if plan.openings.is_empty() {
        return 1.0;
    }
    if plan.walls.is_empty() {
        return 0.0;
    }
    let connected = plan
        .openings
        .iter()
        .filter(|o| {
            plan.walls
                .iter()
                .take(10)
                .any(|w| w.nearest_endpoint_distance(&o.position) < 50.0)
        })
        .count();
    connected as f64 / plan.openings.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifc_validator::{IssueCategory, IssueSeverity, QcIssue};
    use crate::plan::{Opening, OpeningMethod, OpeningType, Point, Room, RoomType, Wall};
    use image::Luma;

    fn create_wall(x1: f64, y1: f64, x2: f64, y2: f64) -> Wall {
        Wall::new(Point::new(x1, y1), Point::new(x2, y2), 0.01)
    }

    fn square_room(size: f64, scale: f64) -> Room {
        Room {
            id: 0,
            polygon: vec![
                Point::new(0.0, 0.0),
                Point::new(size, 0.0),
                Point::new(size, size),
                Point::new(0.0, size),
            ],
            area_pixels: size * size,
            area_meters: size * size * scale * scale,
            room_type: RoomType::Living,
            is_nested: false,
            aspect_ratio: 1.0,
            solidity: 1.0,
            classification_confidence: None,
            classification_method: None,
            classification_reasoning: None,
        }
    }

    fn single_room_plan(confidence: f64) -> PlanData {
        let mut plan = PlanData::empty(0.01);
        plan.rooms.push(square_room(800.0, 0.01));
        plan.walls = vec![
            create_wall(100.0, 100.0, 900.0, 100.0),
            create_wall(900.0, 100.0, 900.0, 900.0),
            create_wall(900.0, 900.0, 100.0, 900.0),
            create_wall(100.0, 900.0, 100.0, 100.0),
        ];
        plan.confidence = confidence;
        plan
    }

    #[test]
    fn test_blank_image_fails_pre_gate() {
        let assessor = QualityAssessor::default();
        let blank = GrayImage::from_pixel(600, 600, Luma([255]));
        let metrics = assessor.assess_image(&blank);

        assert_eq!(metrics.sharpness, 0.0);
        assert_eq!(metrics.contrast, 0.0);
        assert_eq!(metrics.edge_density, 0.0);
        assert!((metrics.brightness - 1.0).abs() < 1e-12);
        // Only the noise and resolution terms contribute
        assert!((metrics.overall - 23.0).abs() < 1e-6);
        assert!(metrics.issues.contains(&"Low sharpness detected".to_string()));
        assert!(metrics.issues.contains(&"Image too bright".to_string()));
        assert!(metrics.recommendations.contains(&"Enhance contrast using CLAHE".to_string()));
        assert!(!metrics.issues.contains(&"Low resolution".to_string()));

        let gate = assessor.pre_processing_gate_from(metrics, 50.0);
        assert!(!gate.passed);
        assert!(gate.message.contains("threshold: 50.0"));
    }

    #[test]
    fn test_dark_small_image_flags() {
        let assessor = QualityAssessor::default();
        let dark = GrayImage::from_pixel(300, 200, Luma([20]));
        let metrics = assessor.assess_image(&dark);
        assert!(metrics.issues.contains(&"Image too dark".to_string()));
        assert!(metrics.issues.contains(&"Low resolution".to_string()));
        assert!((metrics.resolution - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_undecodable_image_fails_gate_with_error() {
        let dir = std::env::temp_dir().join(format!("sketch2bim_qa_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();

        let assessor = QualityAssessor::default();
        assert!(matches!(
            assessor.assess_sketch_quality(&path),
            Err(PipelineError::AssessmentFailure(_))
        ));
        let gate = assessor.pre_processing_gate(&path, None);
        assert!(!gate.passed);
        assert_eq!(gate.confidence, 0.0);
        assert!(gate.error.is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_detection_gate_single_room() {
        let assessor = QualityAssessor::default();
        let gate = assessor.detection_gate(&single_room_plan(47.5), None);
        // coherence: walls ratio 0.25 → 1.0, no openings → 0.7
        let GateMetrics::Detection(metrics) = &gate.metrics else {
            panic!("expected detection metrics");
        };
        assert!((metrics.geometry_coherence - 0.85).abs() < 1e-9);
        assert_eq!(metrics.connectivity_score, 1.0);
        assert!((gate.confidence - 69.25).abs() < 1e-9);
        assert!(gate.passed);
        assert_eq!(gate.threshold_used, 30.0);
    }

    #[test]
    fn test_detection_gate_empty_plan() {
        let assessor = QualityAssessor::default();
        let gate = assessor.detection_gate(&PlanData::empty(0.01), None);
        assert!(!gate.passed);
        assert_eq!(gate.confidence, 0.0);
        let GateMetrics::Detection(metrics) = &gate.metrics else {
            panic!("expected detection metrics");
        };
        assert!(metrics.issues.contains(&"No rooms detected".to_string()));
        assert!(metrics.issues.contains(&"Insufficient walls detected".to_string()));
        assert_eq!(metrics.geometry_coherence, 0.0);
    }

    #[test]
    fn test_detection_gate_is_deterministic() {
        let assessor = QualityAssessor::default();
        let plan = single_room_plan(35.0);
        assert_eq!(assessor.detection_gate(&plan, Some(40.0)), assessor.detection_gate(&plan, Some(40.0)));
    }

    #[test]
    fn test_connectivity_uses_wall_endpoints() {
        let mut plan = single_room_plan(50.0);
        plan.openings = vec![
            Opening {
                opening_type: OpeningType::Door,
                position: Point::new(120.0, 100.0),
                width_meters: 0.9,
                method: OpeningMethod::Gap,
            },
            Opening {
                opening_type: OpeningType::Door,
                position: Point::new(500.0, 100.0),
                width_meters: 0.9,
                method: OpeningMethod::Gap,
            },
        ];
        let metrics = QualityAssessor::default().assess_detection_quality(&plan);
        // The mid-wall opening is on a wall but far from any endpoint
        assert!((metrics.connectivity_score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_unreasonable_areas_flagged() {
        let mut plan = single_room_plan(50.0);
        plan.rooms.push(square_room(100.0, 0.01));
        let metrics = QualityAssessor::default().assess_detection_quality(&plan);
        assert!(metrics.issues.iter().any(|i| i.starts_with("Some rooms have unreasonable sizes")));
        assert!(metrics.recommendations.contains(&"Verify scale ratio is correct".to_string()));
        assert!(metrics.issues.contains(&"Inconsistent room areas".to_string()));
    }

    #[test]
    fn test_post_ifc_gate() {
        let assessor = QualityAssessor::default();
        let mut report = QcReport::empty("IFC4");
        report.confidence = 90.0;
        assert!(assessor.post_ifc_gate(&report).passed);

        report.errors.push(QcIssue::new(IssueSeverity::Critical, IssueCategory::Geometry, "No walls found"));
        let gate = assessor.post_ifc_gate(&report);
        assert!(!gate.passed);
        assert!(gate.recommendations.contains(&"Too many critical errors (1)".to_string()));

        let mut noisy = QcReport::empty("IFC4");
        noisy.confidence = 60.0;
        for _ in 0..11 {
            noisy.warnings.push(QcIssue::new(IssueSeverity::Warning, IssueCategory::Topology, "w"));
        }
        assert!(!assessor.post_ifc_gate(&noisy).passed);
    }

    #[test]
    fn test_overall_confidence_weights() {
        assert!((overall_confidence(50.0, 60.0, 70.0) - 61.0).abs() < 1e-9);
    }
}
