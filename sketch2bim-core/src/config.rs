use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use crate::error::PipelineError;

const ENV_PREFIX: &str = "SKETCH2BIM_";

/// Root configuration for one pipeline instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub legend: LegendConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub symbols: SymbolConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub limits: InputLimits,
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Gate thresholds and per-measure recommendation triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_pre_gate_threshold")]
    pub pre_gate_threshold: f64,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,
    #[serde(default = "default_post_ifc_threshold")]
    pub post_ifc_threshold: f64,
    pub max_post_ifc_warnings: usize,
    pub min_sharpness: f64,
    pub min_contrast: f64,
    pub max_noise: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub min_edge_density: f64,
    /// Minimum of width and height, in pixels
    pub min_resolution: u32,
    pub min_rooms: usize,
    pub min_walls: usize,
    pub min_geometry_coherence: f64,
    pub min_area_consistency: f64,
    pub min_connectivity: f64,
}

fn default_pre_gate_threshold() -> f64 {
    50.0
}

fn default_detection_threshold() -> f64 {
    30.0
}

fn default_post_ifc_threshold() -> f64 {
    50.0
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            pre_gate_threshold: default_pre_gate_threshold(),
            detection_threshold: default_detection_threshold(),
            post_ifc_threshold: default_post_ifc_threshold(),
            max_post_ifc_warnings: 10,
            min_sharpness: 30.0,
            min_contrast: 0.3,
            max_noise: 0.15,
            min_brightness: 0.2,
            max_brightness: 0.8,
            min_edge_density: 0.05,
            min_resolution: 500,
            min_rooms: 1,
            min_walls: 4,
            min_geometry_coherence: 0.5,
            min_area_consistency: 0.6,
            min_connectivity: 0.4,
        }
    }
}

/// Legend parsing and scale conventions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegendConfig {
    /// Pixels that represent one metre on the drawing sheet (`1:N` scales)
    #[serde(default = "default_pixels_per_drawing_metre")]
    pub pixels_per_drawing_metre: f64,
    /// DPI assumed for imperial scales
    #[serde(default = "default_assumed_dpi")]
    pub assumed_dpi: f64,
    #[serde(default = "default_scale_ratio")]
    pub default_scale_ratio: f64,
    /// Fraction of width and height covered by each candidate corner region
    pub region_fraction: f64,
    pub min_text_chars: usize,
    pub min_edge_density_with_ocr: f64,
    pub min_edge_density_without_ocr: f64,
    /// Executable used for OCR; None disables OCR
    pub tesseract_path: Option<String>,
}

fn default_pixels_per_drawing_metre() -> f64 {
    100.0
}

fn default_assumed_dpi() -> f64 {
    100.0
}

fn default_scale_ratio() -> f64 {
    0.01
}

impl Default for LegendConfig {
    fn default() -> Self {
        Self {
            pixels_per_drawing_metre: default_pixels_per_drawing_metre(),
            assumed_dpi: default_assumed_dpi(),
            default_scale_ratio: default_scale_ratio(),
            region_fraction: 0.3,
            min_text_chars: 20,
            min_edge_density_with_ocr: 0.05,
            min_edge_density_without_ocr: 0.10,
            tesseract_path: Some("tesseract".to_string()),
        }
    }
}

/// Sketch reader tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub nlm_h: f32,
    pub nlm_template_window: u32,
    pub nlm_search_window: u32,
    pub deskew_min_angle_deg: f64,
    pub deskew_vote_threshold: u32,
    /// Linked-edge coverage above which the raster is treated as texture
    #[serde(default = "default_max_edge_coverage")]
    pub max_edge_coverage: f64,
    /// Mean Sobel magnitude of the input above which it is treated as texture
    #[serde(default = "default_max_mean_gradient")]
    pub max_mean_gradient: f64,
    pub hough_threshold: u32,
    pub min_line_length: u32,
    pub max_line_gap: u32,
    pub merge_angle_deg: f64,
    pub merge_distance_px: f64,
    #[serde(default = "default_merge_max_gap")]
    pub merge_max_gap_px: f64,
    pub snap_tolerance_deg: f64,
    pub min_wall_length_m: f64,
    pub max_walls: usize,
    pub min_contour_area_px: f64,
    pub min_room_area_px: f64,
    pub min_solidity: f64,
    pub max_rooms: usize,
    pub max_openings: usize,
    pub opening_wall_distance_px: f64,
    pub opening_dedupe_distance_px: f64,
}

fn default_max_edge_coverage() -> f64 {
    0.35
}

fn default_max_mean_gradient() -> f64 {
    100.0
}

fn default_merge_max_gap() -> f64 {
    150.0
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            nlm_h: 10.0,
            nlm_template_window: 7,
            nlm_search_window: 21,
            deskew_min_angle_deg: 0.5,
            deskew_vote_threshold: 200,
            max_edge_coverage: default_max_edge_coverage(),
            max_mean_gradient: default_max_mean_gradient(),
            hough_threshold: 50,
            min_line_length: 50,
            max_line_gap: 10,
            merge_angle_deg: 5.0,
            merge_distance_px: 20.0,
            merge_max_gap_px: default_merge_max_gap(),
            snap_tolerance_deg: 10.0,
            min_wall_length_m: 0.5,
            max_walls: 100,
            min_contour_area_px: 1000.0,
            min_room_area_px: 5000.0,
            min_solidity: 0.7,
            max_rooms: 50,
            max_openings: 30,
            opening_wall_distance_px: 50.0,
            opening_dedupe_distance_px: 30.0,
        }
    }
}

/// Processing agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Where preprocessed intermediates are written; defaults to the system temp dir
    pub work_dir: Option<PathBuf>,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            work_dir: None,
        }
    }
}

/// Optional ML symbol detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub enabled: bool,
    /// External detector command; receives the image path as its last argument
    pub command: Option<String>,
    pub confidence_threshold: f64,
    pub max_results: usize,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            confidence_threshold: 0.45,
            max_results: 200,
        }
    }
}

/// Secondary artifact settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub preview_width: u32,
    pub preview_height: u32,
    pub preview_font_path: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            preview_width: 1920,
            preview_height: 1080,
            preview_font_path: None,
        }
    }
}

/// Checkpoint store selection; the first configured backend wins (Bunny, then local)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub local_dir: Option<PathBuf>,
    pub bunny_storage_zone: Option<String>,
    pub bunny_storage_region: Option<String>,
    pub bunny_access_key: Option<String>,
    pub bunny_cdn_host: Option<String>,
}

/// Upload contract enforced by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputLimits {
    pub max_upload_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub job_timeout_secs: u64,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_upload_mb: 50,
            allowed_extensions: vec!["png".into(), "jpg".into(), "jpeg".into(), "pdf".into()],
            job_timeout_secs: 300,
        }
    }
}

/// Optional checks of the generated IFC. Failures are reported, never fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// IDS document to validate against
    #[serde(default)]
    pub ids_path: Option<PathBuf>,
    /// Run the project rule engine
    #[serde(default)]
    pub rules_enabled: bool,
    /// JSON rule set merged over the built-in rules
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

impl PipelineConfig {
    /// Defaults overlaid with `SKETCH2BIM_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Overlay values from a lookup function keyed by full variable name
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        set_parsed(&mut self.agent.max_retries, "MAX_RETRIES", get("MAX_RETRIES"));
        set_parsed(&mut self.quality.detection_threshold, "DETECTION_THRESHOLD", get("DETECTION_THRESHOLD"));
        set_parsed(&mut self.quality.pre_gate_threshold, "PRE_GATE_THRESHOLD", get("PRE_GATE_THRESHOLD"));
        set_parsed(&mut self.quality.post_ifc_threshold, "POST_IFC_THRESHOLD", get("POST_IFC_THRESHOLD"));
        set_parsed(
            &mut self.legend.pixels_per_drawing_metre,
            "PIXELS_PER_DRAWING_METRE",
            get("PIXELS_PER_DRAWING_METRE"),
        );
        set_parsed(&mut self.legend.assumed_dpi, "ASSUMED_DPI", get("ASSUMED_DPI"));
        set_parsed(&mut self.symbols.enabled, "SYMBOL_DETECTOR_ENABLED", get("SYMBOL_DETECTOR_ENABLED"));
        set_parsed(
            &mut self.symbols.confidence_threshold,
            "SYMBOL_CONFIDENCE_THRESHOLD",
            get("SYMBOL_CONFIDENCE_THRESHOLD"),
        );
        set_parsed(&mut self.symbols.max_results, "SYMBOL_MAX_RESULTS", get("SYMBOL_MAX_RESULTS"));
        set_parsed(&mut self.limits.max_upload_mb, "MAX_UPLOAD_MB", get("MAX_UPLOAD_MB"));
        set_parsed(&mut self.limits.job_timeout_secs, "JOB_TIMEOUT_SECS", get("JOB_TIMEOUT_SECS"));

        if let Some(cmd) = get("SYMBOL_DETECTOR_COMMAND") {
            self.symbols.command = Some(cmd);
        }
        if let Some(path) = get("TESSERACT_PATH") {
            self.legend.tesseract_path = if path.is_empty() { None } else { Some(path) };
        }
        if let Some(path) = get("PREVIEW_FONT_PATH") {
            self.export.preview_font_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = get("CHECKPOINT_DIR") {
            self.checkpoint.local_dir = Some(PathBuf::from(dir));
        }
        if let Some(zone) = get("BUNNY_STORAGE_ZONE") {
            self.checkpoint.bunny_storage_zone = Some(zone);
        }
        if let Some(region) = get("BUNNY_STORAGE_REGION") {
            self.checkpoint.bunny_storage_region = Some(region);
        }
        if let Some(key) = get("BUNNY_ACCESS_KEY") {
            self.checkpoint.bunny_access_key = Some(key);
        }
        if let Some(host) = get("BUNNY_CDN_HOST") {
            self.checkpoint.bunny_cdn_host = Some(host);
        }
        set_parsed(&mut self.validation.rules_enabled, "RULES_ENABLED", get("RULES_ENABLED"));
        if let Some(path) = get("IDS_PATH") {
            self.validation.ids_path = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        if let Some(path) = get("RULES_PATH") {
            self.validation.rules_path = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, name: &str, value: Option<String>) {
    let Some(raw) = value else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("Ignoring {}{}={:?}: not a valid value", ENV_PREFIX, name, raw),
    }
}

/// Upload contract check: file exists, fits the size cap, has a permitted extension
pub fn validate_input(path: &Path, limits: &InputLimits) -> Result<(), PipelineError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| PipelineError::InvalidImage(format!("{}: {}", path.display(), e)))?;
    if !metadata.is_file() {
        return Err(PipelineError::InvalidImage(format!("{} is not a file", path.display())));
    }

    let max_bytes = limits.max_upload_mb * 1024 * 1024;
    if metadata.len() > max_bytes {
        return Err(PipelineError::InvalidImage(format!(
            "{} is {} bytes, limit is {} MB",
            path.display(),
            metadata.len(),
            limits.max_upload_mb
        )));
    }

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if !limits.allowed_extensions.iter().any(|allowed| *allowed == extension) {
        return Err(PipelineError::InvalidImage(format!(
            "Extension '{}' is not one of {:?}",
            extension, limits.allowed_extensions
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.agent.max_retries, 2);
        assert_eq!(config.quality.detection_threshold, 30.0);
        assert_eq!(config.quality.pre_gate_threshold, 50.0);
        assert_eq!(config.legend.pixels_per_drawing_metre, 100.0);
        assert_eq!(config.legend.default_scale_ratio, 0.01);
        assert!(!config.symbols.enabled);
        assert_eq!(config.symbols.max_results, 200);
        assert_eq!(config.limits.max_upload_mb, 50);
        assert_eq!(config.limits.job_timeout_secs, 300);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("SKETCH2BIM_MAX_RETRIES", "5"),
            ("SKETCH2BIM_DETECTION_THRESHOLD", "25.5"),
            ("SKETCH2BIM_SYMBOL_DETECTOR_ENABLED", "true"),
            ("SKETCH2BIM_PIXELS_PER_DRAWING_METRE", "not-a-number"),
            ("SKETCH2BIM_CHECKPOINT_DIR", "/tmp/ckpt"),
            ("SKETCH2BIM_IDS_PATH", "/etc/sketch2bim/delivery.ids"),
            ("SKETCH2BIM_RULES_ENABLED", "true"),
            ("SKETCH2BIM_RULES_PATH", ""),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.agent.max_retries, 5);
        assert_eq!(config.quality.detection_threshold, 25.5);
        assert!(config.symbols.enabled);
        // Unparseable values leave the default in place
        assert_eq!(config.legend.pixels_per_drawing_metre, 100.0);
        assert_eq!(config.checkpoint.local_dir, Some(PathBuf::from("/tmp/ckpt")));
        assert_eq!(config.validation.ids_path, Some(PathBuf::from("/etc/sketch2bim/delivery.ids")));
        assert!(config.validation.rules_enabled);
        assert!(config.validation.rules_path.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"agent": {"max_retries": 1}, "reader": {}}"#;
        let parsed: Result<PipelineConfig, _> = serde_json::from_str(json);
        // Nested structs without defaults on every field must be complete
        assert!(parsed.is_err());

        let json = r#"{"agent": {"max_retries": 1}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.agent.max_retries, 1);
        assert_eq!(config.quality.min_walls, 4);
    }

    #[test]
    fn test_validate_input() {
        let dir = std::env::temp_dir().join(format!("sketch2bim_cfg_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("plan.PNG");
        std::fs::write(&good, b"data").unwrap();
        assert!(validate_input(&good, &InputLimits::default()).is_ok());

        let bad_ext = dir.join("plan.gif");
        std::fs::write(&bad_ext, b"data").unwrap();
        let err = validate_input(&bad_ext, &InputLimits::default()).unwrap_err();
        assert_eq!(err.kind(), "invalid_image");

        let missing = dir.join("missing.png");
        assert!(validate_input(&missing, &InputLimits::default()).is_err());

        let limits = InputLimits {
            max_upload_mb: 0,
            ..InputLimits::default()
        };
        assert!(validate_input(&good, &limits).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
