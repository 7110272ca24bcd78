//! Symbol detector interface for optional ML inference
//!
//! Detection runs in an external process (any command that prints the JSON
//! shape below for an image path). The detector is created once per process
//! and shared; when it is disabled or missing, readers get an empty result.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::SymbolConfig;
use crate::plan::{Symbol, SymbolCategory, SymbolMetadata};

/// Symbols found in one image
#[derive(Debug, Clone, Default)]
pub struct SymbolDetection {
    pub symbols: Vec<Symbol>,
    pub metadata: SymbolMetadata,
}

impl SymbolDetection {
    fn disabled(reason: &str) -> Self {
        Self {
            symbols: Vec::new(),
            metadata: SymbolMetadata {
                enabled: false,
                reason: Some(reason.to_string()),
                inference_ms: None,
            },
        }
    }
}

/// Symbol detector trait - allows for different implementations
pub trait SymbolDetector: Send + Sync {
    fn detect(&self, image_path: &Path) -> Result<SymbolDetection>;

    fn model_info(&self) -> String;
}

/// Known symbol classes
#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub category: SymbolCategory,
    pub ifc_type: Option<&'static str>,
}

const CLASS_MAP: &[(&str, &str, &str, Option<&str>)] = &[
    ("door", "Door", "architectural_core", Some("IfcDoor")),
    ("window", "Window", "architectural_core", Some("IfcWindow")),
    ("wall", "Wall", "architectural_core", Some("IfcWall")),
    ("column", "Column", "architectural_core", Some("IfcColumn")),
    ("stair", "Stair", "architectural_core", Some("IfcStair")),
    ("bed", "Bed", "interior_furniture", Some("IfcFurnishingElement")),
    ("sofa", "Sofa", "interior_furniture", Some("IfcFurnishingElement")),
    ("table", "Table", "interior_furniture", Some("IfcFurnishingElement")),
    ("chair", "Chair", "interior_furniture", Some("IfcFurnishingElement")),
    ("wardrobe", "Wardrobe", "interior_furniture", Some("IfcFurnishingElement")),
    ("toilet", "Toilet", "mep_systems", Some("IfcSanitaryTerminal")),
    ("sink", "Sink", "mep_systems", Some("IfcSanitaryTerminal")),
    ("bathtub", "Bathtub", "mep_systems", Some("IfcSanitaryTerminal")),
    ("shower", "Shower", "mep_systems", Some("IfcSanitaryTerminal")),
    ("stove", "Stove", "mep_systems", Some("IfcElectricAppliance")),
    ("refrigerator", "Refrigerator", "mep_systems", Some("IfcElectricAppliance")),
    ("washer", "Washer", "mep_systems", Some("IfcElectricAppliance")),
    ("beam", "Beam", "structural", Some("IfcBeam")),
    ("column_structural", "Structural Column", "structural", Some("IfcColumn")),
    ("dimension", "Dimension", "annotations", Some("IfcAnnotation")),
    ("label", "Label", "annotations", Some("IfcAnnotation")),
    ("north_arrow", "North Arrow", "annotations", Some("IfcAnnotation")),
];

pub fn class_info(label: &str) -> Option<ClassInfo> {
    let key = label.trim().to_lowercase();
    CLASS_MAP
        .iter()
        .find(|(id, ..)| *id == key)
        .map(|&(id, name, category, ifc_type)| ClassInfo {
            id,
            name,
            category: SymbolCategory::from(category.to_string()),
            ifc_type,
        })
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    label: String,
    bbox: [f64; 4],
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    symbols: Vec<RawDetection>,
    #[serde(default)]
    inference_ms: Option<f64>,
}

/// Detector backed by an external command; the image path is appended as
/// the last argument and JSON `{symbols: [{label, bbox, confidence}], inference_ms}`
/// is read from stdout
pub struct CommandSymbolDetector {
    program: String,
    args: Vec<String>,
    confidence_threshold: f64,
    max_results: usize,
}

impl CommandSymbolDetector {
    pub fn new(command: &str, confidence_threshold: f64, max_results: usize) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().context("Symbol detector command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
            confidence_threshold,
            max_results,
        })
    }

    fn convert(&self, output: RawOutput, elapsed_ms: u64) -> SymbolDetection {
        let mut symbols = Vec::new();
        for raw in output.symbols {
            if raw.confidence < self.confidence_threshold {
                continue;
            }
            let Some(meta) = class_info(&raw.label) else {
                continue;
            };
            let [x1, y1, x2, y2] = raw.bbox;
            symbols.push(Symbol {
                bbox: raw.bbox,
                label: meta.id.to_string(),
                display_name: meta.name.to_string(),
                category: meta.category,
                confidence: raw.confidence,
                area_pixels: ((x2 - x1) * (y2 - y1)).abs(),
                source: "ml_detector".to_string(),
                ifc_type: meta.ifc_type.map(str::to_string),
            });
            if symbols.len() >= self.max_results {
                break;
            }
        }

        SymbolDetection {
            symbols,
            metadata: SymbolMetadata {
                enabled: true,
                reason: None,
                inference_ms: Some(output.inference_ms.map(|ms| ms as u64).unwrap_or(elapsed_ms)),
            },
        }
    }
}

impl SymbolDetector for CommandSymbolDetector {
    fn detect(&self, image_path: &Path) -> Result<SymbolDetection> {
        let start = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .output()
            .with_context(|| format!("Failed to run symbol detector {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!("Symbol detector exited with {}", output.status);
        }
        let raw: RawOutput =
            serde_json::from_slice(&output.stdout).context("Symbol detector printed invalid JSON")?;
        Ok(self.convert(raw, start.elapsed().as_millis() as u64))
    }

    fn model_info(&self) -> String {
        format!("Command symbol detector ({})", self.program)
    }
}

/// Stub implementation for when no detector is configured
pub struct StubSymbolDetector;

impl SymbolDetector for StubSymbolDetector {
    fn detect(&self, _image_path: &Path) -> Result<SymbolDetection> {
        Err(anyhow::anyhow!("Symbol detector not available. Configure a detector command."))
    }

    fn model_info(&self) -> String {
        "Stub symbol detector".to_string()
    }
}

/// Process-wide detector slot
#[derive(Clone)]
pub enum DetectorSlot {
    Uninitialised,
    Failed(String),
    Ready(Arc<dyn SymbolDetector>),
}

static DETECTOR: OnceLock<DetectorSlot> = OnceLock::new();

fn build_slot(config: &SymbolConfig) -> DetectorSlot {
    let Some(command) = config.command.as_deref() else {
        warn!("Symbol detector enabled but no command configured; geometry-only output");
        return DetectorSlot::Failed("model_unavailable".to_string());
    };
    match CommandSymbolDetector::new(command, config.confidence_threshold, config.max_results) {
        Ok(detector) => {
            info!("Symbol detector ready: {}", detector.model_info());
            DetectorSlot::Ready(Arc::new(detector))
        }
        Err(e) => {
            warn!("Symbol detector failed to initialise: {:#}", e);
            DetectorSlot::Failed("model_unavailable".to_string())
        }
    }
}

/// Current state of the shared detector without initialising it
pub fn detector_state() -> DetectorSlot {
    DETECTOR.get().cloned().unwrap_or(DetectorSlot::Uninitialised)
}

/// Run the shared detector, initialising it on first use
pub fn detect_symbols(image_path: &Path, config: &SymbolConfig) -> SymbolDetection {
    if !config.enabled {
        return SymbolDetection::disabled("disabled");
    }
    match DETECTOR.get_or_init(|| build_slot(config)) {
        DetectorSlot::Ready(detector) => run_detector(detector.as_ref(), image_path),
        DetectorSlot::Failed(reason) => SymbolDetection::disabled(reason),
        DetectorSlot::Uninitialised => SymbolDetection::disabled("uninitialised"),
    }
}

/// Run a specific detector; errors become an empty, disabled result
pub fn run_detector(detector: &dyn SymbolDetector, image_path: &Path) -> SymbolDetection {
    match detector.detect(image_path) {
        Ok(detection) => detection,
        Err(e) => {
            warn!("Symbol detection failed: {:#}", e);
            SymbolDetection::disabled("error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> CommandSymbolDetector {
        CommandSymbolDetector::new("detect-symbols --fast", 0.45, 2).unwrap()
    }

    #[test]
    fn test_class_map_lookup() {
        let sofa = class_info("Sofa").unwrap();
        assert_eq!(sofa.category, SymbolCategory::InteriorFurniture);
        assert_eq!(sofa.ifc_type, Some("IfcFurnishingElement"));
        assert_eq!(class_info("toilet").unwrap().category, SymbolCategory::MepSystems);
        assert!(class_info("spaceship").is_none());
    }

    #[test]
    fn test_command_parsing() {
        let d = detector();
        assert_eq!(d.program, "detect-symbols");
        assert_eq!(d.args, vec!["--fast".to_string()]);
        assert!(CommandSymbolDetector::new("   ", 0.5, 10).is_err());
    }

    #[test]
    fn test_convert_filters_and_caps() {
        let raw: RawOutput = serde_json::from_str(
            r#"{"symbols": [
                {"label": "bed", "bbox": [0, 0, 10, 20], "confidence": 0.9},
                {"label": "sofa", "bbox": [0, 0, 5, 5], "confidence": 0.2},
                {"label": "unknown_thing", "bbox": [0, 0, 5, 5], "confidence": 0.9},
                {"label": "sink", "bbox": [1, 1, 3, 3], "confidence": 0.8},
                {"label": "chair", "bbox": [1, 1, 3, 3], "confidence": 0.8}
            ], "inference_ms": 12.5}"#,
        )
        .unwrap();
        let detection = detector().convert(raw, 99);
        assert_eq!(detection.symbols.len(), 2);
        assert_eq!(detection.symbols[0].label, "bed");
        assert_eq!(detection.symbols[0].area_pixels, 200.0);
        assert_eq!(detection.symbols[0].source, "ml_detector");
        assert_eq!(detection.symbols[1].label, "sink");
        assert!(detection.metadata.enabled);
        assert_eq!(detection.metadata.inference_ms, Some(12));
    }

    #[test]
    fn test_stub_degrades_to_empty() {
        let detection = run_detector(&StubSymbolDetector, Path::new("plan.png"));
        assert!(detection.symbols.is_empty());
        assert!(!detection.metadata.enabled);
        assert_eq!(detection.metadata.reason.as_deref(), Some("error"));
    }

    #[test]
    fn test_disabled_config_skips_detector() {
        let detection = detect_symbols(Path::new("plan.png"), &SymbolConfig::default());
        assert!(!detection.metadata.enabled);
        assert_eq!(detection.metadata.reason.as_deref(), Some("disabled"));
    }
}
