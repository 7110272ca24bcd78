//! Processing agent: strategy selection, preprocessing and the bounded
//! detection retry loop around the sketch reader.

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, PipelineConfig, ReaderConfig};
use crate::error::PipelineError;
use crate::image_ops;
use crate::legend_parser::LegendParser;
use crate::ocr::OcrEngine;
use crate::plan::{LegendData, PlanData};
use crate::quality_assessor::{
    overall_confidence, DetectionMetrics, GateMetrics, GateResult, QualityAssessor, SketchQualityMetrics,
};
use crate::room_classifier::RoomClassifier;
use crate::sketch_reader::{PlanReader, SketchReader};

const MIN_RETRY_THRESHOLD: f64 = 20.0;
const MIN_PROCEED_CONFIDENCE: f64 = 20.0;
const MIN_PROCEED_WALLS: usize = 4;

/// Image clean-up steps; always applied in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessStep {
    Sharpen,
    EnhanceContrast,
    Denoise,
    NormalizeBrightness,
}

impl PreprocessStep {
    pub fn as_str(&self) -> &str {
        match self {
            PreprocessStep::Sharpen => "sharpen",
            PreprocessStep::EnhanceContrast => "enhance_contrast",
            PreprocessStep::Denoise => "denoise",
            PreprocessStep::NormalizeBrightness => "normalize_brightness",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementLevel {
    Low,
    Normal,
    High,
}

/// How one detection attempt is run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub preprocessing_required: bool,
    pub preprocessing_steps: Vec<PreprocessStep>,
    pub detection_parameters: BTreeMap<String, f64>,
    pub reader_type: String,
    pub enhancement_level: EnhancementLevel,
    pub confidence_threshold: f64,
    pub retry_on_low_quality: bool,
    pub max_retries: u32,
    pub retry_count: u32,
}

impl Default for Strategy {
    fn default() -> Self {
        let mut strategy = Self {
            preprocessing_required: false,
            preprocessing_steps: Vec::new(),
            detection_parameters: BTreeMap::new(),
            reader_type: "opencv".to_string(),
            enhancement_level: EnhancementLevel::Normal,
            confidence_threshold: 30.0,
            retry_on_low_quality: true,
            max_retries: 2,
            retry_count: 0,
        };
        strategy.sync_parameters();
        strategy
    }
}

impl Strategy {
    /// Pick preprocessing, threshold and enhancement from image quality
    pub fn from_quality(metrics: &SketchQualityMetrics, reader_type: &str, max_retries: u32) -> Self {
        let mut strategy = Strategy {
            reader_type: reader_type.to_string(),
            max_retries,
            ..Strategy::default()
        };

        if metrics.sharpness < 30.0 {
            strategy.add_step(PreprocessStep::Sharpen);
        }
        if metrics.contrast < 0.3 {
            strategy.add_step(PreprocessStep::EnhanceContrast);
        }
        if metrics.noise > 0.15 {
            strategy.add_step(PreprocessStep::Denoise);
        }
        if metrics.brightness < 0.2 || metrics.brightness > 0.8 {
            strategy.add_step(PreprocessStep::NormalizeBrightness);
        }

        strategy.confidence_threshold = if metrics.overall > 70.0 {
            40.0
        } else if metrics.overall < 40.0 {
            20.0
        } else {
            30.0
        };
        strategy.enhancement_level = if metrics.overall < 50.0 {
            EnhancementLevel::High
        } else if metrics.overall > 70.0 {
            EnhancementLevel::Low
        } else {
            EnhancementLevel::Normal
        };
        strategy.sync_parameters();
        strategy
    }

    fn add_step(&mut self, step: PreprocessStep) {
        if !self.preprocessing_steps.contains(&step) {
            self.preprocessing_steps.push(step);
        }
        self.preprocessing_required = true;
    }

    fn sync_parameters(&mut self) {
        self.detection_parameters
            .insert("confidence_threshold".to_string(), self.confidence_threshold);
    }

    /// More aggressive preprocessing and a lower bar for the next attempt
    pub fn adjusted_for_retry(&self, retry_count: u32) -> Strategy {
        let mut next = self.clone();
        next.add_step(PreprocessStep::EnhanceContrast);
        next.add_step(PreprocessStep::Sharpen);
        next.confidence_threshold = (self.confidence_threshold - 10.0).max(MIN_RETRY_THRESHOLD);
        next.enhancement_level = EnhancementLevel::High;
        next.retry_count = retry_count;
        next.sync_parameters();
        info!(
            "Adjusted strategy for retry {}: steps={:?}, threshold={}",
            retry_count, next.preprocessing_steps, next.confidence_threshold
        );
        next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetricsSummary {
    pub legend: Option<LegendData>,
    pub sketch: Option<SketchQualityMetrics>,
    pub detection: Option<DetectionMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub plan_data: Option<PlanData>,
    /// Blended sketch/detection confidence, 0–100
    pub confidence: f64,
    pub quality_metrics: QualityMetricsSummary,
    pub gate_results: Vec<GateResult>,
    pub strategy_used: Option<Strategy>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    /// Stage name → milliseconds
    pub stage_timings: BTreeMap<String, u64>,
}

impl ProcessingResult {
    fn fail(&mut self, err: &PipelineError) {
        error!("Processing failed: {}", err);
        self.success = false;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
    }
}

/// Outcome of the retry loop
struct DetectionRun {
    plan: Option<PlanData>,
    gate: Option<GateResult>,
    strategy: Strategy,
    retry_count: u32,
    error: Option<PipelineError>,
}

pub struct ProcessingAgent {
    config: AgentConfig,
    /// Denoise reuses the reader's NLM settings
    denoise: ReaderConfig,
    assessor: QualityAssessor,
    legend_parser: LegendParser,
    reader: Arc<dyn PlanReader>,
    classifier: RoomClassifier,
}

impl ProcessingAgent {
    pub fn new(config: &PipelineConfig, ocr: Arc<dyn OcrEngine>) -> Self {
        let reader = SketchReader::new(config.reader.clone(), config.symbols.clone());
        Self {
            config: config.agent.clone(),
            denoise: config.reader.clone(),
            assessor: QualityAssessor::new(config.quality.clone()),
            legend_parser: LegendParser::new(config.legend.clone(), ocr),
            reader: Arc::new(reader),
            classifier: RoomClassifier::new(),
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn PlanReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_classifier(mut self, classifier: RoomClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn assessor(&self) -> &QualityAssessor {
        &self.assessor
    }

    /// Pre-gate, strategy, legend, then detection with retries. Never panics;
    /// failures are reported on the result.
    pub fn process_sketch(
        &self,
        sketch_path: &Path,
        legend: Option<LegendData>,
        max_retries: Option<u32>,
    ) -> ProcessingResult {
        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let mut result = ProcessingResult::default();

        info!("Running pre-processing quality gate...");
        let start = Instant::now();
        let pre_gate = self.assessor.pre_processing_gate(sketch_path, None);
        result.stage_timings.insert("pre_gate".into(), start.elapsed().as_millis() as u64);
        if !pre_gate.passed {
            warn!("Pre-processing gate failed: {}", pre_gate.message);
            result.recommendations.extend(pre_gate.recommendations.iter().cloned());
        }
        if let Some(e) = &pre_gate.error {
            result.warnings.push(format!("assessment_failure: {}", e));
        }
        let sketch_metrics = match &pre_gate.metrics {
            GateMetrics::Sketch(m) => m.clone(),
            _ => SketchQualityMetrics::default(),
        };
        result.gate_results.push(pre_gate);

        let strategy = Strategy::from_quality(&sketch_metrics, self.reader.reader_type(), max_retries);
        info!(
            "Selected strategy: reader={}, preprocessing={:?}, threshold={}",
            strategy.reader_type, strategy.preprocessing_steps, strategy.confidence_threshold
        );

        let mut processed = sketch_path.to_path_buf();
        if strategy.preprocessing_required {
            processed = self.preprocess_or_original(sketch_path, &strategy, 0, &mut result.warnings);
        }

        let legend = match legend {
            Some(legend) => legend,
            None => {
                info!("Parsing legend from sketch...");
                let start = Instant::now();
                let parsed = self.legend_parser.parse_legend_from_sketch(&processed);
                result.stage_timings.insert("legend".into(), start.elapsed().as_millis() as u64);
                parsed
            }
        };
        if !legend.has_scale() {
            result.warnings.push(format!(
                "legend_absent: no scale found, using {} m/px",
                legend.scale_ratio
            ));
        }

        let start = Instant::now();
        let run = self.detect_with_retries(sketch_path, processed, &legend, strategy, &mut result);
        result.stage_timings.insert("detection".into(), start.elapsed().as_millis() as u64);

        result.retry_count = run.retry_count;
        result.strategy_used = Some(run.strategy);
        result.quality_metrics.sketch = Some(sketch_metrics.clone());
        result.quality_metrics.legend = Some(legend);

        if let Some(err) = run.error {
            result.fail(&err);
            return result;
        }
        let Some(plan) = run.plan else {
            result.fail(&PipelineError::DetectionTooWeak("Failed to detect any geometry".into()));
            return result;
        };

        let detection_metrics = match run.gate.as_ref().map(|g| &g.metrics) {
            Some(GateMetrics::Detection(m)) => m.clone(),
            _ => self.assessor.assess_detection_quality(&plan),
        };
        match &run.gate {
            Some(gate) if gate.passed => {}
            Some(gate) => {
                let err = PipelineError::LowQuality(format!("Detection quality below threshold: {}", gate.message));
                warn!("{}", err);
                result.error = Some(err.to_string());
                result.error_kind = Some(err.kind().to_string());
            }
            None => {}
        }
        if let Some(gate) = &run.gate {
            result.recommendations = gate.recommendations.clone();
        }

        result.confidence = overall_confidence(sketch_metrics.overall, detection_metrics.confidence, 0.0);
        result.quality_metrics.detection = Some(detection_metrics);
        result.plan_data = Some(plan);
        result.success = true;

        info!(
            "Processing complete: confidence={:.1}%, retries={}",
            result.confidence, result.retry_count
        );
        result
    }

    /// Read, classify and gate; on a failed gate adjust the strategy,
    /// re-materialise the preprocessed image and try again
    fn detect_with_retries(
        &self,
        sketch_path: &Path,
        mut processed: PathBuf,
        legend: &LegendData,
        mut strategy: Strategy,
        result: &mut ProcessingResult,
    ) -> DetectionRun {
        let max_retries = strategy.max_retries;
        let mut retry_count = 0;
        let mut plan = None;
        let mut gate = None;

        loop {
            info!("Processing sketch (attempt {}/{})...", retry_count + 1, max_retries + 1);
            let read = self.reader.read_sketch(&processed, Some(legend));

            match read {
                Ok(mut detected) => {
                    if !detected.rooms.is_empty() {
                        let applied = self.classifier.classify_rooms(&mut detected.rooms, Some(legend));
                        info!("Refined {} of {} room classifications", applied, detected.rooms.len());
                    }

                    let detection_gate = self.assessor.detection_gate(&detected, Some(strategy.confidence_threshold));
                    info!("{}", detection_gate.message);
                    let passed = detection_gate.passed;
                    result.gate_results.push(detection_gate.clone());
                    plan = Some(detected);
                    gate = Some(detection_gate);

                    if passed || !strategy.retry_on_low_quality {
                        break;
                    }
                }
                Err(e) if e.is_hard() => {
                    return DetectionRun {
                        plan: None,
                        gate: None,
                        strategy,
                        retry_count,
                        error: Some(e),
                    };
                }
                Err(e) => {
                    error!("Error in processing attempt {}: {}", retry_count + 1, e);
                    if retry_count >= max_retries {
                        return DetectionRun {
                            plan,
                            gate,
                            strategy,
                            retry_count,
                            error: Some(e),
                        };
                    }
                }
            }

            if retry_count >= max_retries {
                break;
            }
            retry_count += 1;
            info!("Quality below threshold, retrying with adjusted strategy...");
            strategy = strategy.adjusted_for_retry(retry_count);
            processed = self.preprocess_or_original(sketch_path, &strategy, retry_count, &mut result.warnings);
        }

        DetectionRun {
            plan,
            gate,
            strategy,
            retry_count,
            error: None,
        }
    }

    fn preprocess_or_original(
        &self,
        sketch_path: &Path,
        strategy: &Strategy,
        attempt: u32,
        warnings: &mut Vec<String>,
    ) -> PathBuf {
        match self.apply_preprocessing(sketch_path, &strategy.preprocessing_steps, attempt) {
            Ok(path) => path,
            Err(e) => {
                warn!("Preprocessing failed, reading the original image: {:#}", e);
                warnings.push(format!("preprocessing skipped: {:#}", e));
                sketch_path.to_path_buf()
            }
        }
    }

    /// Write `processed_{stem}_{attempt}.png` to the work directory and return its path
    pub fn apply_preprocessing(&self, image_path: &Path, steps: &[PreprocessStep], attempt: u32) -> Result<PathBuf> {
        let mut gray = image_ops::load_gray(image_path)?;

        let mut ordered = steps.to_vec();
        ordered.sort();
        ordered.dedup();
        for step in &ordered {
            gray = match step {
                PreprocessStep::Sharpen => image_ops::unsharp_mask(&gray, 2.0, 1.5),
                PreprocessStep::EnhanceContrast => image_ops::clahe(&gray, 3.0, 8),
                PreprocessStep::Denoise => image_ops::non_local_means(
                    &gray,
                    self.denoise.nlm_h,
                    self.denoise.nlm_template_window,
                    self.denoise.nlm_search_window,
                ),
                PreprocessStep::NormalizeBrightness => image_ops::equalize(&gray),
            };
        }

        let stem = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("Image path has no file name")?;
        let work_dir = self.config.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        let output = work_dir.join(format!("processed_{}_{}.png", stem, attempt));
        image_ops::save_png_atomic(&DynamicImage::ImageLuma8(gray), &output)?;

        info!(
            "Applied preprocessing {:?} -> {}",
            ordered.iter().map(PreprocessStep::as_str).collect::<Vec<_>>(),
            output.display()
        );
        Ok(output)
    }
}

/// Decision gate in front of IFC generation
pub fn should_proceed_to_ifc(result: &ProcessingResult) -> (bool, String) {
    let Some(plan) = result.plan_data.as_ref() else {
        return (false, "No plan data available".to_string());
    };
    if plan.rooms.is_empty() {
        return (false, "No rooms detected".to_string());
    }
    if plan.walls.len() < MIN_PROCEED_WALLS {
        return (false, "Insufficient walls detected (< 4)".to_string());
    }
    if plan.confidence < MIN_PROCEED_CONFIDENCE {
        return (false, format!("Confidence too low ({:.1}%)", plan.confidence));
    }
    (true, "Quality checks passed".to_string())
}
