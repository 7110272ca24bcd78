//! Model orchestrator: sketch in, IFC plus derived artifacts out.
//!
//! Runs the processing agent, the proceed check, IFC generation, then QC and
//! the secondary exports side by side, then the optional IDS and project-rule
//! checks. Every artifact boundary is
//! checkpointed so an interrupted job can resume from what it already has.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::checkpoint::{ArtifactKind, CheckpointMap, CheckpointStore};
use crate::config::{validate_input, PipelineConfig};
use crate::error::PipelineError;
use crate::exporter::{export_all, ExportArtifacts, ExportSelection};
use crate::ids_validator::run_ids_validation;
use crate::ifc_generator::generate_ifc_detailed;
use crate::ifc_validator::{validate_ifc, write_qc_report, QcReport};
use crate::ocr::{NoOcr, OcrEngine, TesseractOcr};
use crate::plan::{LegendData, PlanData};
use crate::processing_agent::{should_proceed_to_ifc, ProcessingAgent, ProcessingResult};
use crate::quality_assessor::{GateResult, QualityAssessor};
use crate::rule_engine::run_rule_validation;
use crate::sketch_reader::PlanReader;

const REVIEW_CONFIDENCE: f64 = 50.0;

/// Everything a job produced. Absent paths mean the artifact was not made.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationResult {
    pub success: bool,
    pub plan_data: Option<PlanData>,
    pub confidence: f64,
    /// Sketch, detection and IFC confidence blended
    pub overall_confidence: f64,
    pub legend_data: Option<LegendData>,
    pub requires_review: bool,

    pub ifc_path: Option<PathBuf>,
    pub dxf_path: Option<PathBuf>,
    pub dwg_path: Option<PathBuf>,
    pub sketchup_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
    pub rvt_path: Option<PathBuf>,
    pub qc_report: Option<QcReport>,
    pub qc_report_path: Option<PathBuf>,
    pub qc_report_text_path: Option<PathBuf>,
    pub ids_validation_report: Option<PathBuf>,
    pub ids_validation_passed: Option<bool>,
    pub rule_validation_report: Option<PathBuf>,
    pub rule_validation_passed: Option<bool>,

    pub ifc_checkpoint_url: Option<String>,
    pub dwg_checkpoint_url: Option<String>,
    pub obj_checkpoint_url: Option<String>,
    pub rvt_checkpoint_url: Option<String>,
    pub preview_checkpoint_url: Option<String>,

    pub gate_results: Vec<GateResult>,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    /// Stage name → milliseconds
    pub stage_timings: BTreeMap<String, u64>,
}

impl GenerationResult {
    fn fail(mut self, err: &PipelineError) -> Self {
        error!("Generation failed: {}", err);
        self.success = false;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
        self
    }

    fn time(&mut self, stage: &str, start: Instant) {
        self.stage_timings
            .insert(stage.to_string(), start.elapsed().as_millis() as u64);
    }

    fn set_checkpoint_url(&mut self, kind: ArtifactKind, url: String) {
        let slot = match kind {
            ArtifactKind::Ifc => &mut self.ifc_checkpoint_url,
            ArtifactKind::Dwg => &mut self.dwg_checkpoint_url,
            ArtifactKind::Obj => &mut self.obj_checkpoint_url,
            ArtifactKind::Rvt => &mut self.rvt_checkpoint_url,
            ArtifactKind::Preview => &mut self.preview_checkpoint_url,
        };
        *slot = Some(url);
    }
}

/// Checkpointed file for `kind`, if it is still on disk
fn existing_checkpoint(checkpoints: Option<&CheckpointMap>, kind: ArtifactKind) -> Option<PathBuf> {
    let path = checkpoints?.get(&kind)?;
    if path.exists() {
        info!("Using existing {} checkpoint: {}", kind.as_str(), path.display());
        Some(path.clone())
    } else {
        None
    }
}

pub struct ModelGenerator {
    config: PipelineConfig,
    store: CheckpointStore,
    ocr: Arc<dyn OcrEngine>,
    reader: Option<Arc<dyn PlanReader>>,
}

impl ModelGenerator {
    pub fn new(config: PipelineConfig) -> Self {
        let store = CheckpointStore::from_config(&config.checkpoint);
        let ocr: Arc<dyn OcrEngine> = match &config.legend.tesseract_path {
            Some(binary) => Arc::new(TesseractOcr::new(binary.clone())),
            None => Arc::new(NoOcr),
        };
        Self {
            config,
            store,
            ocr,
            reader: None,
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    /// Replace the raster reader the agent uses
    pub fn with_reader(mut self, reader: Arc<dyn PlanReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn agent(&self, job_id: &str) -> ProcessingAgent {
        let mut config = self.config.clone();
        if config.agent.work_dir.is_none() {
            config.agent.work_dir = Some(std::env::temp_dir().join("sketch2bim").join(job_id));
        }
        let agent = ProcessingAgent::new(&config, self.ocr.clone());
        match &self.reader {
            Some(reader) => agent.with_reader(reader.clone()),
            None => agent,
        }
    }

    /// Run the whole pipeline for one job. Never panics and never returns an
    /// error: failures are reported through `success`, `error` and `error_kind`.
    pub async fn generate_from_sketch(
        &self,
        sketch_path: &Path,
        output_dir: &Path,
        job_id: &str,
        checkpoints: Option<&CheckpointMap>,
    ) -> GenerationResult {
        let job_start = Instant::now();
        let mut result = GenerationResult::default();
        info!("Starting job {} for {}", job_id, sketch_path.display());

        if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
            return result.fail(&PipelineError::IfcGenerationFailed(format!(
                "Cannot create output directory {}: {}",
                output_dir.display(),
                e
            )));
        }
        if let Err(e) = validate_input(sketch_path, &self.config.limits) {
            return result.fail(&e);
        }

        // 1. processing agent (quality gate, legend, detection with retries)
        let start = Instant::now();
        let agent = self.agent(job_id);
        let sketch = sketch_path.to_path_buf();
        let processing = match tokio::task::spawn_blocking(move || {
            let processing = agent.process_sketch(&sketch, None, None);
            (agent, processing)
        })
        .await
        {
            Ok(done) => done,
            Err(e) => {
                return result.fail(&PipelineError::AssessmentFailure(format!("Processing task failed: {}", e)));
            }
        };
        let (agent, processing) = processing;
        result.time("processing", start);
        self.absorb_processing(&mut result, &processing);

        if !processing.success {
            result.error = processing.error.clone();
            result.error_kind = processing.error_kind.clone();
            error!("Processing agent failed: {}", result.error.as_deref().unwrap_or("unknown error"));
            return result;
        }

        // 2. proceed check
        let (proceed, reason) = should_proceed_to_ifc(&processing);
        if !proceed {
            warn!("Not generating IFC for {}: {}", job_id, reason);
            result.success = true;
            result.requires_review = true;
            result.error_kind = Some(PipelineError::DetectionTooWeak(reason.clone()).kind().to_string());
            result
                .recommendations
                .push(format!("Cannot proceed to IFC generation: {}", reason));
            result.time("total", job_start);
            return result;
        }
        let Some(plan) = processing.plan_data.clone() else {
            return result.fail(&PipelineError::DetectionTooWeak("No plan data available".into()));
        };

        // 3. IFC
        let ifc_path = match existing_checkpoint(checkpoints, ArtifactKind::Ifc) {
            Some(path) => path,
            None => {
                let start = Instant::now();
                let ifc_path = output_dir.join(format!("{}.ifc", job_id));
                if let Err(e) = generate_ifc(plan, ifc_path.clone()).await {
                    return result.fail(&e);
                }
                result.time("ifc_generation", start);
                self.checkpoint(&mut result, &ifc_path, job_id, ArtifactKind::Ifc).await;
                ifc_path
            }
        };
        result.ifc_path = Some(ifc_path.clone());

        // 4 + 5. QC report and secondary exports run side by side
        let start = Instant::now();
        let reused = |kind| existing_checkpoint(checkpoints, kind);
        let (reused_dwg, reused_obj, reused_rvt, reused_preview) = (
            reused(ArtifactKind::Dwg),
            reused(ArtifactKind::Obj),
            reused(ArtifactKind::Rvt),
            reused(ArtifactKind::Preview),
        );
        let selection = ExportSelection {
            dxf: reused_dwg.is_none(),
            obj: reused_obj.is_none(),
            preview: reused_preview.is_none(),
            rvt: reused_rvt.is_none(),
        };

        let qc_task = {
            let ifc = ifc_path.clone();
            let out = output_dir.to_path_buf();
            let job = job_id.to_string();
            tokio::task::spawn_blocking(move || {
                let report = validate_ifc(&ifc);
                let written = write_qc_report(&report, &out, &job);
                (report, written)
            })
        };
        let export_task = {
            let ifc = ifc_path.clone();
            let out = output_dir.to_path_buf();
            let job = job_id.to_string();
            let export_config = self.config.export.clone();
            tokio::task::spawn_blocking(move || export_all(&ifc, &out, &job, &export_config, selection))
        };
        let (qc, exports) = tokio::join!(qc_task, export_task);
        result.time("qc_and_exports", start);

        let report = match qc {
            Ok((report, written)) => {
                match written {
                    Ok((json, text)) => {
                        result.qc_report_path = Some(json);
                        result.qc_report_text_path = Some(text);
                    }
                    Err(e) => {
                        warn!("Failed to write QC report: {:#}", e);
                        result.warnings.push(format!("QC report not written: {:#}", e));
                    }
                }
                report
            }
            Err(e) => {
                warn!("QC task failed: {}", e);
                let mut report = QcReport::empty("IFC4");
                report.valid = false;
                report.confidence = 0.0;
                result.warnings.push(format!("QC task failed: {}", e));
                report
            }
        };
        let exports = exports.unwrap_or_else(|e| ExportArtifacts {
            warnings: vec![format!("Export task failed: {}", e)],
            ..ExportArtifacts::default()
        });

        self.review_ifc(&mut result, agent.assessor(), &processing, &report);
        result.qc_report = Some(report);

        result.warnings.extend(exports.warnings.iter().cloned());
        result.dxf_path = exports.dxf;
        result.dwg_path = reused_dwg.clone().or(exports.dwg);
        result.sketchup_path = reused_obj.clone().or(exports.obj);
        result.rvt_path = reused_rvt.clone().or(exports.rvt);
        result.preview_path = reused_preview.clone().or(exports.preview);

        self.advisory_validation(&mut result, &ifc_path, output_dir, job_id).await;

        // 6. checkpoint what was produced in this run
        let produced = [
            (ArtifactKind::Dwg, reused_dwg.is_none(), result.dwg_path.clone()),
            (ArtifactKind::Obj, reused_obj.is_none(), result.sketchup_path.clone()),
            (ArtifactKind::Rvt, reused_rvt.is_none(), result.rvt_path.clone()),
            (ArtifactKind::Preview, reused_preview.is_none(), result.preview_path.clone()),
        ];
        for (kind, fresh, path) in produced {
            if let (true, Some(path)) = (fresh, path) {
                self.checkpoint(&mut result, &path, job_id, kind).await;
            }
        }

        result.success = true;
        result.time("total", job_start);
        info!(
            "Job {} complete: confidence {:.1}%, review {}, {} warnings in {}ms",
            job_id,
            result.confidence,
            result.requires_review,
            result.warnings.len(),
            job_start.elapsed().as_millis()
        );
        result
    }

    fn absorb_processing(&self, result: &mut GenerationResult, processing: &ProcessingResult) {
        result.plan_data = processing.plan_data.clone();
        result.confidence = processing.confidence;
        result.overall_confidence = processing.confidence;
        result.legend_data = processing.quality_metrics.legend.clone();
        result.gate_results = processing.gate_results.clone();
        result.recommendations = processing.recommendations.clone();
        result.warnings = processing.warnings.clone();
        for (stage, ms) in &processing.stage_timings {
            result.stage_timings.insert(format!("processing.{}", stage), *ms);
        }
        // a low-quality detection that still produced a plan is advisory here
        if processing.success {
            if let Some(err) = &processing.error {
                result.warnings.push(err.clone());
            }
        }
        if let Some(plan) = &processing.plan_data {
            info!(
                "Detected {} rooms, {} walls, {} openings (confidence {:.1}%)",
                plan.rooms.len(),
                plan.walls.len(),
                plan.openings.len(),
                processing.confidence
            );
        }
    }

    /// Post-IFC gate and the review decision
    fn review_ifc(
        &self,
        result: &mut GenerationResult,
        assessor: &QualityAssessor,
        processing: &ProcessingResult,
        report: &QcReport,
    ) {
        let gate = assessor.post_ifc_gate(report);
        info!("{}", gate.message);

        let metrics = &processing.quality_metrics;
        result.overall_confidence = crate::quality_assessor::overall_confidence(
            metrics.sketch.as_ref().map(|m| m.overall).unwrap_or(0.0),
            metrics.detection.as_ref().map(|m| m.confidence).unwrap_or(0.0),
            report.confidence,
        );

        if !report.valid {
            let err = PipelineError::IfcInvalid(format!("{} critical QC errors", report.critical_count()));
            warn!("{}", err);
            result.warnings.push(err.to_string());
        }
        if !report.valid || result.confidence < REVIEW_CONFIDENCE || !gate.passed {
            result.requires_review = true;
            warn!(
                "QC check: confidence {:.1}%, QC {:.1}%, requires review",
                result.confidence, report.confidence
            );
            for rec in &gate.recommendations {
                if !result.recommendations.contains(rec) {
                    result.recommendations.push(rec.clone());
                }
            }
        }
        result.gate_results.push(gate);
    }

    /// IDS and project-rule checks. Problems become warnings, never a failed job.
    async fn advisory_validation(&self, result: &mut GenerationResult, ifc_path: &Path, output_dir: &Path, job_id: &str) {
        let validation = self.config.validation.clone();
        if validation.ids_path.is_none() && !validation.rules_enabled {
            return;
        }
        let start = Instant::now();
        let ifc = ifc_path.to_path_buf();
        let out = output_dir.to_path_buf();
        let job = job_id.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let ids = validation
                .ids_path
                .as_deref()
                .map(|ids| run_ids_validation(ids, &ifc, &out, &job));
            let rules = validation
                .rules_enabled
                .then(|| run_rule_validation(validation.rules_path.as_deref(), &ifc, &out, &job));
            (ids, rules)
        });
        let (ids, rules) = match task.await {
            Ok(done) => done,
            Err(e) => {
                warn!("Validation task failed: {}", e);
                result.warnings.push(format!("Validation task failed: {}", e));
                return;
            }
        };

        match ids {
            Some(Ok((path, report))) => {
                if !report.all_passed {
                    result.warnings.push(format!(
                        "IDS validation failed: {} of {} checks failed",
                        report.failed_requirements, report.total_requirements
                    ));
                }
                result.ids_validation_report = Some(path);
                result.ids_validation_passed = Some(report.all_passed);
            }
            Some(Err(e)) => {
                warn!("IDS validation failed: {:#}", e);
                result.warnings.push(format!("IDS validation not run: {:#}", e));
            }
            None => {}
        }
        match rules {
            Some(Ok((path, report))) => {
                if !report.all_passed() {
                    result.warnings.push(format!(
                        "Project rules: {} of {} checks failed",
                        report.failed_rules,
                        report.results.len()
                    ));
                }
                result.rule_validation_report = Some(path);
                result.rule_validation_passed = Some(report.all_passed());
            }
            Some(Err(e)) => {
                warn!("Rule validation failed: {:#}", e);
                result.warnings.push(format!("Rule validation not run: {:#}", e));
            }
            None => {}
        }
        result.time("advisory_validation", start);
    }

    async fn checkpoint(&self, result: &mut GenerationResult, path: &Path, job_id: &str, kind: ArtifactKind) {
        match self.store.upload_checkpoint(path, job_id, kind).await {
            Ok(Some(url)) => result.set_checkpoint_url(kind, url),
            Ok(None) => {}
            Err(e) => result.warnings.push(e.to_string()),
        }
    }
}

async fn generate_ifc(plan: PlanData, ifc_path: PathBuf) -> Result<(), PipelineError> {
    info!("Generating IFC model...");
    tokio::task::spawn_blocking(move || {
        let mut log_progress = |percent: u8, message: &str| info!("IFC generation progress: {}% - {}", percent, message);
        let progress: &mut dyn FnMut(u8, &str) = &mut log_progress;
        generate_ifc_detailed(&plan, &ifc_path, Some(progress)).map(|_| ())
    })
    .await
    .map_err(|e| PipelineError::IfcGenerationFailed(format!("IFC task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Point, Room, RoomType, Wall};
    use ifc_step::model::IfcClass;
    use ifc_step::IfcFile;
    use image::{GrayImage, Luma};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use std::fs;
    use std::sync::Mutex;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sketch2bim_job_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.reader.nlm_search_window = 3;
        config.legend.tesseract_path = None;
        config.agent.work_dir = Some(dir.join("work"));
        config
    }

    fn generator(dir: &Path) -> ModelGenerator {
        ModelGenerator::new(test_config(dir)).with_ocr(Arc::new(NoOcr))
    }

    /// Returns clones of one plan forever
    struct FixedReader(PlanData);

    impl PlanReader for FixedReader {
        fn read_sketch(&self, _image_path: &Path, _legend: Option<&LegendData>) -> Result<PlanData, PipelineError> {
            Ok(self.0.clone())
        }

        fn reader_type(&self) -> &str {
            "fixed"
        }
    }

    /// Counts how often it was asked to read
    struct CountingReader {
        plan: PlanData,
        reads: Mutex<usize>,
    }

    impl PlanReader for CountingReader {
        fn read_sketch(&self, _image_path: &Path, _legend: Option<&LegendData>) -> Result<PlanData, PipelineError> {
            *self.reads.lock().unwrap() += 1;
            Ok(self.plan.clone())
        }

        fn reader_type(&self) -> &str {
            "counting"
        }
    }

    fn outlined_rect(width: u32, height: u32, from: (i32, i32), to: (i32, i32), thickness: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([255]));
        let black = Luma([0u8]);
        let (w, h) = ((to.0 - from.0) as u32, (to.1 - from.1) as u32);
        draw_filled_rect_mut(&mut img, Rect::at(from.0, from.1).of_size(w, thickness), black);
        draw_filled_rect_mut(&mut img, Rect::at(from.0, to.1 - thickness as i32).of_size(w, thickness), black);
        draw_filled_rect_mut(&mut img, Rect::at(from.0, from.1).of_size(thickness, h), black);
        draw_filled_rect_mut(&mut img, Rect::at(to.0 - thickness as i32, from.1).of_size(thickness, h), black);
        img
    }

    /// Full-range noise: low contrast and high noise both trip the strategy
    fn noise_image(size: u32) -> GrayImage {
        let mut state: u64 = 7;
        GrayImage::from_fn(size, size, |_, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            Luma([((state >> 33) % 256) as u8])
        })
    }

    fn create_wall(x1: f64, y1: f64, x2: f64, y2: f64) -> Wall {
        Wall::new(Point::new(x1, y1), Point::new(x2, y2), 0.01)
    }

    fn room_plan() -> PlanData {
        let mut plan = PlanData::empty(0.01);
        plan.walls = vec![
            create_wall(100.0, 100.0, 900.0, 100.0),
            create_wall(900.0, 100.0, 900.0, 900.0),
            create_wall(900.0, 900.0, 100.0, 900.0),
            create_wall(100.0, 900.0, 100.0, 100.0),
        ];
        plan.rooms = vec![Room {
            id: 0,
            polygon: vec![
                Point::new(100.0, 100.0),
                Point::new(900.0, 100.0),
                Point::new(900.0, 900.0),
                Point::new(100.0, 900.0),
            ],
            area_pixels: 640_000.0,
            area_meters: 64.0,
            room_type: RoomType::Living,
            is_nested: false,
            aspect_ratio: 1.0,
            solidity: 1.0,
            classification_confidence: None,
            classification_method: None,
            classification_reasoning: None,
        }];
        plan.confidence = 47.48;
        plan
    }

    fn write_png(img: &GrayImage, path: &Path) {
        img.save(path).unwrap();
    }

    #[tokio::test]
    async fn test_simple_rectangular_room_end_to_end() {
        let dir = temp_dir();
        let sketch = dir.join("room.png");
        write_png(&outlined_rect(1024, 1024, (100, 100), (900, 900), 4), &sketch);
        let out = dir.join("out");

        let result = generator(&dir).generate_from_sketch(&sketch, &out, "job-a", None).await;
        assert!(result.success, "{:?}", result.error);

        let plan = result.plan_data.as_ref().unwrap();
        assert!(!plan.rooms.is_empty());
        assert!(plan.walls.len() >= 4);
        assert!(plan.confidence >= 40.0, "confidence {}", plan.confidence);

        let ifc_path = result.ifc_path.clone().unwrap();
        assert_eq!(ifc_path, out.join("job-a.ifc"));
        let file = IfcFile::open(&ifc_path).unwrap();
        assert_eq!(file.count(&IfcClass::Slab), plan.rooms.len());
        assert!(file.count(&IfcClass::WallStandardCase) >= 4);

        let qc = result.qc_report.as_ref().unwrap();
        assert!(qc.valid);
        assert!(result.qc_report_path.as_ref().unwrap().exists());
        assert!(result.qc_report_text_path.as_ref().unwrap().exists());

        assert_eq!(result.dxf_path, Some(out.join("job-a.dxf")));
        assert_eq!(result.dwg_path, Some(out.join("job-a.dwg")));
        assert_eq!(result.sketchup_path, Some(out.join("job-a.obj")));
        assert_eq!(result.preview_path, Some(out.join("job-a_preview.png")));
        assert_eq!(result.rvt_path, Some(out.join("job-a.rvt.ifc")));

        // pre-gate, at least one detection gate, post-IFC gate
        assert!(result.gate_results.len() >= 3);
        assert!(result.stage_timings.contains_key("ifc_generation"));
        assert!(result.stage_timings.contains_key("total"));
        // checkpoints are off by default
        assert!(result.ifc_checkpoint_url.is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_illegible_sketch_needs_review_without_ifc() {
        let dir = temp_dir();
        let sketch = dir.join("noise.png");
        write_png(&noise_image(512), &sketch);
        let out = dir.join("out");

        let result = generator(&dir).generate_from_sketch(&sketch, &out, "job-b", None).await;

        assert!(result.success);
        assert!(result.requires_review);
        assert!(result.error.is_none());
        assert_eq!(result.error_kind.as_deref(), Some("detection_too_weak"));
        // pre-gate, then one failed detection gate per attempt
        assert_eq!(result.gate_results.len(), 4);
        assert!(result.gate_results[1..].iter().all(|g| !g.passed));
        let plan = result.plan_data.as_ref().unwrap();
        assert!(plan.rooms.is_empty());
        assert!(plan.walls.is_empty());
        assert_eq!(plan.confidence, 0.0);
        assert!(result.ifc_path.is_none());
        assert!(!out.join("job-b.ifc").exists());
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.starts_with("Cannot proceed to IFC generation")));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_tiny_blank_sketch_needs_review() {
        let dir = temp_dir();
        let sketch = dir.join("tiny.png");
        write_png(&GrayImage::from_pixel(8, 8, Luma([255])), &sketch);
        let out = dir.join("out");

        let result = generator(&dir).generate_from_sketch(&sketch, &out, "job-t", None).await;

        assert!(result.success, "{:?}", result.error);
        assert!(result.requires_review);
        assert_eq!(result.error_kind.as_deref(), Some("detection_too_weak"));
        let plan = result.plan_data.as_ref().unwrap();
        assert!(plan.rooms.is_empty());
        assert!(plan.walls.is_empty());
        assert!(result.ifc_path.is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_invalid_input_fails() {
        let dir = temp_dir();
        let sketch = dir.join("notes.txt");
        fs::write(&sketch, b"not an image").unwrap();

        let result = generator(&dir)
            .generate_from_sketch(&sketch, &dir.join("out"), "job-x", None)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("invalid_image"));
        assert!(result.error.is_some());
        assert!(result.ifc_path.is_none());

        let missing = generator(&dir)
            .generate_from_sketch(&dir.join("missing.png"), &dir.join("out"), "job-y", None)
            .await;
        assert!(!missing.success);
        assert_eq!(missing.error_kind.as_deref(), Some("invalid_image"));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_checkpoints_are_uploaded_and_reused() {
        let dir = temp_dir();
        let sketch = dir.join("plan.png");
        write_png(&outlined_rect(200, 200, (20, 20), (180, 180), 3), &sketch);
        let store = CheckpointStore::LocalDir(dir.join("store"));

        let first = generator(&dir)
            .with_reader(Arc::new(FixedReader(room_plan())))
            .with_store(store.clone())
            .generate_from_sketch(&sketch, &dir.join("run1"), "job-c", None)
            .await;
        assert!(first.success, "{:?}", first.error);
        assert!(first.ifc_checkpoint_url.as_deref().unwrap().starts_with("file://"));
        assert!(first.dwg_checkpoint_url.is_some());
        assert!(first.obj_checkpoint_url.is_some());
        assert!(first.rvt_checkpoint_url.is_some());
        assert!(first.preview_checkpoint_url.is_some());

        let restored = store.restore_all("job-c", &dir.join("restored")).await;
        assert_eq!(restored.len(), 5);

        let reader = Arc::new(CountingReader {
            plan: room_plan(),
            reads: Mutex::new(0),
        });
        let run2 = dir.join("run2");
        let second = generator(&dir)
            .with_reader(reader.clone())
            .with_store(store)
            .generate_from_sketch(&sketch, &run2, "job-c", Some(&restored))
            .await;
        assert!(second.success, "{:?}", second.error);
        assert_eq!(second.ifc_path.as_ref(), restored.get(&ArtifactKind::Ifc));
        assert_eq!(second.sketchup_path.as_ref(), restored.get(&ArtifactKind::Obj));
        assert_eq!(second.preview_path.as_ref(), restored.get(&ArtifactKind::Preview));
        assert!(!run2.join("job-c.ifc").exists());
        assert!(!run2.join("job-c.obj").exists());
        // nothing was regenerated, so nothing new was uploaded
        assert!(second.ifc_checkpoint_url.is_none());
        assert!(second.obj_checkpoint_url.is_none());
        // QC still runs against the restored model
        assert!(second.qc_report.as_ref().unwrap().valid);
        assert!(*reader.reads.lock().unwrap() >= 1);

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_ids_and_rule_checks_are_advisory() {
        let dir = temp_dir();
        let sketch = dir.join("plan.png");
        write_png(&outlined_rect(200, 200, (20, 20), (180, 180), 3), &sketch);
        let ids = dir.join("delivery.ids");
        fs::write(
            &ids,
            r#"<ids><info><title>Doors</title></info><specifications>
                 <specification name="Doors present"><applicability><entity name="IfcDoor"/></applicability></specification>
               </specifications></ids>"#,
        )
        .unwrap();

        let mut config = test_config(&dir);
        config.validation.ids_path = Some(ids);
        config.validation.rules_enabled = true;
        let out = dir.join("out");
        let result = ModelGenerator::new(config)
            .with_ocr(Arc::new(NoOcr))
            .with_reader(Arc::new(FixedReader(room_plan())))
            .generate_from_sketch(&sketch, &out, "job-v", None)
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.ids_validation_report, Some(out.join("job-v_ids_validation.json")));
        assert_eq!(result.ids_validation_passed, Some(false));
        assert_eq!(result.rule_validation_report, Some(out.join("job-v_rule_validation.json")));
        // generated walls are named "Wall N"
        assert_eq!(result.rule_validation_passed, Some(false));
        assert!(result.warnings.iter().any(|w| w == "IDS validation failed: 1 of 1 checks failed"));
        assert!(result.stage_timings.contains_key("advisory_validation"));

        let mut config = test_config(&dir);
        config.validation.ids_path = Some(dir.join("missing.ids"));
        let result = ModelGenerator::new(config)
            .with_ocr(Arc::new(NoOcr))
            .with_reader(Arc::new(FixedReader(room_plan())))
            .generate_from_sketch(&sketch, &dir.join("out2"), "job-v2", None)
            .await;
        assert!(result.success);
        assert!(result.ids_validation_passed.is_none());
        assert!(result.warnings.iter().any(|w| w.starts_with("IDS validation not run")));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_weak_plan_stops_before_ifc() {
        let dir = temp_dir();
        let sketch = dir.join("plan.png");
        write_png(&outlined_rect(200, 200, (20, 20), (180, 180), 3), &sketch);
        let mut plan = room_plan();
        plan.walls.truncate(3);

        let result = generator(&dir)
            .with_reader(Arc::new(FixedReader(plan)))
            .generate_from_sketch(&sketch, &dir.join("out"), "job-w", None)
            .await;
        assert!(result.success);
        assert!(result.requires_review);
        assert!(result.ifc_path.is_none());
        assert!(result
            .recommendations
            .contains(&"Cannot proceed to IFC generation: Insufficient walls detected (< 4)".to_string()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_checkpoint_lookup_requires_file() {
        let dir = temp_dir();
        let present = dir.join("checkpoint_ifc.ifc");
        fs::write(&present, b"x").unwrap();
        let mut map = CheckpointMap::new();
        map.insert(ArtifactKind::Ifc, present.clone());
        map.insert(ArtifactKind::Obj, dir.join("gone.obj"));

        assert_eq!(existing_checkpoint(Some(&map), ArtifactKind::Ifc), Some(present));
        assert_eq!(existing_checkpoint(Some(&map), ArtifactKind::Obj), None);
        assert_eq!(existing_checkpoint(Some(&map), ArtifactKind::Dwg), None);
        assert_eq!(existing_checkpoint(None, ArtifactKind::Ifc), None);

        fs::remove_dir_all(&dir).ok();
    }
}
