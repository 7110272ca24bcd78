//! Sketch-to-BIM conversion core.
//!
//! A raster floor plan goes through quality assessment, legend parsing,
//! wall/room/opening extraction and room classification (all driven by the
//! processing agent), then IFC generation, secondary exports and IFC
//! validation, with optional IDS and project-rule checks.
//! `ModelGenerator::generate_from_sketch` is the single entry point.

pub mod checkpoint;
pub mod config;
pub mod dxf_export;
pub mod error;
pub mod exporter;
pub mod hough;
pub mod ids_validator;
pub mod ifc_generator;
pub mod ifc_validator;
pub mod image_ops;
pub mod legend_parser;
pub mod model_generator;
pub mod ocr;
pub mod opening_detector;
pub mod plan;
pub mod preview;
pub mod processing_agent;
pub mod quality_assessor;
pub mod room_classifier;
pub mod room_detector;
pub mod rule_engine;
pub mod sketch_reader;
pub mod symbol_detector;
pub mod wall_merger;

pub use checkpoint::{ArtifactKind, CheckpointMap, CheckpointStore};
pub use config::PipelineConfig;
pub use error::{PipelineError, Severity};
pub use ids_validator::{IdsSpecification, IdsValidationReport};
pub use ifc_validator::QcReport;
pub use model_generator::{GenerationResult, ModelGenerator};
pub use plan::{LegendData, Opening, OpeningType, PlanData, Point, Room, RoomType, Symbol, Wall};
pub use processing_agent::{ProcessingAgent, ProcessingResult, Strategy};
pub use quality_assessor::{DetectionMetrics, GateResult, SketchQualityMetrics};
pub use rule_engine::{RuleEngine, RuleValidationReport, ValidationRule};
