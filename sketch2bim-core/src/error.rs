use image::ImageError;
use serde::{Deserialize, Serialize};

/// Failure kinds surfaced at the pipeline boundary
#[derive(Debug)]
pub enum PipelineError {
    InvalidImage(String),
    AssessmentFailure(String),
    LegendAbsent(String),
    LowQuality(String),
    DetectionTooWeak(String),
    IfcGenerationFailed(String),
    IfcInvalid(String),
    ExportFailed { format: String, reason: String },
    CheckpointIoFailed(String),
}

/// How far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recorded and the pipeline continues
    Soft,
    /// The job stops at this stage
    Hard,
}

impl PipelineError {
    /// Stable snake_case tag used in results and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidImage(_) => "invalid_image",
            PipelineError::AssessmentFailure(_) => "assessment_failure",
            PipelineError::LegendAbsent(_) => "legend_absent",
            PipelineError::LowQuality(_) => "low_quality",
            PipelineError::DetectionTooWeak(_) => "detection_too_weak",
            PipelineError::IfcGenerationFailed(_) => "ifc_generation_failed",
            PipelineError::IfcInvalid(_) => "ifc_invalid",
            PipelineError::ExportFailed { .. } => "export_failed",
            PipelineError::CheckpointIoFailed(_) => "checkpoint_io_failed",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::InvalidImage(_)
            | PipelineError::DetectionTooWeak(_)
            | PipelineError::IfcGenerationFailed(_) => Severity::Hard,
            _ => Severity::Soft,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.severity() == Severity::Hard
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidImage(msg) => write!(f, "Invalid image: {}", msg),
            PipelineError::AssessmentFailure(msg) => write!(f, "Quality assessment failed: {}", msg),
            PipelineError::LegendAbsent(msg) => write!(f, "Legend absent: {}", msg),
            PipelineError::LowQuality(msg) => write!(f, "Low quality: {}", msg),
            PipelineError::DetectionTooWeak(msg) => write!(f, "Detection too weak: {}", msg),
            PipelineError::IfcGenerationFailed(msg) => write!(f, "IFC generation failed: {}", msg),
            PipelineError::IfcInvalid(msg) => write!(f, "IFC invalid: {}", msg),
            PipelineError::ExportFailed { format, reason } => {
                write!(f, "{} export failed: {}", format, reason)
            }
            PipelineError::CheckpointIoFailed(msg) => write!(f, "Checkpoint I/O failed: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ImageError> for PipelineError {
    fn from(err: ImageError) -> Self {
        PipelineError::InvalidImage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_and_soft_kinds() {
        assert!(PipelineError::InvalidImage("x".into()).is_hard());
        assert!(PipelineError::DetectionTooWeak("x".into()).is_hard());
        assert!(PipelineError::IfcGenerationFailed("x".into()).is_hard());

        assert!(!PipelineError::LegendAbsent("x".into()).is_hard());
        assert!(!PipelineError::IfcInvalid("x".into()).is_hard());
        assert!(!PipelineError::CheckpointIoFailed("x".into()).is_hard());
    }

    #[test]
    fn test_display_and_kind() {
        let err = PipelineError::ExportFailed {
            format: "DXF".into(),
            reason: "disk full".into(),
        };
        assert_eq!(err.kind(), "export_failed");
        assert_eq!(err.to_string(), "DXF export failed: disk full");
    }
}
