//! IFC quality control.
//!
//! Re-opens a generated IFC file with the STEP reader and checks, in order:
//! file integrity, schema rules, geometry presence, topology and units.
//! The resulting `QcReport` feeds the post-IFC gate and is written next to
//! the artifacts as JSON and plain text.

use anyhow::{Context, Result};
use chrono::Utc;
use ifc_step::model::IfcClass;
use ifc_step::IfcFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::exporter::write_atomic;

pub const MIN_FILE_SIZE: u64 = 1000;
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
/// Fewer walls than this is reported as a warning
pub const FEW_WALLS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    Warning,
    Info,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Critical => "critical",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    Geometry,
    Topology,
    Units,
    Standards,
    File,
    System,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::Geometry => "geometry",
            IssueCategory::Topology => "topology",
            IssueCategory::Units => "units",
            IssueCategory::Standards => "standards",
            IssueCategory::File => "file",
            IssueCategory::System => "system",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            IssueCategory::Geometry => "Geometry",
            IssueCategory::Topology => "Topology",
            IssueCategory::Units => "Units & Measurement",
            IssueCategory::Standards => "IFC Standards",
            IssueCategory::File => "File Integrity",
            IssueCategory::System => "System",
        }
    }
}

/// One finding of the validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcIssue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl QcIssue {
    pub fn new(severity: IssueSeverity, category: IssueCategory, message: &str) -> Self {
        Self {
            severity,
            category,
            message: message.to_string(),
            element_id: None,
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    pub fn with_element(mut self, element_id: u32) -> Self {
        self.element_id = Some(element_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Passed,
    PassedWithWarnings,
    Failed,
}

/// Per-category tally
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub passed: bool,
    pub errors: usize,
    pub warnings: usize,
}

/// Result of validating one IFC file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcReport {
    pub valid: bool,
    pub confidence: f64,
    pub errors: Vec<QcIssue>,
    pub warnings: Vec<QcIssue>,
    pub info: Vec<QcIssue>,
    pub file_size: u64,
    pub element_counts: BTreeMap<String, usize>,
    pub schema_version: Option<String>,
    pub timestamp: String,
    pub overall_status: OverallStatus,
    pub categories: BTreeMap<String, CategorySummary>,
    pub recommendations: Vec<String>,
}

impl QcReport {
    /// A passing report with nothing in it
    pub fn empty(schema: &str) -> Self {
        Self {
            valid: true,
            confidence: 100.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
            file_size: 0,
            element_counts: BTreeMap::new(),
            schema_version: Some(schema.to_string()),
            timestamp: Utc::now().to_rfc3339(),
            overall_status: OverallStatus::Passed,
            categories: BTreeMap::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn critical_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.severity == IssueSeverity::Critical)
            .count()
    }

    pub fn element_count(&self, class: &str) -> usize {
        self.element_counts.get(class).copied().unwrap_or(0)
    }

    /// Fill in validity, confidence, status, categories and recommendations
    /// from the collected issues and element counts
    fn finalize(&mut self) {
        self.confidence = confidence_score(self);
        self.valid = self.critical_count() == 0;
        self.overall_status = if !self.valid {
            OverallStatus::Failed
        } else if self.warnings.is_empty() && self.errors.is_empty() {
            OverallStatus::Passed
        } else {
            OverallStatus::PassedWithWarnings
        };
        self.categories = summarize_categories(self);
        self.recommendations = recommendations(self);
    }
}

/// The 15 classes whose counts are surfaced in the report.
/// `IfcWall` includes `IfcWallStandardCase`.
pub fn counted_classes() -> [IfcClass; 15] {
    [
        IfcClass::Project,
        IfcClass::Site,
        IfcClass::Building,
        IfcClass::BuildingStorey,
        IfcClass::Wall,
        IfcClass::WallStandardCase,
        IfcClass::Slab,
        IfcClass::Roof,
        IfcClass::Door,
        IfcClass::Window,
        IfcClass::Space,
        IfcClass::Zone,
        IfcClass::Column,
        IfcClass::Beam,
        IfcClass::BuildingElementProxy,
    ]
}

/// Validate the IFC file at `path`. Never fails; problems become issues.
pub fn validate_ifc(path: &Path) -> QcReport {
    let start = Instant::now();
    let mut report = QcReport::empty("");
    report.schema_version = None;

    let metadata = match fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => {
            report.errors.push(
                QcIssue::new(IssueSeverity::Critical, IssueCategory::File, "IFC file does not exist")
                    .with_suggestion("Regenerate the IFC model"),
            );
            report.finalize();
            report.confidence = 0.0;
            warn!("QC: {} does not exist", path.display());
            return report;
        }
    };

    report.file_size = metadata.len();
    check_file_size(&mut report);

    match IfcFile::open(path) {
        Ok(file) => {
            report.schema_version = Some(file.schema.clone());
            report.element_counts = count_elements(&file);
            check_schema(&file, &mut report);
            check_geometry(&file, &mut report);
            check_topology(&file, &mut report);
            check_units(&file, &mut report);
        }
        Err(e) => {
            report.errors.push(
                QcIssue::new(
                    IssueSeverity::Critical,
                    IssueCategory::File,
                    &format!("Failed to parse IFC file: {:#}", e),
                )
                .with_suggestion("File may be corrupted or invalid IFC format"),
            );
        }
    }

    report.finalize();
    info!(
        "QC for {}: valid={}, confidence {:.1}, {} errors, {} warnings in {}ms",
        path.display(),
        report.valid,
        report.confidence,
        report.errors.len(),
        report.warnings.len(),
        start.elapsed().as_millis()
    );
    report
}

fn check_file_size(report: &mut QcReport) {
    let size = report.file_size;
    if size < MIN_FILE_SIZE {
        report.errors.push(QcIssue::new(
            IssueSeverity::Critical,
            IssueCategory::File,
            &format!("IFC file too small ({} bytes). Likely corrupted or empty.", size),
        ));
    } else if size > MAX_FILE_SIZE {
        report.warnings.push(QcIssue::new(
            IssueSeverity::Warning,
            IssueCategory::File,
            &format!(
                "IFC file very large ({:.1} MB). May cause performance issues.",
                size as f64 / 1024.0 / 1024.0
            ),
        ));
    }
}

fn count_elements(file: &IfcFile) -> BTreeMap<String, usize> {
    counted_classes()
        .iter()
        .map(|class| (class.name().to_string(), file.count(class)))
        .collect()
}

fn check_schema(file: &IfcFile, report: &mut QcReport) {
    let problems = file.validate();
    debug!("Schema validation returned {} problems", problems.len());
    if problems.is_empty() {
        report.info.push(QcIssue::new(
            IssueSeverity::Info,
            IssueCategory::Standards,
            &format!("{} schema validation passed", file.schema),
        ));
    }
    for problem in problems {
        report.errors.push(
            QcIssue::new(IssueSeverity::Critical, IssueCategory::Standards, &problem)
                .with_suggestion("Check IFC schema compliance"),
        );
    }
}

fn check_geometry(file: &IfcFile, report: &mut QcReport) {
    let walls = file.count(&IfcClass::Wall);
    if walls == 0 {
        report.errors.push(
            QcIssue::new(IssueSeverity::Critical, IssueCategory::Geometry, "No walls found in IFC model")
                .with_suggestion("Ensure walls are properly created during generation"),
        );
    } else if walls < FEW_WALLS {
        report.warnings.push(
            QcIssue::new(
                IssueSeverity::Warning,
                IssueCategory::Geometry,
                &format!("Very few walls detected ({})", walls),
            )
            .with_suggestion("Verify sketch detection captured all walls"),
        );
    } else {
        report.info.push(QcIssue::new(
            IssueSeverity::Info,
            IssueCategory::Geometry,
            &format!("{} walls found", walls),
        ));
    }

    if file.count(&IfcClass::Space) == 0 {
        report.warnings.push(
            QcIssue::new(IssueSeverity::Warning, IssueCategory::Geometry, "No spaces (rooms) defined in IFC")
                .with_suggestion("Consider adding IfcSpace elements for better BIM compatibility"),
        );
    }

    if file.count(&IfcClass::BuildingStorey) == 0 {
        report.warnings.push(
            QcIssue::new(IssueSeverity::Warning, IssueCategory::Geometry, "No building storeys defined")
                .with_suggestion("Add IfcBuildingStorey for proper building hierarchy"),
        );
    }
}

fn check_topology(file: &IfcFile, report: &mut QcReport) {
    if file.count(&IfcClass::Building) == 0 {
        report.warnings.push(
            QcIssue::new(IssueSeverity::Warning, IssueCategory::Topology, "No IfcBuilding element found")
                .with_suggestion("Add IfcBuilding as root element for proper structure"),
        );
    }

    for wall in file.by_class(&IfcClass::Wall) {
        if !file.has_placement(wall) {
            report.warnings.push(
                QcIssue::new(
                    IssueSeverity::Warning,
                    IssueCategory::Topology,
                    &format!("Wall #{} missing ObjectPlacement", wall.id),
                )
                .with_element(wall.id)
                .with_suggestion("Ensure all elements have proper placement"),
            );
        }
    }
}

fn check_units(file: &IfcFile, report: &mut QcReport) {
    if file.project().is_none() {
        report.warnings.push(
            QcIssue::new(IssueSeverity::Warning, IssueCategory::Units, "Could not verify units")
                .with_suggestion("Ensure project has proper unit definitions"),
        );
    } else if !file.has_units() {
        report.warnings.push(
            QcIssue::new(IssueSeverity::Warning, IssueCategory::Units, "No units defined in project")
                .with_suggestion("Define length, area, and volume units"),
        );
    }
}

/// 100 − 20·critical − 5·warnings − 30 (no walls) − 10 (no building)
/// + min(10, 2·non-zero element types), clamped to [0, 100]
pub fn confidence_score(report: &QcReport) -> f64 {
    let mut score = 100.0;
    score -= 20.0 * report.critical_count() as f64;
    score -= 5.0 * report.warnings.len() as f64;
    if report.element_count(IfcClass::Wall.name()) == 0 {
        score -= 30.0;
    }
    if report.element_count(IfcClass::Building.name()) == 0 {
        score -= 10.0;
    }
    let kinds = report.element_counts.values().filter(|&&c| c > 0).count();
    score += (2.0 * kinds as f64).min(10.0);
    score.clamp(0.0, 100.0)
}

fn summarize_categories(report: &QcReport) -> BTreeMap<String, CategorySummary> {
    let mut categories: BTreeMap<IssueCategory, CategorySummary> = BTreeMap::new();
    for issue in report.errors.iter().chain(&report.warnings) {
        let entry = categories.entry(issue.category).or_insert(CategorySummary {
            passed: true,
            ..Default::default()
        });
        if issue.severity == IssueSeverity::Critical {
            entry.errors += 1;
            entry.passed = false;
        } else {
            entry.warnings += 1;
        }
    }
    for issue in &report.info {
        categories.entry(issue.category).or_insert(CategorySummary {
            passed: true,
            ..Default::default()
        });
    }
    categories
        .into_iter()
        .map(|(k, v)| (k.as_str().to_string(), v))
        .collect()
}

fn recommendations(report: &QcReport) -> Vec<String> {
    let mut recs = Vec::new();
    let mut failing: BTreeMap<IssueCategory, usize> = BTreeMap::new();
    for issue in report.errors.iter().filter(|e| e.severity == IssueSeverity::Critical) {
        *failing.entry(issue.category).or_default() += 1;
    }

    for (category, count) in failing {
        let name = category.display_name();
        let rec = match category {
            IssueCategory::Geometry => format!(
                "Review {}: {} geometry issues found. Check wall connections, room boundaries, and opening placements.",
                name, count
            ),
            IssueCategory::Standards => format!(
                "Address {}: {} compliance issues. Review IFC schema compliance and standards adherence.",
                name, count
            ),
            IssueCategory::File => format!(
                "Fix {}: {} file issues. Regenerate the IFC model from the source sketch.",
                name, count
            ),
            _ => format!("Fix {}: {} issues.", name, count),
        };
        recs.push(rec);
    }

    if report.confidence < 50.0 {
        recs.push(format!(
            "Overall confidence is low ({:.1}%). Consider reviewing the source sketch quality or processing parameters.",
            report.confidence
        ));
    }
    recs
}

fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Plain-text rendering of a report
pub fn render_text(report: &QcReport, job_id: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "IFC Quality Control Report");
    let _ = writeln!(out, "{}\n", "=".repeat(50));
    let _ = writeln!(out, "Job ID: {}", job_id);
    let _ = writeln!(out, "Validation Time: {}", report.timestamp);
    let _ = writeln!(
        out,
        "IFC Schema: {}",
        report.schema_version.as_deref().filter(|s| !s.is_empty()).unwrap_or("Unknown")
    );
    let _ = writeln!(out, "File Size: {} bytes", format_thousands(report.file_size));
    let _ = writeln!(out, "Valid: {}", if report.valid { "Yes" } else { "No" });
    let _ = writeln!(out, "Confidence Score: {:.1}/100\n", report.confidence);

    let _ = writeln!(out, "Element Counts:");
    for (class, count) in &report.element_counts {
        let _ = writeln!(out, "  {}: {}", class, count);
    }
    out.push('\n');

    for (title, issues) in [("Errors", &report.errors), ("Warnings", &report.warnings)] {
        if issues.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{} ({}):", title, issues.len());
        for issue in issues {
            let _ = writeln!(
                out,
                "  [{}] {}: {}",
                issue.severity.as_str().to_uppercase(),
                issue.category.as_str(),
                issue.message
            );
            if let Some(suggestion) = &issue.suggestion {
                let _ = writeln!(out, "    Suggestion: {}", suggestion);
            }
        }
        out.push('\n');
    }

    if !report.recommendations.is_empty() {
        let _ = writeln!(out, "Recommendations:");
        for rec in &report.recommendations {
            let _ = writeln!(out, "  - {}", rec);
        }
    }
    out
}

/// Write `{job_id}_qc_report.json` and `{job_id}_qc_report.txt` into `out_dir`
pub fn write_qc_report(report: &QcReport, out_dir: &Path, job_id: &str) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let json_path = out_dir.join(format!("{}_qc_report.json", job_id));
    let json = serde_json::to_string_pretty(report).context("Failed to serialize QC report")?;
    write_atomic(&json_path, json.as_bytes())?;

    let txt_path = out_dir.join(format!("{}_qc_report.txt", job_id));
    write_atomic(&txt_path, render_text(report, job_id).as_bytes())?;

    debug!("QC report written to {}", json_path.display());
    Ok((json_path, txt_path))
}
