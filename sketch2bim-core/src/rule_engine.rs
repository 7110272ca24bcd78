//! Project rules over a generated IFC file: naming conventions, required
//! metadata, property values and structural relationships.
//!
//! Rules are plain data so they can be kept in a JSON rule set next to a
//! project and loaded at run time.

use anyhow::{Context, Result};
use chrono::Utc;
use ifc_step::model::IfcClass;
use ifc_step::{IfcFile, StepEntity, StepValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::exporter::write_atomic;
use crate::ids_validator::{display_value, value_matches};
use crate::ifc_validator::IssueSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Naming,
    Metadata,
    Property,
    Structure,
    /// Carried in rule sets but has no built-in check
    Custom,
}

/// Settings for every rule type; each type reads only its own fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ifc_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_psets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_properties: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_relationships: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub required_containment: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_severity() -> IssueSeverity {
    IssueSeverity::Warning
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rule_type: RuleType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_severity")]
    pub severity: IssueSeverity,
    #[serde(default)]
    pub config: RuleConfig,
}

impl ValidationRule {
    pub fn new(name: &str, description: &str, rule_type: RuleType, config: RuleConfig) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            rule_type,
            enabled: true,
            severity: IssueSeverity::Warning,
            config,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_severity(mut self, severity: IssueSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// On-disk rule set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCheck {
    pub rule_name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    pub message: String,
    pub severity: IssueSeverity,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleValidationReport {
    pub project_name: Option<String>,
    pub validation_timestamp: String,
    pub total_rules: usize,
    pub enabled_rules: usize,
    /// Per element check
    pub passed_rules: usize,
    pub failed_rules: usize,
    pub pass_rate: f64,
    pub results: Vec<RuleCheck>,
}

impl RuleValidationReport {
    fn new(project_name: Option<String>, total_rules: usize, enabled_rules: usize, results: Vec<RuleCheck>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        Self {
            project_name,
            validation_timestamp: Utc::now().to_rfc3339(),
            total_rules,
            enabled_rules,
            passed_rules: passed,
            failed_rules: failed,
            pass_rate: if results.is_empty() {
                100.0
            } else {
                passed as f64 / results.len() as f64 * 100.0
            },
            results,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed_rules == 0
    }

    /// Failed checks at critical severity
    pub fn critical_failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.passed && r.severity == IssueSeverity::Critical)
            .count()
    }
}

/// Result of one check before it is tagged with rule and element
struct Verdict {
    passed: bool,
    message: String,
    details: BTreeMap<String, Vec<String>>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
            details: BTreeMap::new(),
        }
    }

    fn fail(message: String) -> Self {
        Self {
            passed: false,
            message,
            details: BTreeMap::new(),
        }
    }
}

pub struct RuleEngine {
    rules: Vec<ValidationRule>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Engine preloaded with the built-in rules
    pub fn new() -> Self {
        let mut engine = Self::empty();
        for rule in builtin_rules() {
            engine.add_rule(rule);
        }
        engine
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    /// Add a rule, replacing any rule with the same name
    pub fn add_rule(&mut self, rule: ValidationRule) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.rules.len() != before
    }

    /// Merge the rules of a JSON rule set. Returns how many were read.
    pub fn load_rules_from_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path).with_context(|| format!("Rules file not found: {}", path.display()))?;
        let set: RuleSet = serde_json::from_str(&text).with_context(|| format!("Invalid rules file {}", path.display()))?;
        let count = set.rules.len();
        for rule in set.rules {
            self.add_rule(rule);
        }
        info!("Loaded {} rules from {}", count, path.display());
        Ok(count)
    }

    pub fn save_rules_to_file(&self, path: &Path) -> Result<()> {
        let set = RuleSet {
            version: "1.0".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            rules: self.rules.clone(),
        };
        let json = serde_json::to_string_pretty(&set).context("Failed to serialize rules")?;
        write_atomic(path, json.as_bytes())?;
        info!("Saved {} rules to {}", self.rules.len(), path.display());
        Ok(())
    }

    /// Validate the IFC file at `path`. Never fails; unreadable files become a failed check.
    pub fn validate_ifc(&self, path: &Path, enabled_only: bool) -> RuleValidationReport {
        let unusable = |name: &str, message: String| {
            let check = RuleCheck {
                rule_name: name.to_string(),
                passed: false,
                element_id: None,
                element_type: None,
                message,
                severity: IssueSeverity::Critical,
                details: BTreeMap::new(),
            };
            RuleValidationReport::new(None, self.rules.len(), 0, vec![check])
        };
        if !path.is_file() {
            return unusable("File Access", format!("IFC file not found: {}", path.display()));
        }
        match IfcFile::open(path) {
            Ok(file) => self.check_file(&file, enabled_only),
            Err(e) => {
                warn!("Rules: failed to open {}: {:#}", path.display(), e);
                unusable("IFC Parsing", format!("Failed to parse IFC file: {:#}", e))
            }
        }
    }

    pub fn check_file(&self, file: &IfcFile, enabled_only: bool) -> RuleValidationReport {
        let active: Vec<&ValidationRule> = self.rules.iter().filter(|r| r.enabled || !enabled_only).collect();
        let results = active.iter().flat_map(|rule| check_rule(file, rule)).collect();
        let project = file.project().and_then(|p| p.name()).map(str::to_string);
        RuleValidationReport::new(project, self.rules.len(), active.len(), results)
    }
}

fn builtin_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::new(
            "Wall Naming Convention",
            "Walls should follow naming convention (e.g., WALL-###)",
            RuleType::Naming,
            RuleConfig {
                ifc_class: Some("IfcWall".into()),
                pattern: Some(r"^[A-Z]+\d+.*".into()),
                ..RuleConfig::default()
            },
        ),
        ValidationRule::new(
            "Wall Metadata Required",
            "Walls must have basic metadata (Pset_WallCommon)",
            RuleType::Metadata,
            RuleConfig {
                ifc_class: Some("IfcWall".into()),
                required_psets: vec!["Pset_WallCommon".into()],
                ..RuleConfig::default()
            },
        ),
        ValidationRule::new(
            "Door Property Required",
            "Doors should have FireRating property",
            RuleType::Property,
            RuleConfig {
                ifc_class: Some("IfcDoor".into()),
                property_set: Some("Pset_DoorCommon".into()),
                property_name: Some("FireRating".into()),
                value_type: Some("string".into()),
                ..RuleConfig::default()
            },
        )
        .disabled(),
    ]
}

/// Starter rule sets: `residential`, `commercial`; anything else is empty
pub fn rule_template(name: &str) -> RuleSet {
    let rules = match name {
        "residential" => vec![
            ValidationRule::new(
                "Wall Naming - Residential",
                "Walls should be named WALL-###",
                RuleType::Naming,
                RuleConfig {
                    ifc_class: Some("IfcWall".into()),
                    pattern: Some(r"^WALL-\d+.*".into()),
                    prefix: Some("WALL-".into()),
                    ..RuleConfig::default()
                },
            ),
            ValidationRule::new(
                "Room Metadata - Residential",
                "Spaces must have RoomType and Area",
                RuleType::Metadata,
                RuleConfig {
                    ifc_class: Some("IfcSpace".into()),
                    required_properties: vec!["RoomType".into(), "Area".into()],
                    ..RuleConfig::default()
                },
            ),
        ],
        "commercial" => vec![ValidationRule::new(
            "Fire Rating Required",
            "Doors and walls must have fire rating",
            RuleType::Property,
            RuleConfig {
                ifc_class: Some("IfcDoor".into()),
                property_set: Some("Pset_DoorCommon".into()),
                property_name: Some("FireRating".into()),
                value_type: Some("string".into()),
                ..RuleConfig::default()
            },
        )
        .with_severity(IssueSeverity::Critical)],
        _ => Vec::new(),
    };
    RuleSet {
        version: "1.0".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        rules,
    }
}

pub fn write_rule_template(name: &str, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&rule_template(name)).context("Failed to serialize rule template")?;
    write_atomic(path, json.as_bytes())?;
    info!("Created rule template '{}' at {}", name, path.display());
    Ok(())
}

fn check_rule(file: &IfcFile, rule: &ValidationRule) -> Vec<RuleCheck> {
    let tagged = |element: Option<&StepEntity>, verdict: Verdict| RuleCheck {
        rule_name: rule.name.clone(),
        passed: verdict.passed,
        element_id: element.map(|e| e.id.to_string()),
        element_type: element.map(|e| e.class().name().to_string()),
        message: verdict.message,
        severity: rule.severity,
        details: verdict.details,
    };

    let Some(class) = rule.config.ifc_class.as_deref() else {
        warn!("Rule '{}' has no ifc_class specified", rule.name);
        return vec![tagged(None, Verdict::fail("Rule has no ifc_class specified".to_string()))];
    };
    let elements = file.by_class(&IfcClass::from_name(class));
    debug!("Rule '{}': {} {} elements", rule.name, elements.len(), class);
    if elements.is_empty() {
        let verdict = Verdict {
            message: format!("No {} elements found (rule satisfied by absence)", class),
            ..Verdict::pass()
        };
        return vec![tagged(None, verdict)];
    }

    let naming = match rule.rule_type {
        RuleType::Naming => {
            let pattern = rule.config.pattern.as_deref().unwrap_or(".*");
            match Regex::new(&format!("^(?:{})", pattern)) {
                Ok(re) => Some(re),
                Err(e) => {
                    let verdict = Verdict::fail(format!("Invalid naming pattern '{}': {}", pattern, e));
                    return vec![tagged(None, verdict)];
                }
            }
        }
        _ => None,
    };

    elements
        .into_iter()
        .filter_map(|element| {
            let verdict = match rule.rule_type {
                RuleType::Naming => check_naming(element, &rule.config, naming.as_ref()?),
                RuleType::Metadata => check_metadata(file, element, &rule.config),
                RuleType::Property => check_property(file, element, &rule.config),
                RuleType::Structure => check_structure(file, element, &rule.config),
                RuleType::Custom => return None,
            };
            Some(tagged(Some(element), verdict))
        })
        .collect()
}

fn check_naming(element: &StepEntity, config: &RuleConfig, pattern: &Regex) -> Verdict {
    let Some(name) = element.name().filter(|n| !n.is_empty()) else {
        return Verdict::fail(format!("Element #{} missing Name property", element.id));
    };
    if !pattern.is_match(name) {
        return Verdict::fail(format!(
            "Element name '{}' does not match pattern '{}'",
            name,
            config.pattern.as_deref().unwrap_or(".*")
        ));
    }
    if let Some(prefix) = config.prefix.as_deref().filter(|p| !name.starts_with(p)) {
        return Verdict::fail(format!("Element name '{}' should start with '{}'", name, prefix));
    }
    if let Some(suffix) = config.suffix.as_deref().filter(|s| !name.ends_with(s)) {
        return Verdict::fail(format!("Element name '{}' should end with '{}'", name, suffix));
    }
    Verdict::pass()
}

fn check_metadata(file: &IfcFile, element: &StepEntity, config: &RuleConfig) -> Verdict {
    let psets = file.property_sets(element.id);
    let missing_psets: Vec<String> = config
        .required_psets
        .iter()
        .filter(|want| !psets.iter().any(|(name, _)| name == *want))
        .cloned()
        .collect();
    let missing_properties: Vec<String> = config
        .required_properties
        .iter()
        .filter(|want| !psets.iter().any(|(_, props)| props.iter().any(|(name, _)| name == *want)))
        .cloned()
        .collect();
    if missing_psets.is_empty() && missing_properties.is_empty() {
        return Verdict::pass();
    }

    let mut messages = Vec::new();
    if !missing_psets.is_empty() {
        messages.push(format!("Missing property sets: {}", missing_psets.join(", ")));
    }
    if !missing_properties.is_empty() {
        messages.push(format!("Missing properties: {}", missing_properties.join(", ")));
    }
    let mut verdict = Verdict::fail(messages.join("; "));
    verdict.details.insert("missing_psets".to_string(), missing_psets);
    verdict.details.insert("missing_properties".to_string(), missing_properties);
    verdict
}

fn check_property(file: &IfcFile, element: &StepEntity, config: &RuleConfig) -> Verdict {
    let Some(property) = config.property_name.as_deref() else {
        return Verdict::pass();
    };
    let psets = file.property_sets(element.id);
    let found = psets
        .iter()
        .filter(|(pset, _)| config.property_set.as_deref().map_or(true, |want| want == pset.as_str()))
        .flat_map(|(_, props)| props.iter())
        .find(|(name, _)| name == property)
        .map(|(_, value)| value);

    let Some(value) = found else {
        return Verdict::fail(format!("Property '{}' not found", property));
    };
    if matches!(value, StepValue::Null) {
        return Verdict::fail(format!("Property '{}' has no value", property));
    }
    if let Some(expected) = &config.expected_value {
        let expected = match expected {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !value_matches(value, &expected) {
            return Verdict::fail(format!(
                "Property '{}' value mismatch: expected {}, got {}",
                property,
                expected,
                display_value(value)
            ));
        }
    }
    Verdict::pass()
}

fn check_structure(file: &IfcFile, element: &StepEntity, config: &RuleConfig) -> Verdict {
    let mut issues = Vec::new();
    if config.required_containment && !file.relates_to("IFCRELCONTAINEDINSPATIALSTRUCTURE", element.id) {
        issues.push("Element not contained in structure".to_string());
    }
    for rel in &config.required_relationships {
        if !file.relates_to(rel, element.id) {
            issues.push(format!("Missing relationship: {}", rel));
        }
    }
    if issues.is_empty() {
        Verdict::pass()
    } else {
        Verdict::fail(issues.join("; "))
    }
}

pub fn write_rule_report(report: &RuleValidationReport, out_dir: &Path, job_id: &str) -> Result<PathBuf> {
    let path = out_dir.join(format!("{}_rule_validation.json", job_id));
    let json = serde_json::to_string_pretty(report).context("Failed to serialize rule report")?;
    write_atomic(&path, json.as_bytes())?;
    Ok(path)
}

/// Built-in rules plus an optional rule set, validated and written as
/// `{job_id}_rule_validation.json`
pub fn run_rule_validation(
    rules_path: Option<&Path>,
    ifc_path: &Path,
    out_dir: &Path,
    job_id: &str,
) -> Result<(PathBuf, RuleValidationReport)> {
    let mut engine = RuleEngine::new();
    if let Some(path) = rules_path {
        engine.load_rules_from_file(path)?;
    }
    let report = engine.validate_ifc(ifc_path, true);
    let path = write_rule_report(&report, out_dir, job_id)?;
    info!(
        "Rule validation complete: {}/{} checks passed over {} rules",
        report.passed_rules,
        report.results.len(),
        report.enabled_rules
    );
    Ok((path, report))
}
