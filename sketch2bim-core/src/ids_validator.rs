//! IDS (Information Delivery Specification) checks.
//!
//! Reads a buildingSMART IDS document into requirements and checks a
//! generated IFC file against them through the STEP reader. Both the
//! attribute form (`<entity name="IfcWall">`) and IDS 1.0 `simpleValue`
//! facets are accepted. Namespace prefixes are ignored.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use ifc_step::model::IfcClass;
use ifc_step::{IfcFile, StepEntity, StepValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::exporter::write_atomic;

const MARKUP_PATTERN: &str = r#"(?s)<!--.*?-->|<\?.*?\?>|<!\[CDATA\[(.*?)\]\]>|<![^>]*>|<(/?)([A-Za-z_][\w:.\-]*)((?:\s+[A-Za-z_][\w:.\-]*\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#;
const ATTRIBUTE_PATTERN: &str = r#"([A-Za-z_][\w:.\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#;

fn compiled(cell: &'static OnceLock<Result<Regex, regex::Error>>, pattern: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| anyhow!("Invalid XML pattern: {}", e))
}

/// Element tree with local names only
#[derive(Debug, Clone, Default, PartialEq)]
struct XmlElement {
    name: String,
    attrs: BTreeMap<String, String>,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn find(&self, name: &str) -> Option<&XmlElement> {
        self.children
            .iter()
            .find_map(|c| if c.name == name { Some(c) } else { c.find(name) })
    }

    /// Descendants named `name`, without looking inside `skip` elements
    fn collect<'a>(&'a self, name: &str, skip: Option<&str>, out: &mut Vec<&'a XmlElement>) {
        for c in &self.children {
            if c.name == name {
                out.push(c);
            }
            if skip != Some(c.name.as_str()) {
                c.collect(name, skip, out);
            }
        }
    }

    fn find_all(&self, name: &str, skip: Option<&str>) -> Vec<&XmlElement> {
        let mut out = Vec::new();
        self.collect(name, skip, &mut out);
        out
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Own text, or the text of a nested `simpleValue`
    fn value(&self) -> Option<String> {
        let own = self.text.trim();
        if !own.is_empty() {
            return Some(own.to_string());
        }
        self.find("simpleValue")
            .map(|v| v.text.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// `name` attribute, else the value of a `name` child
    fn named(&self) -> Option<String> {
        self.attr("name")
            .map(str::to_string)
            .or_else(|| self.child("name").and_then(XmlElement::value))
    }
}

fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => bail!("Multiple root elements"),
        None => *root = Some(element),
    }
    Ok(())
}

fn parse_xml(text: &str) -> Result<XmlElement> {
    static MARKUP: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    static ATTRIBUTE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    let markup = compiled(&MARKUP, MARKUP_PATTERN)?;
    let attribute = compiled(&ATTRIBUTE, ATTRIBUTE_PATTERN)?;

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root = None;
    let mut last = 0;
    for caps in markup.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if let Some(top) = stack.last_mut() {
            top.text.push_str(&decode_entities(&text[last..whole.start()]));
        }
        last = whole.end();

        if let Some(cdata) = caps.get(1) {
            if let Some(top) = stack.last_mut() {
                top.text.push_str(cdata.as_str());
            }
            continue;
        }
        // comments, declarations, processing instructions
        let Some(tag) = caps.get(3) else {
            continue;
        };
        let name = local_name(tag.as_str()).to_string();
        let closing = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
        let self_closing = caps.get(5).is_some_and(|m| !m.as_str().is_empty());

        if closing {
            let element = stack
                .pop()
                .ok_or_else(|| anyhow!("Unexpected closing tag </{}>", name))?;
            if element.name != name {
                bail!("Mismatched closing tag </{}> for <{}>", name, element.name);
            }
            attach(&mut stack, &mut root, element)?;
            continue;
        }

        let mut element = XmlElement {
            name,
            ..XmlElement::default()
        };
        if let Some(attrs) = caps.get(4) {
            for a in attribute.captures_iter(attrs.as_str()) {
                let key = local_name(&a[1]).to_string();
                let value = a.get(2).or_else(|| a.get(3)).map(|v| decode_entities(v.as_str()));
                element.attrs.insert(key, value.unwrap_or_default());
            }
        }
        if self_closing {
            attach(&mut stack, &mut root, element)?;
        } else {
            stack.push(element);
        }
    }
    if let Some(open) = stack.last() {
        bail!("Unclosed element <{}>", open.name);
    }
    root.ok_or_else(|| anyhow!("No root element"))
}

/// `cardinality` (IDS 1.0) or `required` attribute; required unless stated otherwise
fn is_required(element: &XmlElement) -> bool {
    if let Some(cardinality) = element.attr("cardinality") {
        return cardinality.trim().eq_ignore_ascii_case("required");
    }
    element
        .attr("required")
        .map(|r| r.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySetRequirement {
    pub name: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRequirement {
    pub name: String,
    pub required: bool,
    /// Restricts the lookup to one property set
    pub property_set: Option<String>,
    pub value_type: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRequirement {
    pub system: Option<String>,
    pub required: bool,
}

/// One IDS `specification`: an applicable class plus the facets it must carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdsRequirement {
    pub name: String,
    pub ifc_class: String,
    pub predefined_type: Option<String>,
    pub property_sets: Vec<PropertySetRequirement>,
    pub properties: Vec<PropertyRequirement>,
    pub material_required: bool,
    pub classification: Option<ClassificationRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdsSpecification {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub date: Option<String>,
    pub requirements: Vec<IdsRequirement>,
}

impl IdsSpecification {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("IDS file not found: {}", path.display()))?;
        let spec = Self::parse(&text).with_context(|| format!("Invalid IDS file {}", path.display()))?;
        info!(
            "Parsed IDS specification: {} with {} requirements",
            spec.name,
            spec.requirements.len()
        );
        Ok(spec)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let root = parse_xml(text)?;
        let info = root.find("info");
        let field = |name: &str| info.and_then(|i| i.child(name)).and_then(XmlElement::value);

        let requirements = root
            .find_all("specification", None)
            .into_iter()
            .filter_map(parse_requirement)
            .collect();

        Ok(Self {
            name: field("title").or_else(|| field("name")).unwrap_or_default(),
            version: field("version").unwrap_or_else(|| "1.0".to_string()),
            description: field("description"),
            author: field("author"),
            date: field("date"),
            requirements,
        })
    }
}

fn parse_requirement(spec: &XmlElement) -> Option<IdsRequirement> {
    let name = spec.named().unwrap_or_else(|| "Unnamed Requirement".to_string());
    let entity = spec.child("applicability").and_then(|a| a.find("entity"));
    let Some(ifc_class) = entity.and_then(XmlElement::named).filter(|c| !c.is_empty()) else {
        warn!("IDS requirement '{}' has no applicable entity, skipped", name);
        return None;
    };
    let predefined_type = entity
        .and_then(|e| e.child("predefinedType"))
        .and_then(|p| p.attr("name").map(str::to_string).or_else(|| p.value()));

    let scope = spec.child("requirements").unwrap_or(spec);
    let property_sets = scope
        .find_all("propertySet", Some("property"))
        .into_iter()
        .filter_map(|pset| {
            let name = pset.named().or_else(|| pset.value())?;
            Some(PropertySetRequirement {
                name,
                required: is_required(pset),
            })
        })
        .collect();
    let properties = scope
        .find_all("property", None)
        .into_iter()
        .filter_map(|prop| {
            let name = prop
                .child("name")
                .or_else(|| prop.child("baseName"))
                .and_then(XmlElement::value)?;
            let value = prop.child("value");
            Some(PropertyRequirement {
                name,
                required: is_required(prop),
                property_set: prop.child("propertySet").and_then(XmlElement::value),
                value_type: value
                    .and_then(|v| v.attr("type"))
                    .or_else(|| prop.attr("dataType"))
                    .map(str::to_string),
                value: value.and_then(XmlElement::value),
            })
        })
        .collect();
    let material_required = scope.find("material").map(is_required).unwrap_or(false);
    let classification = scope.find("classification").map(|c| ClassificationRequirement {
        system: c
            .attr("system")
            .map(str::to_string)
            .or_else(|| c.child("system").and_then(XmlElement::value)),
        required: is_required(c),
    });

    Some(IdsRequirement {
        name,
        ifc_class,
        predefined_type,
        property_sets,
        properties,
        material_required,
        classification,
    })
}

/// Outcome for one element (or one requirement with no elements)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdsCheck {
    pub passed: bool,
    pub requirement_name: String,
    pub ifc_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl IdsCheck {
    fn new(requirement: &IdsRequirement, element: Option<&StepEntity>, passed: bool, message: String) -> Self {
        Self {
            passed,
            requirement_name: requirement.name.clone(),
            ifc_class: requirement.ifc_class.clone(),
            element_id: element.map(|e| e.id.to_string()),
            element_type: element.map(|e| e.class().name().to_string()),
            message,
            details: BTreeMap::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: &str) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdsValidationReport {
    pub specification_name: String,
    pub specification_version: String,
    pub validation_timestamp: String,
    /// Counts are per check, not per IDS specification
    pub total_requirements: usize,
    pub passed_requirements: usize,
    pub failed_requirements: usize,
    pub pass_rate: f64,
    pub all_passed: bool,
    pub results: Vec<IdsCheck>,
}

impl IdsValidationReport {
    fn from_checks(spec: &IdsSpecification, results: Vec<IdsCheck>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        Self {
            specification_name: spec.name.clone(),
            specification_version: spec.version.clone(),
            validation_timestamp: Utc::now().to_rfc3339(),
            total_requirements: results.len(),
            passed_requirements: passed,
            failed_requirements: failed,
            pass_rate: if results.is_empty() {
                0.0
            } else {
                passed as f64 / results.len() as f64 * 100.0
            },
            all_passed: failed == 0,
            results,
        }
    }

    /// The file could not be checked at all
    fn unusable(spec: &IdsSpecification, stage: &str, message: String) -> Self {
        let check = IdsCheck {
            passed: false,
            requirement_name: stage.to_string(),
            ifc_class: String::new(),
            element_id: None,
            element_type: None,
            message,
            details: BTreeMap::new(),
        };
        Self::from_checks(spec, vec![check])
    }
}

/// Validate the IFC file at `path`. Never fails; unreadable files become a failed check.
pub fn validate_ifc_against_ids(path: &Path, spec: &IdsSpecification) -> IdsValidationReport {
    if !path.is_file() {
        return IdsValidationReport::unusable(spec, "File Access", format!("IFC file not found: {}", path.display()));
    }
    match IfcFile::open(path) {
        Ok(file) => check_file(&file, spec),
        Err(e) => {
            warn!("IDS: failed to open {}: {:#}", path.display(), e);
            IdsValidationReport::unusable(spec, "IFC Parsing", format!("Failed to parse IFC file: {:#}", e))
        }
    }
}

pub fn check_file(file: &IfcFile, spec: &IdsSpecification) -> IdsValidationReport {
    let mut results = Vec::new();
    for requirement in &spec.requirements {
        let elements = file.by_class(&IfcClass::from_name(&requirement.ifc_class));
        debug!("IDS '{}': {} {} elements", requirement.name, elements.len(), requirement.ifc_class);
        if elements.is_empty() {
            results.push(IdsCheck::new(
                requirement,
                None,
                false,
                format!("No {} elements found in IFC file", requirement.ifc_class),
            ));
            continue;
        }
        results.extend(elements.into_iter().map(|e| check_element(file, e, requirement)));
    }
    IdsValidationReport::from_checks(spec, results)
}

fn check_element(file: &IfcFile, element: &StepEntity, requirement: &IdsRequirement) -> IdsCheck {
    let fail = |message: String| IdsCheck::new(requirement, Some(element), false, message);

    if let Some(expected) = &requirement.predefined_type {
        let actual = element.predefined_type().unwrap_or("NOTDEFINED");
        if !actual.eq_ignore_ascii_case(expected) {
            return fail(format!("PredefinedType mismatch: expected {}, got {}", expected, actual))
                .with_detail("expected_type", expected)
                .with_detail("actual_type", actual);
        }
    }

    let psets = file.property_sets(element.id);
    let pset_names: HashSet<&str> = psets.iter().map(|(name, _)| name.as_str()).collect();
    for pset in requirement.property_sets.iter().filter(|p| p.required) {
        if !pset_names.contains(pset.name.as_str()) {
            return fail(format!("Required property set '{}' not found", pset.name)).with_detail("missing_pset", &pset.name);
        }
    }

    for prop in requirement.properties.iter().filter(|p| p.required) {
        let found = psets
            .iter()
            .filter(|(pset, _)| prop.property_set.as_deref().map_or(true, |want| want == pset.as_str()))
            .flat_map(|(_, props)| props.iter())
            .find(|(name, _)| *name == prop.name)
            .map(|(_, value)| value);
        let Some(actual) = found else {
            return fail(format!("Required property '{}' not found", prop.name)).with_detail("missing_property", &prop.name);
        };
        if let Some(expected) = &prop.value {
            if !value_matches(actual, expected) {
                let shown = display_value(actual);
                return fail(format!(
                    "Property '{}' value mismatch: expected {}, got {}",
                    prop.name, expected, shown
                ))
                .with_detail("property", &prop.name)
                .with_detail("expected", expected)
                .with_detail("actual", &shown);
            }
        }
    }

    if requirement.material_required && !file.has_material(element.id) {
        return fail("Required material not found".to_string());
    }

    if let Some(classification) = requirement.classification.as_ref().filter(|c| c.required) {
        if !file.relates_to("IFCRELASSOCIATESCLASSIFICATION", element.id) {
            let check = fail("Required classification not found".to_string());
            return match &classification.system {
                Some(system) => check.with_detail("system", system),
                None => check,
            };
        }
    }

    IdsCheck::new(requirement, Some(element), true, "Requirement satisfied".to_string())
}

fn inner_enum(value: &StepValue) -> Option<&str> {
    match value {
        StepValue::Enum(e) => Some(e),
        StepValue::Typed(_, inner) if inner.len() == 1 => inner_enum(&inner[0]),
        _ => None,
    }
}

/// Compare a STEP property value with a textual expectation.
/// Numbers compare with a relative tolerance, `.T.`/`.F.` match true/false.
pub(crate) fn value_matches(actual: &StepValue, expected: &str) -> bool {
    let expected = expected.trim();
    if let Some(s) = actual.as_str() {
        return s == expected;
    }
    if let Some(v) = actual.as_f64() {
        return expected
            .parse::<f64>()
            .map(|e| (e - v).abs() <= 1e-6 * e.abs().max(1.0))
            .unwrap_or(false);
    }
    match inner_enum(actual) {
        Some("T") => expected.eq_ignore_ascii_case("true"),
        Some("F") => expected.eq_ignore_ascii_case("false"),
        Some(e) => e.eq_ignore_ascii_case(expected),
        None => false,
    }
}

pub(crate) fn display_value(value: &StepValue) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    if let Some(v) = value.as_f64() {
        return v.to_string();
    }
    match inner_enum(value) {
        Some("T") => "true".to_string(),
        Some("F") => "false".to_string(),
        Some(e) => e.to_string(),
        None => "None".to_string(),
    }
}

pub fn write_ids_report(report: &IdsValidationReport, out_dir: &Path, job_id: &str) -> Result<PathBuf> {
    let path = out_dir.join(format!("{}_ids_validation.json", job_id));
    let json = serde_json::to_string_pretty(report).context("Failed to serialize IDS report")?;
    write_atomic(&path, json.as_bytes())?;
    Ok(path)
}

/// Load the IDS file, validate and write `{job_id}_ids_validation.json`
pub fn run_ids_validation(
    ids_path: &Path,
    ifc_path: &Path,
    out_dir: &Path,
    job_id: &str,
) -> Result<(PathBuf, IdsValidationReport)> {
    let spec = IdsSpecification::load(ids_path)?;
    let report = validate_ifc_against_ids(ifc_path, &spec);
    let path = write_ids_report(&report, out_dir, job_id)?;
    info!(
        "IDS validation complete: {} ({}/{} checks passed)",
        if report.all_passed { "PASSED" } else { "FAILED" },
        report.passed_requirements,
        report.total_requirements
    );
    Ok((path, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifc_generator::generate_ifc_detailed;
    use crate::plan::{PlanData, Point, Room, RoomType, Wall};

    const LEGACY_IDS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- project delivery rules -->
<ids:ids xmlns:ids="http://standards.buildingsmart.org/IDS">
  <ids:info>
    <ids:name>Residential &amp; Small Commercial</ids:name>
    <ids:version>2.1</ids:version>
    <ids:author>bim@example.com</ids:author>
  </ids:info>
  <ids:specifications>
    <ids:specification>
      <ids:name>Walls carry common properties</ids:name>
      <ids:applicability>
        <ids:entity name="IfcWall"/>
      </ids:applicability>
      <ids:requirements>
        <ids:propertySet required="true"><ids:name>Pset_WallCommon</ids:name></ids:propertySet>
        <ids:property required="true">
          <ids:name>Thickness</ids:name>
          <ids:value type="IfcLengthMeasure">200</ids:value>
        </ids:property>
      </ids:requirements>
    </ids:specification>
    <ids:specification>
      <ids:name>Floors are typed</ids:name>
      <ids:applicability>
        <ids:entity name="IFCSLAB"><ids:predefinedType name="FLOOR"/></ids:entity>
      </ids:applicability>
    </ids:specification>
    <ids:specification>
      <ids:name>No entity here</ids:name>
      <ids:applicability/>
    </ids:specification>
  </ids:specifications>
</ids:ids>"#;

    const IDS_V1: &str = r#"<ids xmlns="http://standards.buildingsmart.org/IDS">
  <info><title>Spaces</title></info>
  <specifications>
    <specification name="Spaces know their type" ifcVersion="IFC4">
      <applicability minOccurs="1">
        <entity><name><simpleValue>IFCSPACE</simpleValue></name></entity>
      </applicability>
      <requirements>
        <property cardinality="required" dataType="IFCLABEL">
          <propertySet><simpleValue>Pset_SpaceCommon</simpleValue></propertySet>
          <baseName><simpleValue>RoomType</simpleValue></baseName>
          <value><simpleValue>kitchen</simpleValue></value>
        </property>
        <material cardinality="optional"/>
      </requirements>
    </specification>
  </specifications>
</ids>"#;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sketch2bim_ids_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn square_plan(room_type: RoomType) -> PlanData {
        let mut plan = PlanData::empty(0.01);
        let corners = [(0.0, 0.0), (600.0, 0.0), (600.0, 400.0), (0.0, 400.0)];
        for i in 0..4 {
            let (a, b) = (corners[i], corners[(i + 1) % 4]);
            plan.walls.push(Wall::new(Point::new(a.0, a.1), Point::new(b.0, b.1), 0.01));
        }
        plan.rooms.push(Room {
            id: 0,
            polygon: corners.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            area_pixels: 240_000.0,
            area_meters: 24.0,
            room_type,
            is_nested: false,
            aspect_ratio: 1.5,
            solidity: 1.0,
            classification_confidence: None,
            classification_method: None,
            classification_reasoning: None,
        });
        plan
    }

    fn generated(dir: &Path, room_type: RoomType) -> PathBuf {
        let path = dir.join("model.ifc");
        generate_ifc_detailed(&square_plan(room_type), &path, None).unwrap();
        path
    }

    #[test]
    fn test_parse_attribute_form() {
        let spec = IdsSpecification::parse(LEGACY_IDS).unwrap();
        assert_eq!(spec.name, "Residential & Small Commercial");
        assert_eq!(spec.version, "2.1");
        assert_eq!(spec.author.as_deref(), Some("bim@example.com"));
        // the specification without an entity is dropped
        assert_eq!(spec.requirements.len(), 2);

        let walls = &spec.requirements[0];
        assert_eq!(walls.ifc_class, "IfcWall");
        assert_eq!(
            walls.property_sets,
            vec![PropertySetRequirement {
                name: "Pset_WallCommon".into(),
                required: true
            }]
        );
        assert_eq!(walls.properties[0].name, "Thickness");
        assert_eq!(walls.properties[0].value.as_deref(), Some("200"));
        assert_eq!(walls.properties[0].value_type.as_deref(), Some("IfcLengthMeasure"));
        assert!(!walls.material_required);

        assert_eq!(spec.requirements[1].predefined_type.as_deref(), Some("FLOOR"));
    }

    #[test]
    fn test_parse_simple_value_form() {
        let spec = IdsSpecification::parse(IDS_V1).unwrap();
        assert_eq!(spec.name, "Spaces");
        assert_eq!(spec.version, "1.0");

        let req = &spec.requirements[0];
        assert_eq!(req.name, "Spaces know their type");
        assert_eq!(req.ifc_class, "IFCSPACE");
        // a property's own property set is a lookup scope, not a separate facet
        assert!(req.property_sets.is_empty());
        assert_eq!(req.properties[0].property_set.as_deref(), Some("Pset_SpaceCommon"));
        assert_eq!(req.properties[0].value_type.as_deref(), Some("IFCLABEL"));
        assert!(!req.material_required);
    }

    #[test]
    fn test_parse_rejects_malformed_xml() {
        assert!(IdsSpecification::parse("<ids><info></ids>").is_err());
        assert!(IdsSpecification::parse("<ids>").is_err());
        assert!(IdsSpecification::parse("no markup at all").is_err());
    }

    #[test]
    fn test_generated_model_meets_wall_and_floor_requirements() {
        let dir = temp_dir();
        let ifc = generated(&dir, RoomType::Kitchen);
        let spec = IdsSpecification::parse(LEGACY_IDS).unwrap();

        let report = validate_ifc_against_ids(&ifc, &spec);
        assert!(report.all_passed, "{:?}", report.results);
        // four walls and one floor slab
        assert_eq!(report.total_requirements, 5);
        assert_eq!(report.pass_rate, 100.0);
        assert!(report.results.iter().all(|r| r.element_id.is_some()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_value_mismatch_and_missing_facets_fail() {
        let dir = temp_dir();
        let ifc = generated(&dir, RoomType::Bedroom);
        let file = IfcFile::open(&ifc).unwrap();

        let spec = IdsSpecification::parse(IDS_V1).unwrap();
        let report = check_file(&file, &spec);
        assert_eq!(report.failed_requirements, 1);
        let check = &report.results[0];
        assert!(check.message.contains("value mismatch"), "{}", check.message);
        assert_eq!(check.details.get("actual").map(String::as_str), Some("bedroom"));

        let strict = IDS_V1
            .replace(r#"<material cardinality="optional"/>"#, r#"<material cardinality="required"/>"#)
            .replace("<simpleValue>kitchen</simpleValue>", "<simpleValue>bedroom</simpleValue>");
        let report = check_file(&file, &IdsSpecification::parse(&strict).unwrap());
        assert_eq!(report.results[0].message, "Required material not found");

        let doors = LEGACY_IDS.replace(r#"<ids:entity name="IfcWall"/>"#, r#"<ids:entity name="IfcDoor"/>"#);
        let report = check_file(&file, &IdsSpecification::parse(&doors).unwrap());
        assert!(!report.all_passed);
        assert!(report
            .results
            .iter()
            .any(|r| r.message == "No IfcDoor elements found in IFC file" && r.element_id.is_none()));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_ifc_is_a_failed_check() {
        let spec = IdsSpecification::parse(LEGACY_IDS).unwrap();
        let report = validate_ifc_against_ids(Path::new("/nonexistent/model.ifc"), &spec);
        assert!(!report.all_passed);
        assert_eq!(report.failed_requirements, 1);
        assert_eq!(report.results[0].requirement_name, "File Access");
    }

    #[test]
    fn test_value_matching() {
        assert!(value_matches(&StepValue::Typed("IFCLABEL".into(), vec![StepValue::Str("kitchen".into())]), "kitchen"));
        assert!(value_matches(&StepValue::Typed("IFCLENGTHMEASURE".into(), vec![StepValue::Real(200.0)]), "200"));
        assert!(!value_matches(&StepValue::Real(200.0), "250"));
        assert!(value_matches(&StepValue::Typed("IFCBOOLEAN".into(), vec![StepValue::Enum("T".into())]), "TRUE"));
        assert!(!value_matches(&StepValue::Null, "anything"));
    }

    #[test]
    fn test_run_writes_report_next_to_artifacts() {
        let dir = temp_dir();
        let ifc = generated(&dir, RoomType::Kitchen);
        let ids = dir.join("rules.ids");
        fs::write(&ids, LEGACY_IDS).unwrap();

        let (path, report) = run_ids_validation(&ids, &ifc, &dir, "job7").unwrap();
        assert_eq!(path, dir.join("job7_ids_validation.json"));
        let parsed: IdsValidationReport = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.total_requirements, report.total_requirements);
        assert_eq!(parsed.specification_version, "2.1");

        assert!(run_ids_validation(&dir.join("missing.ids"), &ifc, &dir, "job7").is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
