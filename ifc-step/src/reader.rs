//! STEP reader built on nom.
//!
//! Parses the whole file into owned entities keyed by `#id`; plans are small
//! enough that random access beats streaming here.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{Matrix4, Vector3};
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1, one_of},
    combinator::{map, map_res, opt, recognize},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::guid;
use crate::model::IfcClass;

/// Parsed STEP parameter
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    Ref(u32),
    Str(String),
    Int(i64),
    Real(f64),
    Enum(String),
    List(Vec<StepValue>),
    /// Typed wrapper such as `IFCLENGTHMEASURE(200.)`
    Typed(String, Vec<StepValue>),
    Null,
    Derived,
}

impl StepValue {
    pub fn as_ref_id(&self) -> Option<u32> {
        match self {
            StepValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StepValue::Str(s) => Some(s),
            StepValue::Typed(_, inner) if inner.len() == 1 => inner[0].as_str(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StepValue::Real(v) => Some(*v),
            StepValue::Int(v) => Some(*v as f64),
            StepValue::Typed(_, inner) if inner.len() == 1 => inner[0].as_f64(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StepValue]> {
        match self {
            StepValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            StepValue::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StepValue::Null)
    }

    fn collect_refs(&self, out: &mut Vec<u32>) {
        match self {
            StepValue::Ref(id) => out.push(*id),
            StepValue::List(items) | StepValue::Typed(_, items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            _ => {}
        }
    }
}

/// One `#id=KEYWORD(...)` instance
#[derive(Debug, Clone, PartialEq)]
pub struct StepEntity {
    pub id: u32,
    pub keyword: String,
    pub args: Vec<StepValue>,
}

impl StepEntity {
    pub fn arg(&self, index: usize) -> Option<&StepValue> {
        self.args.get(index)
    }

    pub fn global_id(&self) -> Option<&str> {
        self.arg(0).and_then(StepValue::as_str)
    }

    /// IfcRoot.Name
    pub fn name(&self) -> Option<&str> {
        self.arg(2).and_then(StepValue::as_str)
    }

    pub fn object_type(&self) -> Option<&str> {
        self.arg(4).and_then(StepValue::as_str)
    }

    /// Trailing enum argument other than a composition type, e.g. `FLOOR`
    pub fn predefined_type(&self) -> Option<&str> {
        self.args
            .iter()
            .rev()
            .filter_map(StepValue::as_enum)
            .find(|e| !matches!(*e, "ELEMENT" | "COMPLEX" | "PARTIAL"))
    }

    pub fn is(&self, class: &IfcClass) -> bool {
        self.keyword == class.step_keyword()
    }

    pub fn class(&self) -> IfcClass {
        IfcClass::from_name(&self.keyword)
    }
}

/// A parsed IFC file
#[derive(Debug, Clone)]
pub struct IfcFile {
    pub schema: String,
    pub file_size: u64,
    entities: BTreeMap<u32, StepEntity>,
}

impl IfcFile {
    pub fn open(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read IFC file {}", path.display()))?;
        let mut file = Self::parse(&text)
            .with_context(|| format!("Failed to parse IFC file {}", path.display()))?;
        file.file_size = text.len() as u64;
        Ok(file)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let statements = split_statements(text);
        let mut iter = statements.iter().map(|s| s.trim()).filter(|s| !s.is_empty());

        match iter.next() {
            Some("ISO-10303-21") => {}
            _ => bail!("Missing ISO-10303-21 signature"),
        }

        let mut schema = String::new();
        let mut entities = BTreeMap::new();
        let mut section = "";

        for statement in iter {
            match statement {
                "HEADER" => section = "header",
                "DATA" => section = "data",
                "ENDSEC" => section = "",
                "END-ISO-10303-21" => break,
                _ if section == "header" => {
                    if let Ok((_, (keyword, args))) = header_entity(statement) {
                        if keyword.eq_ignore_ascii_case("FILE_SCHEMA") {
                            schema = args
                                .first()
                                .and_then(StepValue::as_list)
                                .and_then(|l| l.first())
                                .and_then(StepValue::as_str)
                                .unwrap_or_default()
                                .to_string();
                        }
                    }
                }
                _ if section == "data" => {
                    let entity = parse_entity(statement)?;
                    if entities.insert(entity.id, entity).is_some() {
                        bail!("Duplicate entity id in statement: {}", truncate(statement));
                    }
                }
                _ => {}
            }
        }

        if schema.is_empty() {
            bail!("FILE_SCHEMA missing from header");
        }

        Ok(Self {
            schema,
            file_size: text.len() as u64,
            entities,
        })
    }

    pub fn get(&self, id: u32) -> Option<&StepEntity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &StepEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn by_keyword(&self, keyword: &str) -> Vec<&StepEntity> {
        self.entities
            .values()
            .filter(|e| e.keyword.eq_ignore_ascii_case(keyword))
            .collect()
    }

    /// Instances of `class`, including known subtypes
    pub fn by_class(&self, class: &IfcClass) -> Vec<&StepEntity> {
        let keywords: Vec<String> = class.with_subtypes().iter().map(|c| c.step_keyword()).collect();
        self.entities
            .values()
            .filter(|e| keywords.iter().any(|k| *k == e.keyword))
            .collect()
    }

    pub fn count(&self, class: &IfcClass) -> usize {
        self.by_class(class).len()
    }

    pub fn project(&self) -> Option<&StepEntity> {
        self.by_class(&IfcClass::Project).into_iter().next()
    }

    fn resolve(&self, value: Option<&StepValue>, keyword: &str) -> Option<&StepEntity> {
        let entity = self.get(value?.as_ref_id()?)?;
        (entity.keyword == keyword).then_some(entity)
    }

    pub fn has_placement(&self, entity: &StepEntity) -> bool {
        entity.arg(5).and_then(StepValue::as_ref_id).is_some()
    }

    /// Absolute ObjectPlacement of a product, in file length units
    pub fn placement(&self, entity: &StepEntity) -> Option<Matrix4<f64>> {
        let placement_id = entity.arg(5)?.as_ref_id()?;
        self.local_placement(placement_id, 0)
    }

    fn local_placement(&self, id: u32, depth: usize) -> Option<Matrix4<f64>> {
        if depth > 32 {
            return None;
        }
        let placement = self.get(id)?;
        if placement.keyword != "IFCLOCALPLACEMENT" {
            return None;
        }
        let relative = self.axis_placement(placement.arg(1)?.as_ref_id()?)?;
        match placement.arg(0).and_then(StepValue::as_ref_id) {
            Some(parent) => Some(self.local_placement(parent, depth + 1)? * relative),
            None => Some(relative),
        }
    }

    /// IFCAXIS2PLACEMENT3D as a rigid transform
    pub fn axis_placement(&self, id: u32) -> Option<Matrix4<f64>> {
        let axis = self.get(id)?;
        if axis.keyword != "IFCAXIS2PLACEMENT3D" {
            return None;
        }

        let location = self
            .resolve(axis.arg(0), "IFCCARTESIANPOINT")
            .and_then(|p| self.coordinates(p))
            .unwrap_or_default();
        let z = self
            .resolve(axis.arg(1), "IFCDIRECTION")
            .and_then(|d| self.coordinates(d))
            .unwrap_or_else(|| vec![0.0, 0.0, 1.0]);
        let x = self
            .resolve(axis.arg(2), "IFCDIRECTION")
            .and_then(|d| self.coordinates(d))
            .unwrap_or_else(|| vec![1.0, 0.0, 0.0]);

        Some(frame(&location, &z, &x))
    }

    /// Coordinates of an IFCCARTESIANPOINT or IFCDIRECTION
    pub fn coordinates(&self, entity: &StepEntity) -> Option<Vec<f64>> {
        entity
            .arg(0)?
            .as_list()?
            .iter()
            .map(StepValue::as_f64)
            .collect()
    }

    /// Property sets attached to an entity: (pset name, [(property, value)])
    pub fn property_sets(&self, id: u32) -> Vec<(String, Vec<(String, StepValue)>)> {
        let mut out = Vec::new();
        for rel in self.by_keyword("IFCRELDEFINESBYPROPERTIES") {
            let targets_entity = rel
                .arg(4)
                .and_then(StepValue::as_list)
                .map(|l| l.iter().any(|v| v.as_ref_id() == Some(id)))
                .unwrap_or(false);
            if !targets_entity {
                continue;
            }
            let Some(pset) = self.resolve(rel.arg(5), "IFCPROPERTYSET") else {
                continue;
            };
            let name = pset.name().unwrap_or_default().to_string();
            let properties = pset
                .arg(4)
                .and_then(StepValue::as_list)
                .unwrap_or(&[])
                .iter()
                .filter_map(|v| self.get(v.as_ref_id()?))
                .filter(|p| p.keyword == "IFCPROPERTYSINGLEVALUE")
                .filter_map(|p| {
                    let prop_name = p.arg(0)?.as_str()?.to_string();
                    Some((prop_name, p.arg(2).cloned().unwrap_or(StepValue::Null)))
                })
                .collect();
            out.push((name, properties));
        }
        out
    }

    /// Single property lookup
    pub fn property(&self, id: u32, pset: &str, property: &str) -> Option<StepValue> {
        self.property_sets(id)
            .into_iter()
            .find(|(name, _)| name == pset)?
            .1
            .into_iter()
            .find(|(name, _)| name == property)
            .map(|(_, v)| v)
    }

    /// True when some `rel_keyword` relationship lists `id` among its related objects
    pub fn relates_to(&self, rel_keyword: &str, id: u32) -> bool {
        self.by_keyword(rel_keyword).into_iter().any(|rel| {
            rel.arg(4)
                .and_then(StepValue::as_list)
                .map(|l| l.iter().any(|v| v.as_ref_id() == Some(id)))
                .unwrap_or(false)
        })
    }

    pub fn has_material(&self, id: u32) -> bool {
        self.relates_to("IFCRELASSOCIATESMATERIAL", id)
    }

    /// Elements contained in a spatial structure element
    pub fn contained_in(&self, structure: u32) -> Vec<u32> {
        self.by_keyword("IFCRELCONTAINEDINSPATIALSTRUCTURE")
            .into_iter()
            .filter(|rel| rel.arg(5).and_then(StepValue::as_ref_id) == Some(structure))
            .flat_map(|rel| {
                rel.arg(4)
                    .and_then(StepValue::as_list)
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(StepValue::as_ref_id)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Objects aggregated under `parent`
    pub fn decomposed_by(&self, parent: u32) -> Vec<u32> {
        self.by_keyword("IFCRELAGGREGATES")
            .into_iter()
            .filter(|rel| rel.arg(4).and_then(StepValue::as_ref_id) == Some(parent))
            .flat_map(|rel| {
                rel.arg(5)
                    .and_then(StepValue::as_list)
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(StepValue::as_ref_id)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// True when the project's UnitsInContext points at a non-empty unit assignment
    pub fn has_units(&self) -> bool {
        self.project()
            .and_then(|p| self.resolve(p.arg(8), "IFCUNITASSIGNMENT"))
            .and_then(|u| u.arg(0))
            .and_then(StepValue::as_list)
            .map(|l| !l.is_empty())
            .unwrap_or(false)
    }

    /// Factor converting file length units to metres
    pub fn length_unit_scale(&self) -> f64 {
        let unit = self.by_keyword("IFCSIUNIT").into_iter().find(|u| {
            u.arg(1).and_then(StepValue::as_enum) == Some("LENGTHUNIT")
        });
        match unit.and_then(|u| u.arg(2)).and_then(StepValue::as_enum) {
            Some("MILLI") => 0.001,
            Some("CENTI") => 0.01,
            Some("DECI") => 0.1,
            Some("KILO") => 1000.0,
            _ => 1.0,
        }
    }

    /// Schema-level checks. Each returned string is one problem.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let schema = self.schema.to_ascii_uppercase();
        if !(schema.starts_with("IFC4") || schema.starts_with("IFC2X3")) {
            problems.push(format!("Unsupported schema '{}'", self.schema));
        }

        let projects = self.by_class(&IfcClass::Project).len();
        if projects != 1 {
            problems.push(format!("Expected exactly one IfcProject, found {}", projects));
        }

        let mut seen_ids = HashSet::new();
        for entity in self.entities.values() {
            let mut refs = Vec::new();
            for arg in &entity.args {
                arg.collect_refs(&mut refs);
            }
            for r in refs {
                if !self.entities.contains_key(&r) {
                    problems.push(format!("#{} {} references missing #{}", entity.id, entity.keyword, r));
                }
            }

            if is_rooted(&entity.keyword) {
                match entity.global_id() {
                    Some(gid) if guid::is_valid(gid) => {
                        if !seen_ids.insert(gid.to_string()) {
                            problems.push(format!("#{} {} reuses GlobalId {}", entity.id, entity.keyword, gid));
                        }
                    }
                    _ => problems.push(format!("#{} {} has an invalid GlobalId", entity.id, entity.keyword)),
                }
            }

            match entity.keyword.as_str() {
                "IFCRELAGGREGATES" => {
                    let related = entity.arg(5).and_then(StepValue::as_list).map(|l| l.len()).unwrap_or(0);
                    if entity.arg(4).and_then(StepValue::as_ref_id).is_none() || related == 0 {
                        problems.push(format!("#{} IFCRELAGGREGATES is incomplete", entity.id));
                    }
                }
                "IFCRELCONTAINEDINSPATIALSTRUCTURE" => {
                    let structure = entity
                        .arg(5)
                        .and_then(StepValue::as_ref_id)
                        .and_then(|id| self.get(id));
                    let spatial = structure.map(|s| s.class().is_spatial()).unwrap_or(false);
                    if !spatial {
                        problems.push(format!(
                            "#{} IFCRELCONTAINEDINSPATIALSTRUCTURE does not point at a spatial element",
                            entity.id
                        ));
                    }
                }
                "IFCPROPERTYSET" => {
                    if entity.name().map(str::is_empty).unwrap_or(true) {
                        problems.push(format!("#{} IFCPROPERTYSET has no name", entity.id));
                    }
                }
                _ => {}
            }
        }

        problems
    }
}

fn is_rooted(keyword: &str) -> bool {
    if keyword.starts_with("IFCREL") || keyword == "IFCPROPERTYSET" {
        return true;
    }
    !matches!(IfcClass::from_name(keyword), IfcClass::Custom(_))
}

/// Orthonormal frame from location, Z axis and approximate X direction
fn frame(location: &[f64], axis: &[f64], ref_direction: &[f64]) -> Matrix4<f64> {
    let get = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(0.0);
    let z = Vector3::new(get(axis, 0), get(axis, 1), get(axis, 2));
    let z = if z.norm() > 1e-12 { z.normalize() } else { Vector3::z() };
    let r = Vector3::new(get(ref_direction, 0), get(ref_direction, 1), get(ref_direction, 2));
    let mut x = r - z * r.dot(&z);
    if x.norm() < 1e-12 {
        x = if z.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        x -= z * x.dot(&z);
    }
    let x = x.normalize();
    let y = z.cross(&x);

    Matrix4::new(
        x.x, y.x, z.x, get(location, 0),
        x.y, y.y, z.y, get(location, 1),
        x.z, y.z, z.z, get(location, 2),
        0.0, 0.0, 0.0, 1.0,
    )
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(80) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Split on `;` outside string literals and `/* */` comments
fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            current.push(c);
            if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                current.push(c);
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c2 in chars.by_ref() {
                    if prev == '*' && c2 == '/' {
                        break;
                    }
                    prev = c2;
                }
            }
            ';' => statements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
}

fn parse_entity(statement: &str) -> Result<StepEntity> {
    let result: IResult<&str, (u32, &str, Vec<StepValue>)> = tuple((
        delimited(ws, preceded(char('#'), map_res(digit1, |s: &str| s.parse::<u32>())), ws),
        preceded(char('='), delimited(ws, keyword, ws)),
        delimited(char('('), separated_list0(char(','), token), tuple((char(')'), ws))),
    ))(statement);

    match result {
        Ok((rest, (id, kw, args))) if rest.trim().is_empty() => Ok(StepEntity {
            id,
            keyword: kw.to_ascii_uppercase(),
            args,
        }),
        Ok((rest, _)) => Err(anyhow!("Trailing input after entity: {}", truncate(rest))),
        Err(e) => Err(anyhow!("Failed to parse entity '{}': {}", truncate(statement), e)),
    }
}

fn header_entity(input: &str) -> IResult<&str, (&str, Vec<StepValue>)> {
    pair(
        delimited(ws, keyword, ws),
        delimited(char('('), separated_list0(char(','), token), char(')')),
    )(input)
}

fn keyword(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn ws(input: &str) -> IResult<&str, ()> {
    map(take_while(|c: char| c.is_whitespace()), |_| ())(input)
}

fn token(input: &str) -> IResult<&str, StepValue> {
    delimited(
        ws,
        alt((real, integer, entity_ref, string_literal, enum_value, list, typed_value, null, derived)),
        ws,
    )(input)
}

fn entity_ref(input: &str) -> IResult<&str, StepValue> {
    map(
        preceded(char('#'), map_res(digit1, |s: &str| s.parse::<u32>())),
        StepValue::Ref,
    )(input)
}

fn integer(input: &str) -> IResult<&str, StepValue> {
    map_res(recognize(pair(opt(one_of("+-")), digit1)), |s: &str| {
        s.parse::<i64>().map(StepValue::Int)
    })(input)
}

/// `0.`, `-3.5`, `1.E-05`
fn real(input: &str) -> IResult<&str, StepValue> {
    map_res(
        recognize(tuple((
            opt(one_of("+-")),
            digit1,
            char('.'),
            opt(digit1),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |s: &str| s.parse::<f64>().map(StepValue::Real),
    )(input)
}

fn string_literal(input: &str) -> IResult<&str, StepValue> {
    fn body(input: &str) -> IResult<&str, &str> {
        let bytes = input.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                    continue;
                }
                return Ok((&input[i..], &input[..i]));
            }
            i += 1;
        }
        Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char)))
    }

    map(delimited(char('\''), body, char('\'')), |raw| {
        StepValue::Str(decode_string(raw))
    })(input)
}

fn enum_value(input: &str) -> IResult<&str, StepValue> {
    map(delimited(char('.'), keyword, char('.')), |e: &str| {
        StepValue::Enum(e.to_ascii_uppercase())
    })(input)
}

fn list(input: &str) -> IResult<&str, StepValue> {
    map(
        delimited(char('('), separated_list0(char(','), token), preceded(ws, char(')'))),
        StepValue::List,
    )(input)
}

fn typed_value(input: &str) -> IResult<&str, StepValue> {
    map(
        pair(keyword, delimited(char('('), separated_list0(char(','), token), char(')'))),
        |(name, args)| StepValue::Typed(name.to_ascii_uppercase(), args),
    )(input)
}

fn null(input: &str) -> IResult<&str, StepValue> {
    map(char('$'), |_| StepValue::Null)(input)
}

fn derived(input: &str) -> IResult<&str, StepValue> {
    map(char('*'), |_| StepValue::Derived)(input)
}

/// Undo STEP string escaping (`''`, `\\`, `\X2\....\X0\`)
fn decode_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("''") {
            out.push('\'');
            rest = &rest[2..];
        } else if rest.starts_with("\\\\") {
            out.push('\\');
            rest = &rest[2..];
        } else if let Some(encoded) = rest.strip_prefix("\\X2\\") {
            let end = encoded.find("\\X0\\").unwrap_or(encoded.len());
            let hex = &encoded[..end];
            let units: Vec<u16> = hex
                .as_bytes()
                .chunks(4)
                .filter_map(|chunk| std::str::from_utf8(chunk).ok())
                .filter_map(|h| u16::from_str_radix(h, 16).ok())
                .collect();
            out.extend(char::decode_utf16(units).map(|r| r.unwrap_or('\u{FFFD}')));
            rest = encoded.get(end + 4..).unwrap_or("");
        } else {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{IfcBuilder, StepModelBuilder};
    use crate::model::{Property, PropertyValue};
    use crate::writer::write_step;

    const SAMPLE: &str = "ISO-10303-21;
HEADER;
FILE_DESCRIPTION(('ViewDefinition [ReferenceView]'),'2;1');
FILE_SCHEMA(('IFC4'));
ENDSEC;
DATA;
#1=IFCCARTESIANPOINT((1000.,2000.,0.));
#2=IFCDIRECTION((0.,0.,1.));
#3=IFCDIRECTION((0.,1.,0.));
#4=IFCAXIS2PLACEMENT3D(#1,#2,#3);
#5=IFCLOCALPLACEMENT($,#4);
/* a comment; with a semicolon */
#6=IFCWALL('0000000000000000000001',$,'It''s a wall',$,$,#5,$,$,$);
ENDSEC;
END-ISO-10303-21;
";

    #[test]
    fn test_parse_sample() {
        let file = IfcFile::parse(SAMPLE).unwrap();
        assert_eq!(file.schema, "IFC4");
        assert_eq!(file.len(), 6);

        let wall = file.get(6).unwrap();
        assert_eq!(wall.keyword, "IFCWALL");
        assert_eq!(wall.name(), Some("It's a wall"));
    }

    #[test]
    fn test_placement_resolves_rotation_and_translation() {
        let file = IfcFile::parse(SAMPLE).unwrap();
        let wall = file.get(6).unwrap();
        let m = file.placement(wall).unwrap();

        assert!((m[(0, 3)] - 1000.0).abs() < 1e-9);
        assert!((m[(1, 3)] - 2000.0).abs() < 1e-9);
        // Local X axis points along world +Y
        assert!(m[(0, 0)].abs() < 1e-9);
        assert!((m[(1, 0)] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tokens() {
        assert_eq!(token("1.E-05").unwrap().1, StepValue::Real(1e-5));
        assert_eq!(token("0.").unwrap().1, StepValue::Real(0.0));
        assert_eq!(token("-42").unwrap().1, StepValue::Int(-42));
        assert_eq!(token(".ELEMENT.").unwrap().1, StepValue::Enum("ELEMENT".into()));
        assert_eq!(
            token("IFCLENGTHMEASURE(200.)").unwrap().1,
            StepValue::Typed("IFCLENGTHMEASURE".into(), vec![StepValue::Real(200.0)])
        );
        assert_eq!(
            token("( #1 , #2 )").unwrap().1,
            StepValue::List(vec![StepValue::Ref(1), StepValue::Ref(2)])
        );
    }

    #[test]
    fn test_decode_unicode_escape() {
        assert_eq!(decode_string("m\\X2\\00B2\\X0\\"), "m²");
    }

    #[test]
    fn test_rejects_non_step() {
        assert!(IfcFile::parse("hello world").is_err());
    }

    #[test]
    fn test_written_model_reads_back() {
        let mut builder = StepModelBuilder::new();
        let project = builder.create_entity(IfcClass::Project, "Sketch2BIM Project");
        let site = builder.create_entity(IfcClass::Site, "Default Site");
        let building = builder.create_entity(IfcClass::Building, "Building");
        let storey = builder.create_entity(IfcClass::BuildingStorey, "Ground Floor");
        let wall = builder.create_entity(IfcClass::WallStandardCase, "Wall 1");
        builder.aggregate(project, &[site]).unwrap();
        builder.aggregate(site, &[building]).unwrap();
        builder.aggregate(building, &[storey]).unwrap();
        builder.contain(storey, &[wall]).unwrap();
        builder.set_placement(wall, Matrix4::new_translation(&Vector3::new(10.0, 20.0, 0.0))).unwrap();
        builder
            .add_pset(wall, "Pset_WallCommon", vec![Property::new("Thickness", PropertyValue::Length(200.0))])
            .unwrap();

        let text = write_step(&builder.finish(), "t.ifc").unwrap();
        let file = IfcFile::parse(&text).unwrap();

        assert!(file.validate().is_empty(), "{:?}", file.validate());
        assert_eq!(file.count(&IfcClass::Wall), 1);
        assert_eq!(file.count(&IfcClass::WallStandardCase), 1);
        assert!(file.has_units());
        assert!((file.length_unit_scale() - 0.001).abs() < 1e-12);

        let storey_entity = file.by_class(&IfcClass::BuildingStorey)[0];
        let contained = file.contained_in(storey_entity.id);
        assert_eq!(contained.len(), 1);

        let wall_entity = file.by_class(&IfcClass::Wall)[0];
        assert!(file.has_placement(wall_entity));
        let thickness = file.property(wall_entity.id, "Pset_WallCommon", "Thickness").unwrap();
        assert_eq!(thickness.as_f64(), Some(200.0));
    }

    #[test]
    fn test_validate_flags_dangling_reference() {
        let text = SAMPLE.replace("#6=IFCWALL('0000000000000000000001',$,'It''s a wall',$,$,#5,", "#6=IFCWALL('0000000000000000000001',$,'w',$,$,#99,");
        let file = IfcFile::parse(&text).unwrap();
        let problems = file.validate();
        assert!(problems.iter().any(|p| p.contains("missing #99")));
        // No IfcProject in the sample either
        assert!(problems.iter().any(|p| p.contains("IfcProject")));
    }

    #[test]
    fn test_predefined_type_and_material() {
        let text = SAMPLE
            .replace("'It''s a wall',$,$,#5,$,$,$);", "'w',$,$,#5,$,$,.SHEAR.);\n#7=IFCSPACE('0000000000000000000002',$,'Room 1',$,$,$,$,'Kitchen',.ELEMENT.,.INTERNAL.,$);\n#8=IFCMATERIAL('Brick',$,$);\n#9=IFCRELASSOCIATESMATERIAL('0000000000000000000003',$,$,$,(#6),#8);");
        let file = IfcFile::parse(&text).unwrap();

        assert_eq!(file.get(6).unwrap().predefined_type(), Some("SHEAR"));
        assert_eq!(file.get(7).unwrap().predefined_type(), Some("INTERNAL"));
        assert_eq!(file.get(5).unwrap().predefined_type(), None);
        assert!(file.has_material(6));
        assert!(!file.has_material(7));
        assert!(file.relates_to("IfcRelAssociatesMaterial", 6));
        assert!(!file.relates_to("IFCRELDEFINESBYPROPERTIES", 6));
    }
}
