use anyhow::{Context, Result};
use nalgebra::Matrix4;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::guid;
use crate::model::{Element, IfcClass, IfcModel, PropertyValue, Shape};

/// Sequential `#n=...;` line emitter
struct StepWriter {
    lines: Vec<String>,
    next_id: usize,
}

impl StepWriter {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            next_id: 1,
        }
    }

    fn add(&mut self, body: impl AsRef<str>) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.lines.push(format!("#{}={};", id, body.as_ref()));
        id
    }
}

/// Ids of the shared header entities every element refers to
struct SharedIds {
    owner_history: usize,
    body_context: usize,
    model_context: usize,
    units: usize,
}

/// Serialise a model to an ISO 10303-21 string
pub fn write_step(model: &IfcModel, file_name: &str) -> Result<String> {
    let mut w = StepWriter::new();
    let ctx = write_preamble(&mut w);

    let mut step_ids: Vec<Option<usize>> = vec![None; model.elements.len()];

    for element in &model.elements {
        let placement = element.placement.as_ref().map(|m| write_placement(&mut w, m));
        let shape = element
            .shape
            .as_ref()
            .and_then(|s| write_shape(&mut w, s, ctx.body_context));
        let line = element_line(element, &ctx, placement, shape);
        step_ids[element.id.0] = Some(w.add(line));
    }

    let resolve = |ids: &[crate::model::EntityId]| -> Vec<usize> {
        ids.iter().filter_map(|id| step_ids.get(id.0).copied().flatten()).collect()
    };

    for element in &model.elements {
        let Some(own) = step_ids[element.id.0] else {
            continue;
        };

        let children = resolve(&element.children);
        if !children.is_empty() {
            w.add(format!(
                "IFCRELAGGREGATES({},#{},$,$,#{},{})",
                encode_string(&guid::new_global_id()),
                ctx.owner_history,
                own,
                refs(&children)
            ));
        }

        let contained = resolve(&element.contained);
        if !contained.is_empty() {
            w.add(format!(
                "IFCRELCONTAINEDINSPATIALSTRUCTURE({},#{},$,$,{},#{})",
                encode_string(&guid::new_global_id()),
                ctx.owner_history,
                refs(&contained),
                own
            ));
        }

        for pset in &element.psets {
            let props: Vec<usize> = pset
                .properties
                .iter()
                .map(|p| {
                    w.add(format!(
                        "IFCPROPERTYSINGLEVALUE({},$,{},$)",
                        encode_string(&p.name),
                        property_value(&p.value)
                    ))
                })
                .collect();
            let pset_id = w.add(format!(
                "IFCPROPERTYSET({},#{},{},$,{})",
                encode_string(&guid::new_global_id()),
                ctx.owner_history,
                encode_string(&pset.name),
                refs(&props)
            ));
            w.add(format!(
                "IFCRELDEFINESBYPROPERTIES({},#{},$,$,(#{}),#{})",
                encode_string(&guid::new_global_id()),
                ctx.owner_history,
                own,
                pset_id
            ));
        }
    }

    debug!("Serialised {} elements into {} STEP entities", model.elements.len(), w.lines.len());

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S");
    let mut out = String::new();
    out.push_str("ISO-10303-21;\nHEADER;\n");
    out.push_str("FILE_DESCRIPTION(('ViewDefinition [ReferenceView]'),'2;1');\n");
    out.push_str(&format!(
        "FILE_NAME({},'{}',(''),(''),'sketch2bim','sketch2bim','');\n",
        encode_string(file_name),
        timestamp
    ));
    out.push_str(&format!("FILE_SCHEMA(('{}'));\nENDSEC;\nDATA;\n", model.schema));
    for line in &w.lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("ENDSEC;\nEND-ISO-10303-21;\n");
    Ok(out)
}

/// Write the model next to `path` under a temporary name, then rename into place
pub fn write_to_path(model: &IfcModel, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model.ifc".to_string());
    let content = write_step(model, &file_name)?;

    let tmp = path.with_extension("ifc.tmp");
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move IFC into {}", path.display()))?;
    Ok(())
}

fn write_preamble(w: &mut StepWriter) -> SharedIds {
    let person = w.add("IFCPERSON($,$,'sketch2bim',$,$,$,$,$)");
    let org = w.add("IFCORGANIZATION($,'sketch2bim',$,$,$)");
    let person_org = w.add(format!("IFCPERSONANDORGANIZATION(#{},#{},$)", person, org));
    let app = w.add(format!(
        "IFCAPPLICATION(#{},'{}','sketch2bim','sketch2bim')",
        org,
        env!("CARGO_PKG_VERSION")
    ));
    let owner_history = w.add(format!(
        "IFCOWNERHISTORY(#{},#{},$,.ADDED.,$,$,$,{})",
        person_org,
        app,
        chrono::Utc::now().timestamp()
    ));

    let length = w.add("IFCSIUNIT(*,.LENGTHUNIT.,.MILLI.,.METRE.)");
    let area = w.add("IFCSIUNIT(*,.AREAUNIT.,$,.SQUARE_METRE.)");
    let volume = w.add("IFCSIUNIT(*,.VOLUMEUNIT.,$,.CUBIC_METRE.)");
    let angle = w.add("IFCSIUNIT(*,.PLANEANGLEUNIT.,$,.RADIAN.)");
    let units = w.add(format!("IFCUNITASSIGNMENT((#{},#{},#{},#{}))", length, area, volume, angle));

    let world = write_axis(w, &Matrix4::identity());
    let model_context = w.add(format!(
        "IFCGEOMETRICREPRESENTATIONCONTEXT($,'Model',3,1.E-05,#{},$)",
        world
    ));
    let body_context = w.add(format!(
        "IFCGEOMETRICREPRESENTATIONSUBCONTEXT('Body','Model',*,*,*,*,#{},$,.MODEL_VIEW.,$)",
        model_context
    ));

    SharedIds {
        owner_history,
        body_context,
        model_context,
        units,
    }
}

fn write_axis(w: &mut StepWriter, m: &Matrix4<f64>) -> usize {
    let loc = w.add(format!(
        "IFCCARTESIANPOINT(({},{},{}))",
        real(m[(0, 3)]),
        real(m[(1, 3)]),
        real(m[(2, 3)])
    ));
    let axis = w.add(format!(
        "IFCDIRECTION(({},{},{}))",
        real(m[(0, 2)]),
        real(m[(1, 2)]),
        real(m[(2, 2)])
    ));
    let ref_dir = w.add(format!(
        "IFCDIRECTION(({},{},{}))",
        real(m[(0, 0)]),
        real(m[(1, 0)]),
        real(m[(2, 0)])
    ));
    w.add(format!("IFCAXIS2PLACEMENT3D(#{},#{},#{})", loc, axis, ref_dir))
}

fn write_placement(w: &mut StepWriter, m: &Matrix4<f64>) -> usize {
    let axis = write_axis(w, m);
    w.add(format!("IFCLOCALPLACEMENT($,#{})", axis))
}

fn write_shape(w: &mut StepWriter, shape: &Shape, body_context: usize) -> Option<usize> {
    match shape {
        Shape::Extrusion { profile, depth } => {
            if profile.len() < 3 {
                return None;
            }
            let mut points: Vec<usize> = profile
                .iter()
                .map(|p| w.add(format!("IFCCARTESIANPOINT(({},{}))", real(p[0]), real(p[1]))))
                .collect();
            points.push(points[0]);

            let polyline = w.add(format!("IFCPOLYLINE({})", refs(&points)));
            let profile_def = w.add(format!("IFCARBITRARYCLOSEDPROFILEDEF(.AREA.,$,#{})", polyline));
            let origin = w.add("IFCCARTESIANPOINT((0.,0.,0.))");
            let position = w.add(format!("IFCAXIS2PLACEMENT3D(#{},$,$)", origin));
            let direction = w.add("IFCDIRECTION((0.,0.,1.))");
            let solid = w.add(format!(
                "IFCEXTRUDEDAREASOLID(#{},#{},#{},{})",
                profile_def,
                position,
                direction,
                real(*depth)
            ));
            let representation = w.add(format!(
                "IFCSHAPEREPRESENTATION(#{},'Body','SweptSolid',(#{}))",
                body_context, solid
            ));
            Some(w.add(format!("IFCPRODUCTDEFINITIONSHAPE($,$,(#{}))", representation)))
        }
    }
}

fn element_line(
    e: &Element,
    ctx: &SharedIds,
    placement: Option<usize>,
    shape: Option<usize>,
) -> String {
    let gid = encode_string(&e.global_id);
    let oh = ctx.owner_history;
    let name = encode_string(&e.name);
    let object_type = opt_string(e.object_type.as_deref());
    let plc = opt_ref(placement);
    let rep = opt_ref(shape);
    let predefined = e
        .predefined_type
        .as_deref()
        .map(|p| format!(".{}.", p))
        .unwrap_or_else(|| "$".to_string());
    let keyword = e.class.step_keyword();

    match &e.class {
        IfcClass::Project => format!(
            "{}({},#{},{},$,$,$,$,(#{}),#{})",
            keyword, gid, oh, name, ctx.model_context, ctx.units
        ),
        IfcClass::Site => format!(
            "{}({},#{},{},$,{},{},{},{},.ELEMENT.,$,$,$,$,$)",
            keyword,
            gid,
            oh,
            name,
            object_type,
            plc,
            rep,
            opt_string(e.long_name.as_deref())
        ),
        IfcClass::Building => format!(
            "{}({},#{},{},$,{},{},{},{},.ELEMENT.,$,$,$)",
            keyword,
            gid,
            oh,
            name,
            object_type,
            plc,
            rep,
            opt_string(e.long_name.as_deref())
        ),
        IfcClass::BuildingStorey => format!(
            "{}({},#{},{},$,{},{},{},{},.ELEMENT.,0.)",
            keyword,
            gid,
            oh,
            name,
            object_type,
            plc,
            rep,
            opt_string(e.long_name.as_deref())
        ),
        IfcClass::Space => format!(
            "{}({},#{},{},$,{},{},{},{},.ELEMENT.,{},$)",
            keyword,
            gid,
            oh,
            name,
            object_type,
            plc,
            rep,
            opt_string(e.long_name.as_deref()),
            if predefined == "$" { ".INTERNAL.".to_string() } else { predefined }
        ),
        IfcClass::Zone => format!(
            "{}({},#{},{},$,{},{})",
            keyword,
            gid,
            oh,
            name,
            object_type,
            opt_string(e.long_name.as_deref())
        ),
        IfcClass::Door | IfcClass::Window => {
            let (height, width) = e
                .overall_size
                .map(|(h, w)| (real(h), real(w)))
                .unwrap_or_else(|| ("$".to_string(), "$".to_string()));
            format!(
                "{}({},#{},{},$,{},{},{},$,{},{},{},$,$)",
                keyword, gid, oh, name, object_type, plc, rep, height, width, predefined
            )
        }
        IfcClass::Wall
        | IfcClass::WallStandardCase
        | IfcClass::Slab
        | IfcClass::Roof
        | IfcClass::Column
        | IfcClass::Beam
        | IfcClass::BuildingElementProxy => format!(
            "{}({},#{},{},$,{},{},{},$,{})",
            keyword, gid, oh, name, object_type, plc, rep, predefined
        ),
        IfcClass::Annotation => format!(
            "{}({},#{},{},$,{},{},{})",
            keyword, gid, oh, name, object_type, plc, rep
        ),
        IfcClass::FurnishingElement | IfcClass::FlowTerminal | IfcClass::Custom(_) => format!(
            "{}({},#{},{},$,{},{},{},$)",
            keyword, gid, oh, name, object_type, plc, rep
        ),
    }
}

fn property_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Length(v) => format!("IFCLENGTHMEASURE({})", real(*v)),
        PropertyValue::Area(v) => format!("IFCAREAMEASURE({})", real(*v)),
        PropertyValue::Real(v) => format!("IFCREAL({})", real(*v)),
        PropertyValue::Integer(v) => format!("IFCINTEGER({})", v),
        PropertyValue::Boolean(b) => format!("IFCBOOLEAN({})", if *b { ".T." } else { ".F." }),
        PropertyValue::Label(s) => format!("IFCLABEL({})", encode_string(s)),
        PropertyValue::Text(s) => format!("IFCTEXT({})", encode_string(s)),
    }
}

/// STEP real: always carries a decimal point, six fractional digits at most
pub(crate) fn real(v: f64) -> String {
    if !v.is_finite() {
        return "0.".to_string();
    }
    let mut s = format!("{:.6}", v);
    while s.ends_with('0') {
        s.pop();
    }
    if s == "-0." {
        s = "0.".to_string();
    }
    s
}

/// Quote and escape a string; non-ASCII goes through `\X2\` hex encoding
pub(crate) fn encode_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            c => {
                let mut buf = [0u16; 2];
                out.push_str("\\X2\\");
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("{:04X}", unit));
                }
                out.push_str("\\X0\\");
            }
        }
    }
    out.push('\'');
    out
}

fn opt_string(s: Option<&str>) -> String {
    s.map(encode_string).unwrap_or_else(|| "$".to_string())
}

fn opt_ref(id: Option<usize>) -> String {
    id.map(|i| format!("#{}", i)).unwrap_or_else(|| "$".to_string())
}

fn refs(ids: &[usize]) -> String {
    let inner: Vec<String> = ids.iter().map(|i| format!("#{}", i)).collect();
    format!("({})", inner.join(","))
}
