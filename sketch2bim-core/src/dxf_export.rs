//! Top-down DXF (R2010) export of an IFC model.
//!
//! Every triangle of an element's body becomes a closed LWPOLYLINE on the
//! layer for its IFC class. A byte-identical `.dwg` copy is written next to
//! the `.dxf` for tools that filter by extension.

use anyhow::{anyhow, Context, Result};
use dxf::entities::{Entity, EntityType, LwPolyline};
use dxf::enums::AcadVersion;
use dxf::tables::Layer;
use dxf::{Color, Drawing, LwPolylineVertex};
use ifc_step::model::IfcClass;
use ifc_step::IfcFile;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::exporter::{element_meshes, tmp_path};

/// Layer names with their ACI colour index
pub const LAYERS: [(&str, u8); 12] = [
    ("WALLS", 7),
    ("ROOMS", 2),
    ("DOORS", 1),
    ("WINDOWS", 5),
    ("PATHS", 3),
    ("ROADS", 4),
    ("ZONES", 6),
    ("WATER", 1),
    ("PARKING", 8),
    ("BUILDINGS", 7),
    ("PLAZAS", 2),
    ("STREETS", 4),
];

/// Classes drawn into the DXF, in drawing order
pub fn exported_classes() -> [IfcClass; 7] {
    [
        IfcClass::Wall,
        IfcClass::Slab,
        IfcClass::Door,
        IfcClass::Window,
        IfcClass::Space,
        IfcClass::BuildingElementProxy,
        IfcClass::Building,
    ]
}

/// Layer for a proxy element, chosen by name
pub fn proxy_layer(name: &str) -> &'static str {
    let name = name.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));
    if has(&["path", "walkway"]) {
        "PATHS"
    } else if has(&["road", "street"]) {
        "ROADS"
    } else if has(&["water", "pond", "pool"]) {
        "WATER"
    } else if has(&["parking"]) {
        "PARKING"
    } else if has(&["network"]) {
        "STREETS"
    } else {
        "PATHS"
    }
}

pub fn layer_for(class: &IfcClass, name: &str) -> &'static str {
    match class {
        IfcClass::Wall | IfcClass::WallStandardCase => "WALLS",
        IfcClass::Space => "ROOMS",
        IfcClass::Door => "DOORS",
        IfcClass::Window => "WINDOWS",
        IfcClass::Slab => "ZONES",
        IfcClass::Building => "BUILDINGS",
        _ => proxy_layer(name),
    }
}

/// What went into a DXF file
#[derive(Debug, Clone, Default)]
pub struct DxfSummary {
    pub polylines: usize,
    pub per_layer: BTreeMap<String, usize>,
}

fn new_drawing() -> Drawing {
    let mut drawing = Drawing::new();
    drawing.header.version = AcadVersion::R2010;
    for (name, color) in LAYERS {
        drawing.add_layer(Layer {
            name: name.to_string(),
            color: Color::from_index(color),
            ..Default::default()
        });
    }
    drawing
}

fn closed_polyline(points: &[[f64; 2]], layer: &str) -> Entity {
    let mut polyline = LwPolyline::default();
    polyline.set_is_closed(true);
    polyline.vertices = points
        .iter()
        .map(|p| LwPolylineVertex {
            x: p[0],
            y: p[1],
            ..Default::default()
        })
        .collect();
    let mut entity = Entity::new(EntityType::LwPolyline(polyline));
    entity.common.layer = layer.to_string();
    entity
}

/// Write the DXF for `ifc_path` to `dxf_path`
pub fn export_to_dxf(ifc_path: &Path, dxf_path: &Path) -> Result<DxfSummary> {
    let file = IfcFile::open(ifc_path)?;
    let mut drawing = new_drawing();
    let mut summary = DxfSummary::default();

    for element in element_meshes(&file, &exported_classes()) {
        let layer = layer_for(&element.class, &element.name);
        for tri in &element.mesh.triangles {
            let points: Vec<[f64; 2]> = tri
                .iter()
                .map(|&i| {
                    let v = element.mesh.vertices[i];
                    [v[0], v[1]]
                })
                .collect();
            drawing.add_entity(closed_polyline(&points, layer));
            summary.polylines += 1;
            *summary.per_layer.entry(layer.to_string()).or_default() += 1;
        }
    }

    if let Some(parent) = dxf_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = tmp_path(dxf_path);
    drawing
        .save_file(&tmp)
        .map_err(|e| anyhow!("Failed to write {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, dxf_path).with_context(|| format!("Failed to move DXF into {}", dxf_path.display()))?;

    info!("DXF written to {} ({} polylines)", dxf_path.display(), summary.polylines);
    debug!("DXF layers: {:?}", summary.per_layer);
    Ok(summary)
}

/// Copy `{stem}.dxf` to `{stem}.dwg`
pub fn write_dwg_alias(dxf_path: &Path) -> Result<PathBuf> {
    let dwg_path = dxf_path.with_extension("dwg");
    let tmp = tmp_path(&dwg_path);
    fs::copy(dxf_path, &tmp).with_context(|| format!("Failed to copy {}", dxf_path.display()))?;
    fs::rename(&tmp, &dwg_path).with_context(|| format!("Failed to move DWG into {}", dwg_path.display()))?;
    Ok(dwg_path)
}
