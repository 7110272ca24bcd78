//! Plan data to IFC4.
//!
//! Builds Project → Site → Building → Storey, then walls, floor slabs with
//! matching spaces, doors, windows and symbol elements, all contained in the
//! storey. Pixel coordinates become metres through the plan's scale ratio and
//! are written in millimetres. Placement, geometry and property sets are
//! advisory: a failure is logged and the element stays in the model.

use anyhow::{Context, Result};
use ifc_step::model::{IfcClass, Property, PropertyValue, Shape};
use ifc_step::{write_to_path, EntityId, IfcBuilder, IfcFile, IfcModel, StepModelBuilder};
use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::plan::{polygon_centroid, OpeningType, PlanData, Point, Symbol, SymbolCategory};

const MAX_WALLS: usize = 100;
const MAX_ROOMS: usize = 50;
const MAX_OPENINGS: usize = 50;
const MAX_SYMBOLS: usize = 200;

const MIN_WALL_LENGTH_M: f64 = 0.1;
const WALL_THICKNESS_MM: f64 = 200.0;
const WALL_HEIGHT_MM: f64 = 3000.0;
const SLAB_THICKNESS_MM: f64 = 200.0;
const DOOR_HEIGHT_MM: f64 = 2100.0;
const WINDOW_HEIGHT_MM: f64 = 1200.0;
const WINDOW_SILL_MM: f64 = 900.0;
const SYMBOL_HEIGHT_MM: f64 = 500.0;

/// Files smaller than this are treated as failed writes
pub const MIN_IFC_BYTES: u64 = 1000;

/// Progress stages reported to the callback, in order
pub const PROGRESS_STAGES: [(u8, &str); 8] = [
    (0, "Creating IFC file structure"),
    (10, "Creating spatial hierarchy"),
    (20, "Creating walls"),
    (60, "Creating floors"),
    (85, "Creating openings"),
    (90, "Creating symbols"),
    (95, "Writing IFC file"),
    (100, "IFC generation complete"),
];

/// What ended up in the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IfcGenerationReport {
    pub walls: usize,
    pub slabs: usize,
    pub spaces: usize,
    pub doors: usize,
    pub windows: usize,
    pub symbols: usize,
    pub skipped_walls: usize,
    pub skipped_rooms: usize,
    /// Placement, geometry or property attachments that were dropped
    pub advisory_failures: usize,
    pub file_size: u64,
    pub duration_ms: u64,
}

struct Progress<'a> {
    callback: Option<&'a mut dyn FnMut(u8, &str)>,
}

impl Progress<'_> {
    fn stage(&mut self, index: usize) {
        let (percent, message) = PROGRESS_STAGES[index];
        debug!("IFC generation {}%: {}", percent, message);
        if let Some(cb) = self.callback.as_mut() {
            cb(percent, message);
        }
    }
}

/// Write `plan` as IFC to `output_path`; false on any hard failure
pub fn generate_ifc_from_plan(
    plan: &PlanData,
    output_path: &Path,
    progress: Option<&mut dyn FnMut(u8, &str)>,
) -> bool {
    match generate_ifc_detailed(plan, output_path, progress) {
        Ok(_) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

/// Build, write atomically and verify the IFC file
pub fn generate_ifc_detailed(
    plan: &PlanData,
    output_path: &Path,
    progress: Option<&mut dyn FnMut(u8, &str)>,
) -> Result<IfcGenerationReport, PipelineError> {
    let start = Instant::now();
    let mut progress = Progress { callback: progress };

    let mut builder = StepModelBuilder::new();
    let mut report = populate(&mut builder, plan, &mut progress);

    progress.stage(6);
    let model: IfcModel = builder.finish();
    write_to_path(&model, output_path)
        .map_err(|e| PipelineError::IfcGenerationFailed(format!("{:#}", e)))?;
    report.file_size =
        verify_ifc(output_path).map_err(|e| PipelineError::IfcGenerationFailed(format!("{:#}", e)))?;
    report.duration_ms = start.elapsed().as_millis() as u64;
    progress.stage(7);

    info!(
        "IFC written to {}: {} walls, {} slabs, {} spaces, {} doors, {} windows, {} symbols ({} bytes, {}ms)",
        output_path.display(),
        report.walls,
        report.slabs,
        report.spaces,
        report.doors,
        report.windows,
        report.symbols,
        report.file_size,
        report.duration_ms
    );
    Ok(report)
}

/// Post-write check: the file exists, is not truncated and parses back
pub fn verify_ifc(path: &Path) -> Result<u64> {
    let size = fs::metadata(path)
        .with_context(|| format!("IFC file {} was not created", path.display()))?
        .len();
    if size < MIN_IFC_BYTES {
        anyhow::bail!("IFC file is too small ({} bytes)", size);
    }
    IfcFile::open(path).context("Written IFC file cannot be re-opened")?;
    Ok(size)
}

fn advisory(report: &mut IfcGenerationReport, what: &str, name: &str, result: Result<()>) {
    if let Err(e) = result {
        debug!("Could not set {} on {} (optional): {:#}", what, name, e);
        report.advisory_failures += 1;
    }
}

fn placement_mm(x: f64, y: f64, z: f64, angle: f64) -> Matrix4<f64> {
    Matrix4::new_translation(&Vector3::new(x, y, z)) * Matrix4::new_rotation(Vector3::new(0.0, 0.0, angle))
}

fn rectangle(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<[f64; 2]> {
    vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]]
}

fn populate<B: IfcBuilder>(builder: &mut B, plan: &PlanData, progress: &mut Progress) -> IfcGenerationReport {
    let mut report = IfcGenerationReport::default();
    let scale = plan.scale_ratio;
    let to_mm = |p: &Point| (p.x * scale * 1000.0, p.y * scale * 1000.0);

    progress.stage(0);
    let project = builder.create_entity(IfcClass::Project, "Sketch2BIM Project");

    progress.stage(1);
    let site = builder.create_entity(IfcClass::Site, "Default Site");
    let building = builder.create_entity(IfcClass::Building, "Building");
    let storey = builder.create_entity(IfcClass::BuildingStorey, "Ground Floor");
    for (parent, child) in [(project, site), (site, building), (building, storey)] {
        let result = builder.aggregate(parent, &[child]);
        advisory(&mut report, "aggregation", "spatial hierarchy", result);
    }
    for id in [site, building, storey] {
        let result = builder.set_placement(id, Matrix4::identity());
        advisory(&mut report, "placement", "spatial element", result);
    }

    let mut contained: Vec<EntityId> = Vec::new();

    progress.stage(2);
    for (i, wall) in plan.walls.iter().take(MAX_WALLS).enumerate() {
        let dx = (wall.end.x - wall.start.x) * scale;
        let dy = (wall.end.y - wall.start.y) * scale;
        let length = dx.hypot(dy);
        if length < MIN_WALL_LENGTH_M {
            report.skipped_walls += 1;
            continue;
        }

        let name = format!("Wall {}", i + 1);
        let id = builder.create_entity(IfcClass::WallStandardCase, &name);
        contained.push(id);
        report.walls += 1;

        let (x, y) = to_mm(&wall.start);
        let result = builder.set_placement(id, placement_mm(x, y, 0.0, dy.atan2(dx)));
        advisory(&mut report, "placement", &name, result);

        let half = WALL_THICKNESS_MM / 2.0;
        let profile = rectangle(0.0, -half, length * 1000.0, half);
        let result = builder.set_shape(id, Shape::Extrusion { profile, depth: WALL_HEIGHT_MM });
        advisory(&mut report, "geometry", &name, result);

        let result = builder.add_pset(
            id,
            "Pset_WallCommon",
            vec![
                Property::new("Thickness", PropertyValue::Length(WALL_THICKNESS_MM)),
                Property::new("Height", PropertyValue::Length(WALL_HEIGHT_MM)),
            ],
        );
        advisory(&mut report, "properties", &name, result);
    }
    report.skipped_walls += plan.walls.len().saturating_sub(MAX_WALLS);

    progress.stage(3);
    let mut spaces = Vec::new();
    for (i, room) in plan.rooms.iter().take(MAX_ROOMS).enumerate() {
        if room.polygon.len() < 3 {
            report.skipped_rooms += 1;
            continue;
        }

        let centroid = polygon_centroid(&room.polygon);
        let (cx, cy) = to_mm(&centroid);
        let profile: Vec<[f64; 2]> = room
            .polygon
            .iter()
            .map(|p| {
                let (x, y) = to_mm(p);
                [x - cx, y - cy]
            })
            .collect();

        let name = format!("Floor {}", i + 1);
        let slab = builder.create_entity(IfcClass::Slab, &name);
        contained.push(slab);
        report.slabs += 1;
        let result = builder.set_predefined_type(slab, "FLOOR");
        advisory(&mut report, "predefined type", &name, result);
        let result = builder.set_placement(slab, placement_mm(cx, cy, 0.0, 0.0));
        advisory(&mut report, "placement", &name, result);
        let result = builder.set_shape(
            slab,
            Shape::Extrusion {
                profile: profile.clone(),
                depth: SLAB_THICKNESS_MM,
            },
        );
        advisory(&mut report, "geometry", &name, result);

        let mut props = vec![Property::new("Thickness", PropertyValue::Length(SLAB_THICKNESS_MM))];
        if room.area_meters > 0.0 {
            props.push(Property::new("Area", PropertyValue::Area(room.area_meters)));
        }
        props.push(Property::new("RoomType", PropertyValue::Label(room.room_type.to_string())));
        let result = builder.add_pset(slab, "Pset_SlabCommon", props);
        advisory(&mut report, "properties", &name, result);

        let space_name = format!("Room {}", i + 1);
        let space = builder.create_entity(IfcClass::Space, &space_name);
        spaces.push(space);
        report.spaces += 1;
        let result = builder.set_long_name(space, room.room_type.as_str());
        advisory(&mut report, "long name", &space_name, result);
        let result = builder.set_predefined_type(space, "INTERNAL");
        advisory(&mut report, "predefined type", &space_name, result);
        let result = builder.set_placement(space, placement_mm(cx, cy, 0.0, 0.0));
        advisory(&mut report, "placement", &space_name, result);
        let result = builder.set_shape(space, Shape::Extrusion { profile, depth: WALL_HEIGHT_MM });
        advisory(&mut report, "geometry", &space_name, result);
        let result = builder.add_pset(
            space,
            "Pset_SpaceCommon",
            vec![
                Property::new("Area", PropertyValue::Area(room.area_meters)),
                Property::new("RoomType", PropertyValue::Label(room.room_type.to_string())),
            ],
        );
        advisory(&mut report, "properties", &space_name, result);
    }
    report.skipped_rooms += plan.rooms.len().saturating_sub(MAX_ROOMS);
    if !spaces.is_empty() {
        let result = builder.aggregate(storey, &spaces);
        advisory(&mut report, "aggregation", "spaces", result);
    }

    progress.stage(4);
    for opening in plan.openings.iter().take(MAX_OPENINGS) {
        let (class, height, z) = match opening.opening_type {
            OpeningType::Door => (IfcClass::Door, DOOR_HEIGHT_MM, 0.0),
            OpeningType::Window => (IfcClass::Window, WINDOW_HEIGHT_MM, WINDOW_SILL_MM),
        };
        let name = match opening.opening_type {
            OpeningType::Door => {
                report.doors += 1;
                format!("Door {}", report.doors)
            }
            OpeningType::Window => {
                report.windows += 1;
                format!("Window {}", report.windows)
            }
        };
        let id = builder.create_entity(class, &name);
        contained.push(id);

        // align with the closest wall when there is one
        let angle = plan
            .walls
            .iter()
            .min_by(|a, b| {
                a.distance_to_point(&opening.position)
                    .total_cmp(&b.distance_to_point(&opening.position))
            })
            .map(|w| (w.end.y - w.start.y).atan2(w.end.x - w.start.x))
            .unwrap_or(0.0);

        let width_mm = opening.width_meters * 1000.0;
        let (x, y) = to_mm(&opening.position);
        let result = builder.set_placement(id, placement_mm(x, y, z, angle));
        advisory(&mut report, "placement", &name, result);
        let half_w = width_mm / 2.0;
        let half_t = WALL_THICKNESS_MM / 2.0;
        let result = builder.set_shape(
            id,
            Shape::Extrusion {
                profile: rectangle(-half_w, -half_t, half_w, half_t),
                depth: height,
            },
        );
        advisory(&mut report, "geometry", &name, result);
        let result = builder.set_overall_size(id, height, width_mm);
        advisory(&mut report, "overall size", &name, result);
    }

    progress.stage(5);
    for symbol in plan.symbols.iter().take(MAX_SYMBOLS) {
        let class = symbol_class(symbol);
        let name = if symbol.display_name.is_empty() {
            symbol.label.clone()
        } else {
            symbol.display_name.clone()
        };
        let id = builder.create_entity(class.clone(), &name);
        contained.push(id);
        report.symbols += 1;

        let [x1, y1, x2, y2] = symbol.bbox;
        let (ax, ay) = to_mm(&Point::new(x1, y1));
        let (bx, by) = to_mm(&Point::new(x2, y2));
        let (cx, cy) = ((ax + bx) / 2.0, (ay + by) / 2.0);
        let result = builder.set_placement(id, placement_mm(cx, cy, 0.0, 0.0));
        advisory(&mut report, "placement", &name, result);

        let has_body = matches!(
            class,
            IfcClass::FurnishingElement | IfcClass::BuildingElementProxy | IfcClass::FlowTerminal
        );
        if has_body {
            let (hw, hh) = (((bx - ax) / 2.0).abs(), ((by - ay) / 2.0).abs());
            let result = builder.set_shape(
                id,
                Shape::Extrusion {
                    profile: rectangle(-hw, -hh, hw, hh),
                    depth: SYMBOL_HEIGHT_MM,
                },
            );
            advisory(&mut report, "geometry", &name, result);
        }

        let bbox_text = symbol
            .bbox
            .iter()
            .map(|v| format!("{:.2}", v))
            .collect::<Vec<_>>()
            .join(",");
        let result = builder.add_pset(
            id,
            "Pset_SymbolDetection",
            vec![
                Property::new("Label", PropertyValue::Label(symbol.label.clone())),
                Property::new("DisplayName", PropertyValue::Label(symbol.display_name.clone())),
                Property::new("Category", PropertyValue::Label(symbol.category.as_str().to_string())),
                Property::new("Confidence", PropertyValue::Real(symbol.confidence)),
                Property::new("AreaPixels", PropertyValue::Real(symbol.area_pixels)),
                Property::new("Source", PropertyValue::Label(symbol.source.clone())),
                Property::new("BBox", PropertyValue::Text(bbox_text)),
                Property::new(
                    "IfcTypeHint",
                    PropertyValue::Label(symbol.ifc_type.clone().unwrap_or_default()),
                ),
            ],
        );
        advisory(&mut report, "properties", &name, result);
    }

    if !contained.is_empty() {
        let result = builder.contain(storey, &contained);
        advisory(&mut report, "containment", "storey elements", result);
    }

    report
}

/// Known `ifc_type` hint first, otherwise by category
pub fn symbol_class(symbol: &Symbol) -> IfcClass {
    if let Some(hint) = symbol.ifc_type.as_deref() {
        let class = IfcClass::from_name(hint);
        if !matches!(class, IfcClass::Custom(_)) && class.is_product() && !class.is_spatial() {
            return class;
        }
    }
    match symbol.category {
        SymbolCategory::InteriorFurniture => IfcClass::FurnishingElement,
        SymbolCategory::MepSystems => IfcClass::FlowTerminal,
        SymbolCategory::Structural | SymbolCategory::ArchitecturalCore => IfcClass::BuildingElementProxy,
        _ => IfcClass::Annotation,
    }
}
