//! Secondary artifacts derived from a generated IFC file.
//!
//! Each exporter opens its own `IfcFile` and fails independently; `export_all`
//! collects whatever succeeded and turns the rest into warnings.

use anyhow::{Context, Result};
use ifc_step::model::IfcClass;
use ifc_step::{IfcFile, Mesh};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::ExportConfig;
use crate::dxf_export::{export_to_dxf, write_dwg_alias};
use crate::error::PipelineError;
use crate::preview::generate_preview;

/// Body mesh of one IFC product, in metres
#[derive(Debug, Clone)]
pub struct ElementMesh {
    pub step_id: u32,
    pub class: IfcClass,
    pub name: String,
    pub mesh: Mesh,
}

/// Meshes for every instance of `classes`, in class order then file order.
/// Elements without a body are skipped; tessellation failures are logged.
pub fn element_meshes(file: &IfcFile, classes: &[IfcClass]) -> Vec<ElementMesh> {
    let mut out = Vec::new();
    for class in classes {
        for entity in file.by_class(class) {
            match file.product_mesh(entity) {
                Ok(Some(mesh)) => out.push(ElementMesh {
                    step_id: entity.id,
                    class: entity.class(),
                    name: entity.name().unwrap_or_default().to_string(),
                    mesh,
                }),
                Ok(None) => {}
                Err(e) => warn!("Skipping #{} {}: {:#}", entity.id, entity.keyword, e),
            }
        }
    }
    out
}

/// `{path}.tmp` next to `path`
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write under a temporary name, then rename into place
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move file into {}", path.display()))?;
    Ok(())
}

fn obj_group_name(element: &ElementMesh) -> String {
    let base = if element.name.is_empty() {
        format!("{}_{}", element.class.name(), element.step_id)
    } else {
        element.name.clone()
    };
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Wavefront OBJ text for the given meshes
pub fn render_obj(elements: &[ElementMesh], source: &str) -> String {
    let vertices: usize = elements.iter().map(|e| e.mesh.vertices.len()).sum();
    let faces: usize = elements.iter().map(|e| e.mesh.triangles.len()).sum();

    let mut out = String::new();
    let _ = writeln!(out, "# sketch2bim OBJ export");
    let _ = writeln!(out, "# source: {}", source);
    let _ = writeln!(out, "# {} vertices, {} faces", vertices, faces);

    let mut offset = 1;
    for element in elements {
        let _ = writeln!(out, "o {}", obj_group_name(element));
        for v in &element.mesh.vertices {
            let _ = writeln!(out, "v {:.6} {:.6} {:.6}", v[0], v[1], v[2]);
        }
        for t in &element.mesh.triangles {
            let _ = writeln!(out, "f {} {} {}", t[0] + offset, t[1] + offset, t[2] + offset);
        }
        offset += element.mesh.vertices.len();
    }
    out
}

/// Walls, doors, windows and slabs as a triangle mesh
pub fn export_to_obj(ifc_path: &Path, obj_path: &Path) -> Result<usize> {
    let file = IfcFile::open(ifc_path)?;
    let classes = [IfcClass::Wall, IfcClass::Door, IfcClass::Window, IfcClass::Slab];
    let elements = element_meshes(&file, &classes);
    let source = ifc_path.file_name().unwrap_or_default().to_string_lossy();
    write_atomic(obj_path, render_obj(&elements, &source).as_bytes())?;
    info!("OBJ written to {} ({} objects)", obj_path.display(), elements.len());
    Ok(elements.len())
}

/// IFC copy named for Revit's IFC import
pub fn export_to_rvt(ifc_path: &Path, rvt_path: &Path) -> Result<()> {
    let tmp = tmp_path(rvt_path);
    fs::copy(ifc_path, &tmp).with_context(|| format!("Failed to copy {}", ifc_path.display()))?;
    fs::rename(&tmp, rvt_path).with_context(|| format!("Failed to move file into {}", rvt_path.display()))?;
    info!("IFC prepared for Revit import: {}", rvt_path.display());
    Ok(())
}

/// Which artifacts were produced. Missing formats are listed in `warnings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportArtifacts {
    pub dxf: Option<PathBuf>,
    pub dwg: Option<PathBuf>,
    pub obj: Option<PathBuf>,
    pub preview: Option<PathBuf>,
    pub rvt: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Selects the formats `export_all` produces
#[derive(Debug, Clone, Copy)]
pub struct ExportSelection {
    pub dxf: bool,
    pub obj: bool,
    pub preview: bool,
    pub rvt: bool,
}

impl Default for ExportSelection {
    fn default() -> Self {
        Self {
            dxf: true,
            obj: true,
            preview: true,
            rvt: true,
        }
    }
}

fn record<T>(warnings: &mut Vec<String>, format: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            let err = PipelineError::ExportFailed {
                format: format.to_string(),
                reason: format!("{:#}", e),
            };
            warn!("{}", err);
            warnings.push(err.to_string());
            None
        }
    }
}

/// Write `{job_id}.dxf` (+ `.dwg`), `{job_id}.obj`, `{job_id}_preview.png`
/// and `{job_id}.rvt.ifc` into `out_dir`
pub fn export_all(
    ifc_path: &Path,
    out_dir: &Path,
    job_id: &str,
    config: &ExportConfig,
    selection: ExportSelection,
) -> ExportArtifacts {
    let start = Instant::now();
    let mut artifacts = ExportArtifacts::default();
    let warnings = &mut artifacts.warnings;

    if selection.dxf {
        let dxf_path = out_dir.join(format!("{}.dxf", job_id));
        if record(warnings, "DXF", export_to_dxf(ifc_path, &dxf_path)).is_some() {
            artifacts.dwg = record(warnings, "DWG", write_dwg_alias(&dxf_path));
            artifacts.dxf = Some(dxf_path);
        }
    }

    if selection.obj {
        let obj_path = out_dir.join(format!("{}.obj", job_id));
        artifacts.obj = record(warnings, "OBJ", export_to_obj(ifc_path, &obj_path)).map(|_| obj_path);
    }

    if selection.preview {
        let png_path = out_dir.join(format!("{}_preview.png", job_id));
        artifacts.preview = record(warnings, "preview", generate_preview(ifc_path, &png_path, config))
            .map(|_| png_path);
    }

    if selection.rvt {
        let rvt_path = out_dir.join(format!("{}.rvt.ifc", job_id));
        artifacts.rvt = record(warnings, "RVT", export_to_rvt(ifc_path, &rvt_path)).map(|_| rvt_path);
    }

    info!(
        "Exports for {} finished in {}ms ({} warnings)",
        job_id,
        start.elapsed().as_millis(),
        artifacts.warnings.len()
    );
    artifacts
}
