//! Tessellation of extruded-area solids read back from STEP files.

use anyhow::{anyhow, Result};
use nalgebra::{Matrix4, Point3, Vector3};

use crate::reader::{IfcFile, StepEntity, StepValue};

/// Indexed triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f64; 3]>,
    pub triangles: Vec<[usize; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    pub fn append(&mut self, other: &Mesh) {
        let offset = self.vertices.len();
        self.vertices.extend_from_slice(&other.vertices);
        self.triangles.extend(
            other
                .triangles
                .iter()
                .map(|t| [t[0] + offset, t[1] + offset, t[2] + offset]),
        );
    }

    pub fn transform(&mut self, m: &Matrix4<f64>) {
        for v in &mut self.vertices {
            let p = m.transform_point(&Point3::new(v[0], v[1], v[2]));
            *v = [p.x, p.y, p.z];
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.vertices {
            v[0] *= factor;
            v[1] *= factor;
            v[2] *= factor;
        }
    }

    /// Axis-aligned bounds as (min, max)
    pub fn bounds(&self) -> Option<([f64; 3], [f64; 3])> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(mut lo, mut hi), v| {
            for i in 0..3 {
                lo[i] = lo[i].min(v[i]);
                hi[i] = hi[i].max(v[i]);
            }
            (lo, hi)
        }))
    }
}

/// Triangulate a simple polygon. Returns indices into `points`.
pub fn triangulate_polygon(points: &[[f64; 2]]) -> Result<Vec<[usize; 3]>> {
    let n = points.len();
    if n < 3 {
        return Err(anyhow!("Polygon needs at least 3 points, got {}", n));
    }

    // Fast paths
    if n == 3 {
        return Ok(vec![[0, 1, 2]]);
    }
    if is_convex(points) {
        return Ok((1..n - 1).map(|i| [0, i, i + 1]).collect());
    }

    let flat: Vec<f64> = points.iter().flat_map(|p| [p[0], p[1]]).collect();
    let indices = earcutr::earcut(&flat, &[], 2)
        .map_err(|e| anyhow!("Triangulation failed: {:?}", e))?;

    if indices.len() < 3 {
        return Err(anyhow!("Triangulation produced no triangles"));
    }
    Ok(indices.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn is_convex(points: &[[f64; 2]]) -> bool {
    let n = points.len();
    let mut sign = 0.0f64;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let c = points[(i + 2) % n];
        let cross = (b[0] - a[0]) * (c[1] - b[1]) - (b[1] - a[1]) * (c[0] - b[0]);
        if cross.abs() < 1e-12 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    sign != 0.0
}

/// Extrude a closed profile along `direction` (already scaled to the depth)
pub fn extrude(profile: &[[f64; 2]], direction: Vector3<f64>) -> Result<Mesh> {
    let cap = triangulate_polygon(profile)?;
    let n = profile.len();

    let mut vertices = Vec::with_capacity(n * 2);
    for p in profile {
        vertices.push([p[0], p[1], 0.0]);
    }
    for p in profile {
        vertices.push([p[0] + direction.x, p[1] + direction.y, direction.z]);
    }

    let mut triangles = Vec::with_capacity(cap.len() * 2 + n * 2);
    for t in &cap {
        triangles.push([t[0], t[2], t[1]]);
        triangles.push([t[0] + n, t[1] + n, t[2] + n]);
    }
    for i in 0..n {
        let j = (i + 1) % n;
        triangles.push([i, j, j + n]);
        triangles.push([i, j + n, i + n]);
    }

    Ok(Mesh { vertices, triangles })
}

impl IfcFile {
    /// World-space body mesh of a product in metres, or None when it has no
    /// extruded-area-solid representation.
    pub fn product_mesh(&self, product: &StepEntity) -> Result<Option<Mesh>> {
        let Some(shape_id) = product.arg(6).and_then(StepValue::as_ref_id) else {
            return Ok(None);
        };
        let shape = self
            .get(shape_id)
            .ok_or_else(|| anyhow!("#{} references missing shape #{}", product.id, shape_id))?;

        let mut mesh = Mesh::default();
        for rep_id in refs_in(shape.arg(2)) {
            let Some(rep) = self.get(rep_id) else { continue };
            if rep.keyword != "IFCSHAPEREPRESENTATION" {
                continue;
            }
            for item_id in refs_in(rep.arg(3)) {
                let Some(item) = self.get(item_id) else { continue };
                if item.keyword == "IFCEXTRUDEDAREASOLID" {
                    mesh.append(&self.extruded_solid(item)?);
                }
            }
        }

        if mesh.is_empty() {
            return Ok(None);
        }

        let placement = self.placement(product).unwrap_or_else(Matrix4::identity);
        mesh.transform(&placement);
        mesh.scale(self.length_unit_scale());
        Ok(Some(mesh))
    }

    fn extruded_solid(&self, solid: &StepEntity) -> Result<Mesh> {
        let profile_id = solid
            .arg(0)
            .and_then(StepValue::as_ref_id)
            .ok_or_else(|| anyhow!("#{} has no swept area", solid.id))?;
        let profile = self.profile_points(profile_id)?;

        let direction = solid
            .arg(2)
            .and_then(StepValue::as_ref_id)
            .and_then(|id| self.get(id))
            .and_then(|d| self.coordinates(d))
            .map(|c| Vector3::new(c[0], *c.get(1).unwrap_or(&0.0), *c.get(2).unwrap_or(&0.0)))
            .unwrap_or_else(Vector3::z);
        let depth = solid
            .arg(3)
            .and_then(StepValue::as_f64)
            .ok_or_else(|| anyhow!("#{} has no depth", solid.id))?;
        if direction.norm() < 1e-12 {
            return Err(anyhow!("#{} has a zero extrusion direction", solid.id));
        }

        let mut mesh = extrude(&profile, direction.normalize() * depth)?;
        if let Some(position) = solid
            .arg(1)
            .and_then(StepValue::as_ref_id)
            .and_then(|id| self.axis_placement(id))
        {
            mesh.transform(&position);
        }
        Ok(mesh)
    }

    fn profile_points(&self, profile_id: u32) -> Result<Vec<[f64; 2]>> {
        let profile = self
            .get(profile_id)
            .ok_or_else(|| anyhow!("Missing profile #{}", profile_id))?;

        match profile.keyword.as_str() {
            "IFCARBITRARYCLOSEDPROFILEDEF" => {
                let curve = profile
                    .arg(2)
                    .and_then(StepValue::as_ref_id)
                    .and_then(|id| self.get(id))
                    .ok_or_else(|| anyhow!("#{} has no outer curve", profile.id))?;
                if curve.keyword != "IFCPOLYLINE" {
                    return Err(anyhow!("Unsupported profile curve {}", curve.keyword));
                }
                let mut points: Vec<[f64; 2]> = refs_in(curve.arg(0))
                    .into_iter()
                    .filter_map(|id| self.get(id))
                    .filter_map(|p| self.coordinates(p))
                    .filter(|c| c.len() >= 2)
                    .map(|c| [c[0], c[1]])
                    .collect();
                if points.len() > 1 && points.first() == points.last() {
                    points.pop();
                }
                Ok(points)
            }
            "IFCRECTANGLEPROFILEDEF" => {
                let x = profile.arg(3).and_then(StepValue::as_f64).unwrap_or(0.0) / 2.0;
                let y = profile.arg(4).and_then(StepValue::as_f64).unwrap_or(0.0) / 2.0;
                Ok(vec![[-x, -y], [x, -y], [x, y], [-x, y]])
            }
            other => Err(anyhow!("Unsupported profile {}", other)),
        }
    }
}

fn refs_in(value: Option<&StepValue>) -> Vec<u32> {
    value
        .and_then(StepValue::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(StepValue::as_ref_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{IfcBuilder, StepModelBuilder};
    use crate::model::{IfcClass, Shape};
    use crate::writer::write_step;

    #[test]
    fn test_convex_fan() {
        let square = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert_eq!(triangulate_polygon(&square).unwrap().len(), 2);
    }

    #[test]
    fn test_concave_l_shape() {
        let l_shape = [
            [0.0, 0.0],
            [2.0, 0.0],
            [2.0, 1.0],
            [1.0, 1.0],
            [1.0, 2.0],
            [0.0, 2.0],
        ];
        assert!(!is_convex(&l_shape));
        assert_eq!(triangulate_polygon(&l_shape).unwrap().len(), 4);
    }

    #[test]
    fn test_extrude_box() {
        let square = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let mesh = extrude(&square, Vector3::new(0.0, 0.0, 3.0)).unwrap();
        assert_eq!(mesh.vertices.len(), 8);
        // 2 per cap + 2 per side
        assert_eq!(mesh.triangles.len(), 12);
        let (lo, hi) = mesh.bounds().unwrap();
        assert_eq!(lo, [0.0, 0.0, 0.0]);
        assert_eq!(hi, [1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_product_mesh_in_metres() {
        let mut builder = StepModelBuilder::new();
        let project = builder.create_entity(IfcClass::Project, "P");
        let storey = builder.create_entity(IfcClass::BuildingStorey, "Ground Floor");
        builder.aggregate(project, &[storey]).unwrap();
        let wall = builder.create_entity(IfcClass::WallStandardCase, "Wall 1");
        builder.contain(storey, &[wall]).unwrap();
        builder
            .set_placement(wall, Matrix4::new_translation(&Vector3::new(1000.0, 0.0, 0.0)))
            .unwrap();
        builder
            .set_shape(
                wall,
                Shape::Extrusion {
                    profile: vec![[0.0, -100.0], [4000.0, -100.0], [4000.0, 100.0], [0.0, 100.0]],
                    depth: 3000.0,
                },
            )
            .unwrap();

        let text = write_step(&builder.finish(), "mesh.ifc").unwrap();
        let file = IfcFile::parse(&text).unwrap();
        let entity = file.by_class(&IfcClass::Wall)[0];
        let mesh = file.product_mesh(entity).unwrap().unwrap();

        let (lo, hi) = mesh.bounds().unwrap();
        assert!((lo[0] - 1.0).abs() < 1e-9);
        assert!((hi[0] - 5.0).abs() < 1e-9);
        assert!((hi[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_product_without_shape_has_no_mesh() {
        let mut builder = StepModelBuilder::new();
        builder.create_entity(IfcClass::Project, "P");
        builder.create_entity(IfcClass::Annotation, "Note");
        let text = write_step(&builder.finish(), "a.ifc").unwrap();
        let file = IfcFile::parse(&text).unwrap();
        let entity = file.by_class(&IfcClass::Annotation)[0];
        assert!(file.product_mesh(entity).unwrap().is_none());
    }
}
