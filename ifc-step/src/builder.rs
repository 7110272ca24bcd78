use anyhow::{anyhow, bail, Result};
use nalgebra::Matrix4;

use crate::guid;
use crate::model::{Element, EntityId, IfcClass, IfcModel, Property, PropertySet, Shape};

/// Construction interface used by the model generator.
///
/// Everything beyond `create_entity` is fallible so callers can treat
/// placement, geometry and property attachment as advisory.
pub trait IfcBuilder {
    fn create_entity(&mut self, class: IfcClass, name: &str) -> EntityId;

    fn set_placement(&mut self, id: EntityId, matrix: Matrix4<f64>) -> Result<()>;

    fn set_shape(&mut self, id: EntityId, shape: Shape) -> Result<()>;

    fn add_pset(&mut self, id: EntityId, name: &str, properties: Vec<Property>) -> Result<()>;

    /// Decompose `parent` into `children` (IfcRelAggregates)
    fn aggregate(&mut self, parent: EntityId, children: &[EntityId]) -> Result<()>;

    /// Place `elements` inside the spatial structure `storey`
    fn contain(&mut self, storey: EntityId, elements: &[EntityId]) -> Result<()>;

    fn set_predefined_type(&mut self, id: EntityId, predefined_type: &str) -> Result<()>;

    fn set_long_name(&mut self, id: EntityId, long_name: &str) -> Result<()>;

    fn set_object_type(&mut self, id: EntityId, object_type: &str) -> Result<()>;

    fn set_overall_size(&mut self, id: EntityId, height: f64, width: f64) -> Result<()>;
}

/// Builder that accumulates an `IfcModel` for the STEP writer
#[derive(Debug, Default)]
pub struct StepModelBuilder {
    model: IfcModel,
}

impl StepModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self) -> &IfcModel {
        &self.model
    }

    pub fn finish(self) -> IfcModel {
        self.model
    }

    fn element_mut(&mut self, id: EntityId) -> Result<&mut Element> {
        self.model
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown entity {:?}", id))
    }
}

impl IfcBuilder for StepModelBuilder {
    fn create_entity(&mut self, class: IfcClass, name: &str) -> EntityId {
        let id = EntityId(self.model.elements.len());
        self.model.elements.push(Element {
            id,
            class,
            global_id: guid::new_global_id(),
            name: name.to_string(),
            object_type: None,
            long_name: None,
            predefined_type: None,
            overall_size: None,
            placement: None,
            shape: None,
            psets: Vec::new(),
            children: Vec::new(),
            contained: Vec::new(),
        });
        id
    }

    fn set_placement(&mut self, id: EntityId, matrix: Matrix4<f64>) -> Result<()> {
        let element = self.element_mut(id)?;
        if !element.class.is_product() {
            bail!("{} has no ObjectPlacement", element.class.name());
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            bail!("Placement for {} is not finite", element.name);
        }
        element.placement = Some(matrix);
        Ok(())
    }

    fn set_shape(&mut self, id: EntityId, shape: Shape) -> Result<()> {
        let element = self.element_mut(id)?;
        match &shape {
            Shape::Extrusion { profile, depth } => {
                if profile.len() < 3 {
                    bail!("Profile for {} has fewer than 3 points", element.name);
                }
                if *depth <= 0.0 || !depth.is_finite() {
                    bail!("Extrusion depth for {} must be positive", element.name);
                }
            }
        }
        element.shape = Some(shape);
        Ok(())
    }

    fn add_pset(&mut self, id: EntityId, name: &str, properties: Vec<Property>) -> Result<()> {
        if name.is_empty() {
            bail!("Property set needs a name");
        }
        let element = self.element_mut(id)?;
        match element.psets.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.properties.extend(properties),
            None => element.psets.push(PropertySet {
                name: name.to_string(),
                properties,
            }),
        }
        Ok(())
    }

    fn aggregate(&mut self, parent: EntityId, children: &[EntityId]) -> Result<()> {
        for child in children {
            if self.model.get(*child).is_none() {
                bail!("Unknown child entity {:?}", child);
            }
            if *child == parent {
                bail!("Entity cannot aggregate itself");
            }
        }
        let element = self.element_mut(parent)?;
        element.children.extend_from_slice(children);
        Ok(())
    }

    fn contain(&mut self, storey: EntityId, elements: &[EntityId]) -> Result<()> {
        for id in elements {
            if self.model.get(*id).is_none() {
                bail!("Unknown contained entity {:?}", id);
            }
        }
        let element = self.element_mut(storey)?;
        if !element.class.is_spatial() {
            bail!("{} is not a spatial structure element", element.class.name());
        }
        element.contained.extend_from_slice(elements);
        Ok(())
    }

    fn set_predefined_type(&mut self, id: EntityId, predefined_type: &str) -> Result<()> {
        self.element_mut(id)?.predefined_type = Some(predefined_type.to_ascii_uppercase());
        Ok(())
    }

    fn set_long_name(&mut self, id: EntityId, long_name: &str) -> Result<()> {
        self.element_mut(id)?.long_name = Some(long_name.to_string());
        Ok(())
    }

    fn set_object_type(&mut self, id: EntityId, object_type: &str) -> Result<()> {
        self.element_mut(id)?.object_type = Some(object_type.to_string());
        Ok(())
    }

    fn set_overall_size(&mut self, id: EntityId, height: f64, width: f64) -> Result<()> {
        let element = self.element_mut(id)?;
        if !matches!(element.class, IfcClass::Door | IfcClass::Window) {
            bail!("{} has no overall size attributes", element.class.name());
        }
        element.overall_size = Some((height, width));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyValue;

    #[test]
    fn test_create_and_contain() {
        let mut builder = StepModelBuilder::new();
        let storey = builder.create_entity(IfcClass::BuildingStorey, "Ground Floor");
        let wall = builder.create_entity(IfcClass::WallStandardCase, "Wall 1");

        builder.contain(storey, &[wall]).unwrap();

        let model = builder.finish();
        assert_eq!(model.elements.len(), 2);
        assert_eq!(model.get(storey).unwrap().contained, vec![wall]);
        assert_eq!(model.parent_of(wall), Some(storey));
    }

    #[test]
    fn test_contain_requires_spatial_parent() {
        let mut builder = StepModelBuilder::new();
        let wall = builder.create_entity(IfcClass::Wall, "Wall 1");
        let door = builder.create_entity(IfcClass::Door, "Door 1");
        assert!(builder.contain(wall, &[door]).is_err());
    }

    #[test]
    fn test_project_has_no_placement() {
        let mut builder = StepModelBuilder::new();
        let project = builder.create_entity(IfcClass::Project, "P");
        assert!(builder.set_placement(project, Matrix4::identity()).is_err());
    }

    #[test]
    fn test_psets_with_same_name_merge() {
        let mut builder = StepModelBuilder::new();
        let wall = builder.create_entity(IfcClass::Wall, "Wall 1");
        builder
            .add_pset(wall, "Pset_WallCommon", vec![Property::new("Thickness", PropertyValue::Length(200.0))])
            .unwrap();
        builder
            .add_pset(wall, "Pset_WallCommon", vec![Property::new("Height", PropertyValue::Length(3000.0))])
            .unwrap();

        let model = builder.finish();
        let element = model.get(wall).unwrap();
        assert_eq!(element.psets.len(), 1);
        assert_eq!(element.psets[0].properties.len(), 2);
    }

    #[test]
    fn test_degenerate_shape_rejected() {
        let mut builder = StepModelBuilder::new();
        let slab = builder.create_entity(IfcClass::Slab, "Floor 1");
        let shape = Shape::Extrusion {
            profile: vec![[0.0, 0.0], [1.0, 0.0]],
            depth: 200.0,
        };
        assert!(builder.set_shape(slab, shape).is_err());
    }
}
