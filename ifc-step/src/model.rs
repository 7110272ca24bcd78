use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

/// Index of an element inside an `IfcModel`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub usize);

/// IFC classes this toolkit emits or counts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IfcClass {
    Project,
    Site,
    Building,
    BuildingStorey,
    Space,
    Zone,
    Wall,
    WallStandardCase,
    Slab,
    Roof,
    Door,
    Window,
    Column,
    Beam,
    BuildingElementProxy,
    FurnishingElement,
    FlowTerminal,
    Annotation,
    Custom(String),
}

impl IfcClass {
    /// Schema spelling, e.g. `IfcWallStandardCase`
    pub fn name(&self) -> &str {
        match self {
            IfcClass::Project => "IfcProject",
            IfcClass::Site => "IfcSite",
            IfcClass::Building => "IfcBuilding",
            IfcClass::BuildingStorey => "IfcBuildingStorey",
            IfcClass::Space => "IfcSpace",
            IfcClass::Zone => "IfcZone",
            IfcClass::Wall => "IfcWall",
            IfcClass::WallStandardCase => "IfcWallStandardCase",
            IfcClass::Slab => "IfcSlab",
            IfcClass::Roof => "IfcRoof",
            IfcClass::Door => "IfcDoor",
            IfcClass::Window => "IfcWindow",
            IfcClass::Column => "IfcColumn",
            IfcClass::Beam => "IfcBeam",
            IfcClass::BuildingElementProxy => "IfcBuildingElementProxy",
            IfcClass::FurnishingElement => "IfcFurnishingElement",
            IfcClass::FlowTerminal => "IfcFlowTerminal",
            IfcClass::Annotation => "IfcAnnotation",
            IfcClass::Custom(name) => name,
        }
    }

    /// Upper-case keyword used in STEP files, e.g. `IFCWALLSTANDARDCASE`
    pub fn step_keyword(&self) -> String {
        self.name().to_ascii_uppercase()
    }

    /// Case-insensitive lookup; unknown names become `Custom`
    pub fn from_name(name: &str) -> Self {
        Self::known()
            .into_iter()
            .find(|class| class.name().eq_ignore_ascii_case(name))
            .unwrap_or_else(|| IfcClass::Custom(name.to_string()))
    }

    /// Every non-custom class
    pub fn known() -> Vec<IfcClass> {
        vec![
            IfcClass::Project,
            IfcClass::Site,
            IfcClass::Building,
            IfcClass::BuildingStorey,
            IfcClass::Space,
            IfcClass::Zone,
            IfcClass::Wall,
            IfcClass::WallStandardCase,
            IfcClass::Slab,
            IfcClass::Roof,
            IfcClass::Door,
            IfcClass::Window,
            IfcClass::Column,
            IfcClass::Beam,
            IfcClass::BuildingElementProxy,
            IfcClass::FurnishingElement,
            IfcClass::FlowTerminal,
            IfcClass::Annotation,
        ]
    }

    /// The class itself plus the subtypes the toolkit knows about
    pub fn with_subtypes(&self) -> Vec<IfcClass> {
        match self {
            IfcClass::Wall => vec![IfcClass::Wall, IfcClass::WallStandardCase],
            other => vec![other.clone()],
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            IfcClass::Site | IfcClass::Building | IfcClass::BuildingStorey | IfcClass::Space
        )
    }

    /// IfcRoot subtypes that carry an ObjectPlacement attribute
    pub fn is_product(&self) -> bool {
        !matches!(self, IfcClass::Project | IfcClass::Zone)
    }
}

/// Typed property value, mapped onto IFC measure types on write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Length(f64),
    Area(f64),
    Real(f64),
    Integer(i64),
    Boolean(bool),
    Label(String),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Length(v) | PropertyValue::Area(v) | PropertyValue::Real(v) => Some(*v),
            PropertyValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Label(s) | PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(name: &str, value: PropertyValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    pub name: String,
    pub properties: Vec<Property>,
}

/// Body geometry, expressed in the element's local coordinates (millimetres)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Closed planar profile in local XY extruded along local +Z
    Extrusion { profile: Vec<[f64; 2]>, depth: f64 },
}

/// One IfcRoot entity plus the relationships it owns
#[derive(Debug, Clone)]
pub struct Element {
    pub id: EntityId,
    pub class: IfcClass,
    pub global_id: String,
    pub name: String,
    pub object_type: Option<String>,
    pub long_name: Option<String>,
    pub predefined_type: Option<String>,
    /// (height, width) for doors and windows
    pub overall_size: Option<(f64, f64)>,
    /// Absolute placement in millimetres
    pub placement: Option<Matrix4<f64>>,
    pub shape: Option<Shape>,
    pub psets: Vec<PropertySet>,
    /// Decomposition (IfcRelAggregates)
    pub children: Vec<EntityId>,
    /// Spatial containment (IfcRelContainedInSpatialStructure)
    pub contained: Vec<EntityId>,
}

/// In-memory IFC model. Lengths are millimetres, areas square metres.
#[derive(Debug, Clone)]
pub struct IfcModel {
    pub schema: String,
    pub elements: Vec<Element>,
}

impl Default for IfcModel {
    fn default() -> Self {
        Self {
            schema: "IFC4".to_string(),
            elements: Vec::new(),
        }
    }
}

impl IfcModel {
    pub fn get(&self, id: EntityId) -> Option<&Element> {
        self.elements.get(id.0)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Element> {
        self.elements.get_mut(id.0)
    }

    pub fn project(&self) -> Option<&Element> {
        self.elements.iter().find(|e| e.class == IfcClass::Project)
    }

    pub fn count(&self, class: &IfcClass) -> usize {
        self.elements.iter().filter(|e| &e.class == class).count()
    }

    /// Element that aggregates or contains `id`, if any
    pub fn parent_of(&self, id: EntityId) -> Option<EntityId> {
        self.elements
            .iter()
            .find(|e| e.children.contains(&id) || e.contained.contains(&id))
            .map(|e| e.id)
    }
}
