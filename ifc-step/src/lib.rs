//! Minimal IFC4 toolkit: an entity model, a builder interface, and a STEP
//! (ISO 10303-21) writer and reader.
//!
//! The builder is the only surface the model generator talks to, so swapping
//! the serialisation backend means replacing `StepModelBuilder` and nothing else.

pub mod builder;
pub mod geometry;
pub mod guid;
pub mod model;
pub mod reader;
pub mod writer;

pub use builder::{IfcBuilder, StepModelBuilder};
pub use geometry::Mesh;
pub use model::{
    Element, EntityId, IfcClass, IfcModel, Property, PropertySet, PropertyValue, Shape,
};
pub use reader::{IfcFile, StepEntity, StepValue};
pub use writer::{write_step, write_to_path};
