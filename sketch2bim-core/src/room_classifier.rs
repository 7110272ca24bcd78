//! Room type refinement: legend labels first, then an optional vision model,
//! then shape heuristics.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plan::{ClassificationMethod, LegendData, Room, RoomType};
use crate::room_detector::{aspect_ratio, polygon_area, simplify_polygon};

const LEGEND_CONFIDENCE: f64 = 90.0;
const HEURISTIC_BASE: f64 = 60.0;
const HEURISTIC_CAP: f64 = 85.0;
const FALLBACK_CONFIDENCE: f64 = 30.0;
/// Classifications at or below this keep the reader's provisional label
const APPLY_THRESHOLD: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomClassification {
    pub room_type: RoomType,
    /// 0–100
    pub confidence: f64,
    pub reasoning: String,
    pub method: ClassificationMethod,
}

/// Vision model hook for the middle tier. No implementation ships by default.
pub trait RoomVisionModel: Send + Sync {
    fn classify(&self, room: &Room) -> Result<RoomClassification>;

    fn model_info(&self) -> String;
}

/// Shape descriptors used by the heuristic tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeFeatures {
    /// 4π·A/P², 1 for a circle
    pub compactness: f64,
    pub aspect_ratio: f64,
    pub corners: usize,
}

impl ShapeFeatures {
    pub fn of(room: &Room) -> Self {
        let perimeter = room.perimeter();
        let area = polygon_area(&room.polygon);
        let compactness = if perimeter > 0.0 {
            4.0 * PI * area / (perimeter * perimeter)
        } else {
            0.0
        };
        Self {
            compactness,
            aspect_ratio: aspect_ratio(&room.polygon),
            corners: simplify_polygon(&room.polygon, 0.02 * perimeter).len(),
        }
    }
}

#[derive(Clone, Default)]
pub struct RoomClassifier {
    model: Option<Arc<dyn RoomVisionModel>>,
}

impl RoomClassifier {
    pub fn new() -> Self {
        Self { model: None }
    }

    pub fn with_model(model: Arc<dyn RoomVisionModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn classify_room(&self, room: &Room, legend: Option<&LegendData>) -> RoomClassification {
        if room.polygon.len() < 3 {
            return RoomClassification {
                room_type: RoomType::Bedroom,
                confidence: FALLBACK_CONFIDENCE,
                reasoning: "No polygon data available".to_string(),
                method: ClassificationMethod::Fallback,
            };
        }

        if let Some(found) = legend.and_then(|l| match_legend_label(room, l)) {
            return found;
        }

        if let Some(model) = &self.model {
            match model.classify(room) {
                Ok(result) => return result,
                Err(e) => warn!("{} failed on room {}: {:#}", model.model_info(), room.id, e),
            }
        }

        classify_by_shape(room.area_meters, &ShapeFeatures::of(room))
    }

    /// Classify every room and apply results whose confidence clears the bar
    pub fn classify_rooms(&self, rooms: &mut [Room], legend: Option<&LegendData>) -> usize {
        let mut applied = 0;
        for room in rooms.iter_mut() {
            let result = self.classify_room(room, legend);
            if result.confidence > APPLY_THRESHOLD {
                debug!(
                    "Room {}: {} -> {} ({:.0}%, {})",
                    room.id,
                    room.room_type,
                    result.room_type,
                    result.confidence,
                    result.method.as_str()
                );
                room.room_type = result.room_type;
                room.classification_confidence = Some(result.confidence);
                room.classification_method = Some(result.method);
                room.classification_reasoning = Some(result.reasoning);
                applied += 1;
            }
        }
        applied
    }
}

/// A label matches when one of its words is the room id
fn match_legend_label(room: &Room, legend: &LegendData) -> Option<RoomClassification> {
    let id = room.id.to_string();
    legend
        .labels
        .iter()
        .find(|(label, _)| label.split_whitespace().any(|word| word == id))
        .map(|(label, room_type)| RoomClassification {
            room_type: room_type.clone(),
            confidence: LEGEND_CONFIDENCE,
            reasoning: format!("Matched from legend label: {}", label),
            method: ClassificationMethod::Legend,
        })
}

/// Area buckets in m², refined by compactness, aspect and corner count
pub fn classify_by_shape(area: f64, shape: &ShapeFeatures) -> RoomClassification {
    let mut reasons = Vec::new();

    let mut room_type = if area < 5.0 {
        if shape.compactness > 0.7 {
            reasons.push("small and compact");
            RoomType::Closet
        } else {
            reasons.push("small room");
            RoomType::Bathroom
        }
    } else if area < 10.0 {
        if shape.corners <= 4 {
            reasons.push("small rectangular room");
            RoomType::Bathroom
        } else {
            reasons.push("small irregular room");
            RoomType::Closet
        }
    } else if area < 15.0 {
        if shape.aspect_ratio > 2.0 {
            reasons.push("long narrow space");
            RoomType::Hallway
        } else {
            reasons.push("medium-small room");
            RoomType::Bedroom
        }
    } else if area < 25.0 {
        if shape.aspect_ratio < 1.5 {
            reasons.push("medium-sized square room");
            RoomType::Bedroom
        } else {
            reasons.push("medium rectangular room");
            RoomType::Office
        }
    } else if area < 40.0 {
        reasons.push("large room");
        RoomType::Living
    } else if shape.aspect_ratio > 2.0 {
        reasons.push("very large elongated room");
        RoomType::Dining
    } else {
        reasons.push("very large room");
        RoomType::Living
    };

    let mut confidence = HEURISTIC_BASE;
    if area < 5.0 || area > 40.0 {
        confidence += 10.0;
    }
    if shape.aspect_ratio > 2.5 || shape.aspect_ratio < 1.2 {
        confidence += 5.0;
    }

    if area < 8.0 && shape.compactness > 0.8 {
        room_type = RoomType::Bathroom;
        reasons.push("compact shape");
        confidence += 10.0;
    }

    RoomClassification {
        room_type,
        confidence: confidence.min(HEURISTIC_CAP),
        reasoning: format!(
            "Heuristic classification: {} (area={:.1}m², compactness={:.2}, aspect={:.2}, corners={})",
            reasons.join(", "),
            area,
            shape.compactness,
            shape.aspect_ratio,
            shape.corners
        ),
        method: ClassificationMethod::Heuristic,
    }
}
