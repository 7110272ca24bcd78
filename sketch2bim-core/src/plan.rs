//! Plan data model shared by every stage.
//!
//! Pixel coordinates use the image convention (x right, y down). Metric
//! values are derived from `scale_ratio` (metres per pixel).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default metres-per-pixel when no legend scale is known
pub const DEFAULT_SCALE_RATIO: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl From<[f64; 2]> for Point {
    fn from(p: [f64; 2]) -> Self {
        Point { x: p[0], y: p[1] }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Common bounding-box view over plan entities: [min_x, min_y, max_x, max_y]
pub trait Bounded {
    fn bbox(&self) -> [f64; 4];

    fn bbox_center(&self) -> Point {
        let b = self.bbox();
        Point::new((b[0] + b[2]) / 2.0, (b[1] + b[3]) / 2.0)
    }
}

pub(crate) fn points_bbox(points: &[Point]) -> [f64; 4] {
    let mut min_x = f64::INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;

    for point in points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }

    [min_x, min_y, max_x, max_y]
}

/// Distance from `p` to the segment `a`–`b`
pub fn point_segment_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len_sq = dx * dx + dy * dy;
    if len_sq < 1e-12 {
        return p.distance_to(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance_to(&Point::new(a.x + t * dx, a.y + t * dy))
}

/// Straight wall centre line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wall {
    pub start: Point,
    pub end: Point,
    pub length_pixels: f64,
    pub length_meters: f64,
    /// Direction of start→end in degrees, in [-180, 180]
    pub angle_deg: f64,
}

impl Wall {
    pub fn new(start: Point, end: Point, scale_ratio: f64) -> Self {
        let length_pixels = start.distance_to(&end);
        Self {
            start,
            end,
            length_pixels,
            length_meters: length_pixels * scale_ratio,
            angle_deg: (end.y - start.y).atan2(end.x - start.x).to_degrees(),
        }
    }

    pub fn midpoint(&self) -> Point {
        Point::new((self.start.x + self.end.x) / 2.0, (self.start.y + self.end.y) / 2.0)
    }

    pub fn distance_to_point(&self, p: &Point) -> f64 {
        point_segment_distance(p, &self.start, &self.end)
    }

    /// Distance from `p` to whichever endpoint is closer
    pub fn nearest_endpoint_distance(&self, p: &Point) -> f64 {
        p.distance_to(&self.start).min(p.distance_to(&self.end))
    }
}

impl Bounded for Wall {
    fn bbox(&self) -> [f64; 4] {
        points_bbox(&[self.start, self.end])
    }
}

/// Closed room vocabulary, with an escape hatch for labels outside it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RoomType {
    Bedroom,
    Bathroom,
    Kitchen,
    Living,
    Dining,
    Office,
    Closet,
    Hallway,
    Garage,
    Utility,
    Laundry,
    Pantry,
    Entry,
    Stair,
    Study,
    Custom(String),
}

impl RoomType {
    pub fn as_str(&self) -> &str {
        match self {
            RoomType::Bedroom => "bedroom",
            RoomType::Bathroom => "bathroom",
            RoomType::Kitchen => "kitchen",
            RoomType::Living => "living",
            RoomType::Dining => "dining",
            RoomType::Office => "office",
            RoomType::Closet => "closet",
            RoomType::Hallway => "hallway",
            RoomType::Garage => "garage",
            RoomType::Utility => "utility",
            RoomType::Laundry => "laundry",
            RoomType::Pantry => "pantry",
            RoomType::Entry => "entry",
            RoomType::Stair => "stair",
            RoomType::Study => "study",
            RoomType::Custom(name) => name,
        }
    }

    /// Map a legend keyword (or a canonical name) onto the vocabulary
    pub fn from_keyword(keyword: &str) -> Option<RoomType> {
        let room_type = match keyword.trim().to_ascii_lowercase().as_str() {
            "bedroom" => RoomType::Bedroom,
            "bath" | "bathroom" => RoomType::Bathroom,
            "kitchen" => RoomType::Kitchen,
            "living" => RoomType::Living,
            "dining" => RoomType::Dining,
            "office" => RoomType::Office,
            "study" => RoomType::Study,
            "closet" => RoomType::Closet,
            "pantry" => RoomType::Pantry,
            "laundry" => RoomType::Laundry,
            "garage" => RoomType::Garage,
            "hall" | "hallway" => RoomType::Hallway,
            "entry" | "foyer" => RoomType::Entry,
            "stair" | "staircase" => RoomType::Stair,
            "utility" => RoomType::Utility,
            _ => return None,
        };
        Some(room_type)
    }
}

impl From<String> for RoomType {
    fn from(s: String) -> Self {
        RoomType::from_keyword(&s).unwrap_or(RoomType::Custom(s))
    }
}

impl From<RoomType> for String {
    fn from(t: RoomType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a room's type was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMethod {
    Legend,
    Ml,
    Heuristic,
    Fallback,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &str {
        match self {
            ClassificationMethod::Legend => "legend",
            ClassificationMethod::Ml => "ml",
            ClassificationMethod::Heuristic => "heuristic",
            ClassificationMethod::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: usize,
    pub polygon: Vec<Point>,
    pub area_pixels: f64,
    pub area_meters: f64,
    pub room_type: RoomType,
    pub is_nested: bool,
    pub aspect_ratio: f64,
    pub solidity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_method: Option<ClassificationMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_reasoning: Option<String>,
}

impl Room {
    /// Area-weighted polygon centroid; falls back to the vertex mean for degenerate polygons
    pub fn centroid(&self) -> Point {
        polygon_centroid(&self.polygon)
    }

    pub fn perimeter(&self) -> f64 {
        let n = self.polygon.len();
        (0..n)
            .map(|i| self.polygon[i].distance_to(&self.polygon[(i + 1) % n]))
            .sum()
    }

    /// Even-odd point-in-polygon test
    pub fn contains(&self, p: &Point) -> bool {
        let n = self.polygon.len();
        let mut inside = false;
        let mut j = n.wrapping_sub(1);
        for i in 0..n {
            let a = self.polygon[i];
            let b = self.polygon[j];
            if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Smallest distance from `p` to the polygon boundary
    pub fn boundary_distance(&self, p: &Point) -> f64 {
        let n = self.polygon.len();
        (0..n)
            .map(|i| point_segment_distance(p, &self.polygon[i], &self.polygon[(i + 1) % n]))
            .fold(f64::INFINITY, f64::min)
    }
}

impl Bounded for Room {
    fn bbox(&self) -> [f64; 4] {
        points_bbox(&self.polygon)
    }
}

pub fn polygon_centroid(polygon: &[Point]) -> Point {
    let n = polygon.len();
    if n == 0 {
        return Point::new(0.0, 0.0);
    }

    let mut area2 = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];
        let cross = a.x * b.y - b.x * a.y;
        area2 += cross;
        cx += (a.x + b.x) * cross;
        cy += (a.y + b.y) * cross;
    }

    if area2.abs() < 1e-9 {
        let sx: f64 = polygon.iter().map(|p| p.x).sum();
        let sy: f64 = polygon.iter().map(|p| p.y).sum();
        return Point::new(sx / n as f64, sy / n as f64);
    }
    Point::new(cx / (3.0 * area2), cy / (3.0 * area2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpeningType {
    Door,
    Window,
}

impl OpeningType {
    pub fn as_str(&self) -> &str {
        match self {
            OpeningType::Door => "door",
            OpeningType::Window => "window",
        }
    }

    /// Width classification: doors below 1.2 m, windows below 2.0 m
    pub fn from_width(width_meters: f64) -> Option<OpeningType> {
        if width_meters < 1.2 {
            Some(OpeningType::Door)
        } else if width_meters < 2.0 {
            Some(OpeningType::Window)
        } else {
            None
        }
    }

    /// Accepted width range in metres
    pub fn width_range(&self) -> (f64, f64) {
        match self {
            OpeningType::Door => (0.6, 1.2),
            OpeningType::Window => (0.8, 2.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpeningMethod {
    Gap,
    Contour,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opening {
    #[serde(rename = "type")]
    pub opening_type: OpeningType,
    pub position: Point,
    pub width_meters: f64,
    pub method: OpeningMethod,
}

impl Bounded for Opening {
    fn bbox(&self) -> [f64; 4] {
        [self.position.x, self.position.y, self.position.x, self.position.y]
    }
}

/// Symbol grouping used to pick an IFC class
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SymbolCategory {
    ArchitecturalCore,
    InteriorFurniture,
    MepSystems,
    Structural,
    Annotations,
    Custom(String),
}

impl SymbolCategory {
    pub fn as_str(&self) -> &str {
        match self {
            SymbolCategory::ArchitecturalCore => "architectural_core",
            SymbolCategory::InteriorFurniture => "interior_furniture",
            SymbolCategory::MepSystems => "mep_systems",
            SymbolCategory::Structural => "structural",
            SymbolCategory::Annotations => "annotations",
            SymbolCategory::Custom(name) => name,
        }
    }
}

impl From<String> for SymbolCategory {
    fn from(s: String) -> Self {
        match s.as_str() {
            "architectural_core" => SymbolCategory::ArchitecturalCore,
            "interior_furniture" => SymbolCategory::InteriorFurniture,
            "mep_systems" => SymbolCategory::MepSystems,
            "structural" => SymbolCategory::Structural,
            "annotations" => SymbolCategory::Annotations,
            _ => SymbolCategory::Custom(s),
        }
    }
}

impl From<SymbolCategory> for String {
    fn from(c: SymbolCategory) -> Self {
        c.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    /// [x1, y1, x2, y2] in pixels
    pub bbox: [f64; 4],
    pub label: String,
    pub display_name: String,
    pub category: SymbolCategory,
    pub confidence: f64,
    pub area_pixels: f64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifc_type: Option<String>,
}

impl Bounded for Symbol {
    fn bbox(&self) -> [f64; 4] {
        self.bbox
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_ms: Option<u64>,
}

/// Sketch reader output and the only input to IFC generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanData {
    pub rooms: Vec<Room>,
    pub walls: Vec<Wall>,
    pub openings: Vec<Opening>,
    pub symbols: Vec<Symbol>,
    /// 0–100
    pub confidence: f64,
    pub scale_ratio: f64,
    pub symbol_metadata: SymbolMetadata,
}

impl PlanData {
    pub fn empty(scale_ratio: f64) -> Self {
        Self {
            rooms: Vec::new(),
            walls: Vec::new(),
            openings: Vec::new(),
            symbols: Vec::new(),
            confidence: 0.0,
            scale_ratio,
            symbol_metadata: SymbolMetadata::default(),
        }
    }

    /// Recompute every metric field for a new scale
    pub fn rescale(&mut self, scale_ratio: f64) {
        self.scale_ratio = scale_ratio;
        for wall in &mut self.walls {
            wall.length_meters = wall.length_pixels * scale_ratio;
        }
        for room in &mut self.rooms {
            room.area_meters = room.area_pixels * scale_ratio * scale_ratio;
        }
    }
}

/// Legend parse result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegendData {
    /// Metres per pixel
    pub scale_ratio: f64,
    pub scale_text: Option<String>,
    /// Detected label text → room type
    pub labels: BTreeMap<String, RoomType>,
    /// 0–1
    pub confidence: f64,
    /// Symbol name → element kind
    #[serde(default)]
    pub symbols: BTreeMap<String, String>,
    /// Line style → meaning
    #[serde(default)]
    pub line_types: BTreeMap<String, String>,
    /// Selected legend region [x, y, width, height]
    #[serde(default)]
    pub region: Option<[u32; 4]>,
    #[serde(default)]
    pub raw_text: String,
}

impl Default for LegendData {
    fn default() -> Self {
        Self {
            scale_ratio: DEFAULT_SCALE_RATIO,
            scale_text: None,
            labels: BTreeMap::new(),
            confidence: 0.0,
            symbols: BTreeMap::new(),
            line_types: BTreeMap::new(),
            region: None,
            raw_text: String::new(),
        }
    }
}

impl LegendData {
    pub fn has_scale(&self) -> bool {
        self.scale_text.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_room(points: &[(f64, f64)]) -> Room {
        Room {
            id: 0,
            polygon: points.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            area_pixels: 0.0,
            area_meters: 0.0,
            room_type: RoomType::Bedroom,
            is_nested: false,
            aspect_ratio: 1.0,
            solidity: 1.0,
            classification_confidence: None,
            classification_method: None,
            classification_reasoning: None,
        }
    }

    #[test]
    fn test_wall_derived_fields() {
        let wall = Wall::new(Point::new(0.0, 0.0), Point::new(0.0, 100.0), 0.01);
        assert_eq!(wall.length_pixels, 100.0);
        assert!((wall.length_meters - 1.0).abs() < 1e-12);
        assert!((wall.angle_deg - 90.0).abs() < 1e-12);

        let reversed = Wall::new(Point::new(100.0, 0.0), Point::new(0.0, 0.0), 0.01);
        assert!((reversed.angle_deg.abs() - 180.0).abs() < 1e-12);
    }

    #[test]
    fn test_point_serialises_as_pair() {
        let json = serde_json::to_string(&Point::new(1.5, 2.0)).unwrap();
        assert_eq!(json, "[1.5,2.0]");
        let back: Point = serde_json::from_str("[3.0,4.0]").unwrap();
        assert_eq!(back, Point::new(3.0, 4.0));
    }

    #[test]
    fn test_room_type_keywords() {
        assert_eq!(RoomType::from_keyword("Bath"), Some(RoomType::Bathroom));
        assert_eq!(RoomType::from_keyword("foyer"), Some(RoomType::Entry));
        assert_eq!(RoomType::from_keyword("staircase"), Some(RoomType::Stair));
        assert_eq!(RoomType::from_keyword("ballroom"), None);

        let custom: RoomType = "ballroom".to_string().into();
        assert_eq!(custom, RoomType::Custom("ballroom".into()));
        assert_eq!(serde_json::to_string(&RoomType::Living).unwrap(), "\"living\"");
    }

    #[test]
    fn test_opening_width_classes() {
        assert_eq!(OpeningType::from_width(0.9), Some(OpeningType::Door));
        assert_eq!(OpeningType::from_width(1.2), Some(OpeningType::Window));
        assert_eq!(OpeningType::from_width(2.0), None);
        let json = serde_json::to_value(Opening {
            opening_type: OpeningType::Door,
            position: Point::new(1.0, 2.0),
            width_meters: 0.9,
            method: OpeningMethod::Gap,
        })
        .unwrap();
        assert_eq!(json["type"], "door");
        assert_eq!(json["method"], "gap");
    }

    #[test]
    fn test_room_geometry() {
        let room = create_room(&[(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)]);
        let c = room.centroid();
        assert!((c.x - 50.0).abs() < 1e-9 && (c.y - 25.0).abs() < 1e-9);
        assert_eq!(room.perimeter(), 300.0);
        assert!(room.contains(&Point::new(10.0, 10.0)));
        assert!(!room.contains(&Point::new(150.0, 10.0)));
        assert!((room.boundary_distance(&Point::new(50.0, 60.0)) - 10.0).abs() < 1e-9);
        assert_eq!(room.bbox(), [0.0, 0.0, 100.0, 50.0]);
    }

    #[test]
    fn test_rescale_is_monotonic() {
        let mut plan = PlanData::empty(0.01);
        plan.walls.push(Wall::new(Point::new(0.0, 0.0), Point::new(300.0, 0.0), 0.01));
        let mut room = create_room(&[(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)]);
        room.area_pixels = 10_000.0;
        room.area_meters = 1.0;
        plan.rooms.push(room);

        plan.rescale(0.02);
        assert!((plan.walls[0].length_meters - 6.0).abs() < 1e-9);
        assert!((plan.rooms[0].area_meters - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_symbol_category_strings() {
        let cat: SymbolCategory = "mep_systems".to_string().into();
        assert_eq!(cat, SymbolCategory::MepSystems);
        let custom: SymbolCategory = "landscape".to_string().into();
        assert_eq!(custom.as_str(), "landscape");
    }
}
