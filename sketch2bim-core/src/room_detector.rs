use geo::{Area, ConvexHull, Coord, LineString, MinimumRotatedRect, Polygon as GeoPolygon, Simplify};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use tracing::debug;

use crate::config::ReaderConfig;
use crate::plan::{Point, Room, RoomType};

// Longest walk outward through a wall band when looking for its centreline
const MAX_BAND_WALK: i32 = 32;
// How far inside the edge the band search starts
const BAND_SEARCH_BACK: i32 = 4;
const MAX_EDGE_SAMPLES: usize = 64;

/// Detect rooms as the enclosed background regions of a linked edge raster.
///
/// Each hole border is simplified, moved onto the centreline of the edge band
/// around it, and validated for vertex count, area and solidity.
pub fn detect_rooms(linked: &GrayImage, scale_ratio: f64, config: &ReaderConfig) -> Vec<Room> {
    let contours: Vec<Contour<i32>> = find_contours(linked);
    let mut rooms = Vec::new();

    for contour in contours.iter() {
        if contour.border_type != BorderType::Hole || contour.points.len() < 3 {
            continue;
        }

        let raw: Vec<Point> = contour
            .points
            .iter()
            .map(|p| Point::new(p.x as f64, p.y as f64))
            .collect();
        let raw_area = polygon_area(&raw);
        if raw_area < config.min_contour_area_px {
            continue;
        }

        let epsilon = adaptive_epsilon(closed_perimeter(&raw), raw_area);
        let simplified = simplify_polygon(&raw, epsilon);
        if simplified.len() < 4 || is_self_intersecting(&simplified) {
            continue;
        }

        let mut polygon = centreline_polygon(&simplified, linked);
        if is_self_intersecting(&polygon) {
            polygon = simplified;
        }

        let area_pixels = polygon_area(&polygon);
        if area_pixels < config.min_room_area_px {
            continue;
        }
        let solidity = solidity(&polygon);
        if solidity < config.min_solidity {
            debug!("Rejected hole with solidity {:.2}", solidity);
            continue;
        }

        let is_nested = contour
            .parent
            .and_then(|outer| contours.get(outer))
            .map(|outer| outer.parent.is_some())
            .unwrap_or(false);

        rooms.push(Room {
            id: 0,
            aspect_ratio: aspect_ratio(&polygon),
            area_meters: area_pixels * scale_ratio * scale_ratio,
            room_type: provisional_room_type(area_pixels),
            polygon,
            area_pixels,
            is_nested,
            solidity,
            classification_confidence: None,
            classification_method: None,
            classification_reasoning: None,
        });
    }

    rooms.sort_by(|a, b| b.area_pixels.total_cmp(&a.area_pixels));
    rooms.truncate(config.max_rooms);
    for (id, room) in rooms.iter_mut().enumerate() {
        room.id = id;
    }

    debug!("Detected {} rooms from {} contours", rooms.len(), contours.len());
    rooms
}

/// Size-only guess, refined later by the classifier
pub fn provisional_room_type(area_pixels: f64) -> RoomType {
    if area_pixels < 5000.0 {
        RoomType::Bathroom
    } else if area_pixels > 20000.0 {
        RoomType::Living
    } else {
        RoomType::Bedroom
    }
}

/// 2% of the perimeter, loosened for large regions and tightened for small ones
pub fn adaptive_epsilon(perimeter: f64, area: f64) -> f64 {
    let base = 0.02 * perimeter;
    if area > 50_000.0 {
        base * 1.5
    } else if area < 5_000.0 {
        base * 0.5
    } else {
        base
    }
}

fn to_geo(points: &[Point]) -> GeoPolygon<f64> {
    let coords: Vec<Coord> = points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
    GeoPolygon::new(LineString::from(coords), vec![])
}

pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    to_geo(points).unsigned_area()
}

fn closed_perimeter(points: &[Point]) -> f64 {
    let n = points.len();
    (0..n).map(|i| points[i].distance_to(&points[(i + 1) % n])).sum()
}

/// Ramer–Douglas–Peucker on the closed ring; the repeated closing vertex is dropped
pub fn simplify_polygon(points: &[Point], epsilon: f64) -> Vec<Point> {
    let mut coords: Vec<Coord> = points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    let simplified = LineString::from(coords).simplify(&epsilon);
    let mut out: Vec<Point> = simplified.coords().map(|c| Point::new(c.x, c.y)).collect();
    if out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    out
}

/// Polygon area over its convex hull area
pub fn solidity(points: &[Point]) -> f64 {
    let polygon = to_geo(points);
    let hull_area = polygon.convex_hull().unsigned_area();
    if hull_area <= 0.0 {
        return 0.0;
    }
    polygon.unsigned_area() / hull_area
}

/// Long side over short side of the minimum-area bounding rectangle
pub fn aspect_ratio(points: &[Point]) -> f64 {
    let Some(rect) = to_geo(points).minimum_rotated_rect() else {
        return 1.0;
    };
    let c: Vec<Coord> = rect.exterior().coords().copied().collect();
    if c.len() < 3 {
        return 1.0;
    }
    let a = (c[1].x - c[0].x).hypot(c[1].y - c[0].y);
    let b = (c[2].x - c[1].x).hypot(c[2].y - c[1].y);
    let (long, short) = (a.max(b), a.min(b));
    if short <= 0.0 {
        1.0
    } else {
        long / short
    }
}

/// Move every edge outward onto the centreline of the foreground band it
/// borders, then rebuild the vertices as intersections of neighbouring edges.
///
/// The offset of an edge is the median band centre measured along its normal
/// at evenly spaced samples, so stroke thickness and rounded corners from the
/// edge linking do not leak into the result.
fn centreline_polygon(polygon: &[Point], band: &GrayImage) -> Vec<Point> {
    let n = polygon.len();
    let signed = signed_area(polygon);
    if n < 3 || signed.abs() < 1e-9 {
        return polygon.to_vec();
    }
    let orientation = signed.signum();

    // (point on the shifted edge, edge direction)
    let edges: Vec<(Point, (f64, f64))> = (0..n)
        .map(|i| {
            let a = polygon[i];
            let b = polygon[(i + 1) % n];
            let (dx, dy) = (b.x - a.x, b.y - a.y);
            let len = dx.hypot(dy).max(1e-9);
            let normal = (orientation * dy / len, -orientation * dx / len);
            let offset = edge_band_centre(&a, &b, normal, band).unwrap_or(0.0);
            (Point::new(a.x + normal.0 * offset, a.y + normal.1 * offset), (dx, dy))
        })
        .collect();

    (0..n)
        .map(|i| {
            let (p, d) = edges[(i + n - 1) % n];
            let (q, e) = edges[i];
            let cross = d.0 * e.1 - d.1 * e.0;
            if cross.abs() < 1e-6 * d.0.hypot(d.1) * e.0.hypot(e.1) {
                return q;
            }
            let t = ((q.x - p.x) * e.1 - (q.y - p.y) * e.0) / cross;
            let corner = Point::new(p.x + d.0 * t, p.y + d.1 * t);
            // Spikes at very sharp corners keep the shifted vertex instead
            if corner.distance_to(&polygon[i]) > 2.0 * MAX_BAND_WALK as f64 {
                q
            } else {
                corner
            }
        })
        .collect()
}

/// Median distance, along `normal`, from the edge a→b to the middle of the
/// first foreground run. None when no sample crosses a bounded run.
fn edge_band_centre(a: &Point, b: &Point, normal: (f64, f64), band: &GrayImage) -> Option<f64> {
    let (w, h) = band.dimensions();
    let is_band = |x: f64, y: f64| -> bool {
        let (px, py) = (x.round(), y.round());
        px >= 0.0 && py >= 0.0 && (px as u32) < w && (py as u32) < h && band.get_pixel(px as u32, py as u32)[0] > 0
    };

    let length = a.distance_to(b);
    let samples = ((length / 4.0) as usize).clamp(3, MAX_EDGE_SAMPLES);
    let mut centres: Vec<f64> = (0..samples)
        .filter_map(|k| {
            // Stay clear of the corners
            let t = 0.15 + 0.7 * k as f64 / (samples - 1) as f64;
            let (sx, sy) = (a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t);
            let at = |s: i32| is_band(sx + normal.0 * s as f64, sy + normal.1 * s as f64);

            let inner = (-BAND_SEARCH_BACK..=MAX_BAND_WALK).find(|&s| at(s))?;
            let mut outer = inner;
            while outer < MAX_BAND_WALK && at(outer + 1) {
                outer += 1;
            }
            (outer < MAX_BAND_WALK).then(|| (inner + outer) as f64 / 2.0)
        })
        .collect();
    if centres.is_empty() {
        return None;
    }
    centres.sort_by(f64::total_cmp);
    Some(centres[centres.len() / 2])
}

fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
        / 2.0
}

fn is_self_intersecting(points: &[Point]) -> bool {
    let n = points.len();
    if n < 4 {
        return false;
    }
    for i in 0..n {
        let a1 = points[i];
        let a2 = points[(i + 1) % n];
        for j in (i + 1)..n {
            // Adjacent edges share a vertex
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let b1 = points[j];
            let b2 = points[(j + 1) % n];
            if segments_cross(&a1, &a2, &b1, &b2) {
                return true;
            }
        }
    }
    false
}

fn segments_cross(p1: &Point, p2: &Point, p3: &Point, p4: &Point) -> bool {
    let d = |a: &Point, b: &Point, c: &Point| (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    let d1 = d(p3, p4, p1);
    let d2 = d(p3, p4, p2);
    let d3 = d(p1, p2, p3);
    let d4 = d(p1, p2, p4);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0)) && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}
