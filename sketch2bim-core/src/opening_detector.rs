//! Door and window detection: gaps along detected walls plus small
//! rectangular contours, validated against wall proximity and width ranges.

use geo::{Coord, LineString, MinimumRotatedRect, Polygon as GeoPolygon};
use image::GrayImage;
use imageproc::contours::{find_contours, Contour};
use tracing::debug;

use crate::config::ReaderConfig;
use crate::plan::{Opening, OpeningMethod, OpeningType, Point, Wall};

const GAP_SAMPLES: usize = 20;
const SCAN_HALF_WIDTH: i32 = 10;
const GAP_BACKGROUND_FRACTION: f64 = 0.7;
const MIN_GAP_SIZE_PX: f64 = 10.0;

/// Union of both detection methods, then validated, deduplicated and capped
pub fn detect_openings(linked: &GrayImage, walls: &[Wall], scale_ratio: f64, config: &ReaderConfig) -> Vec<Opening> {
    let mut candidates = detect_gap_openings(linked, walls, scale_ratio);
    let gap_count = candidates.len();
    candidates.extend(detect_contour_openings(linked, scale_ratio));
    debug!(
        "Opening candidates: {} from gaps, {} from contours",
        gap_count,
        candidates.len() - gap_count
    );

    let mut openings = validate_openings(candidates, walls, config);
    openings.truncate(config.max_openings);
    openings
}

/// True when at least 70% of the 21-pixel scan perpendicular to the wall is background
fn is_gap_at(edges: &GrayImage, x: f64, y: f64, perp: (f64, f64)) -> bool {
    let (w, h) = edges.dimensions();
    let total = (2 * SCAN_HALF_WIDTH + 1) as f64;
    let mut background = 0usize;
    for offset in -SCAN_HALF_WIDTH..=SCAN_HALF_WIDTH {
        let cx = (x + offset as f64 * perp.0).round();
        let cy = (y + offset as f64 * perp.1).round();
        if cx >= 0.0 && cy >= 0.0 && (cx as u32) < w && (cy as u32) < h && edges.get_pixel(cx as u32, cy as u32)[0] == 0 {
            background += 1;
        }
    }
    background as f64 >= GAP_BACKGROUND_FRACTION * total
}

/// Openings where a wall line crosses background.
///
/// The wall is sampled at 20 evenly spaced points. At a gap sample the run of
/// gap positions along the wall is measured pixel by pixel; its centre is the
/// opening position and its length the opening width (never below 20 px).
pub fn detect_gap_openings(edges: &GrayImage, walls: &[Wall], scale_ratio: f64) -> Vec<Opening> {
    let mut openings = Vec::new();

    for wall in walls {
        let dx = wall.end.x - wall.start.x;
        let dy = wall.end.y - wall.start.y;
        let length = dx.hypot(dy);
        if length <= 0.0 {
            continue;
        }
        let dir = (dx / length, dy / length);
        let perp = (-dir.1, dir.0);
        let at = |s: f64| (wall.start.x + dir.0 * s, wall.start.y + dir.1 * s);

        // Distance along the wall already covered by a reported run
        let mut covered_until = f64::NEG_INFINITY;

        for i in 0..GAP_SAMPLES {
            let s = length * i as f64 / (GAP_SAMPLES - 1) as f64;
            if s <= covered_until {
                continue;
            }
            let (x, y) = at(s);
            if !is_gap_at(edges, x, y, perp) {
                continue;
            }

            let mut lo = s;
            while lo - 1.0 >= 0.0 {
                let (px, py) = at(lo - 1.0);
                if !is_gap_at(edges, px, py, perp) {
                    break;
                }
                lo -= 1.0;
            }
            let mut hi = s;
            while hi + 1.0 <= length {
                let (px, py) = at(hi + 1.0);
                if !is_gap_at(edges, px, py, perp) {
                    break;
                }
                hi += 1.0;
            }
            covered_until = hi;

            let run = hi - lo + 1.0;
            let gap_size = (run / 2.0).max(MIN_GAP_SIZE_PX);
            let width_meters = 2.0 * gap_size * scale_ratio;
            let Some(opening_type) = OpeningType::from_width(width_meters) else {
                continue;
            };
            let (cx, cy) = at((lo + hi) / 2.0);
            openings.push(Opening {
                opening_type,
                position: Point::new(cx, cy),
                width_meters,
                method: OpeningMethod::Gap,
            });
        }
    }

    openings
}

/// Openings from roughly rectangular borders whose area falls in a
/// scale-adjusted window
pub fn detect_contour_openings(edges: &GrayImage, scale_ratio: f64) -> Vec<Opening> {
    let (min_area, max_area) = if scale_ratio > 0.0 {
        (100.0 / (scale_ratio * scale_ratio), 2000.0 / (scale_ratio * scale_ratio))
    } else {
        (100.0, 2000.0)
    };

    let contours: Vec<Contour<i32>> = find_contours(edges);
    let mut openings = Vec::new();

    for contour in &contours {
        if contour.points.len() < 3 {
            continue;
        }
        let coords: Vec<Coord> = contour
            .points
            .iter()
            .map(|p| Coord { x: p.x as f64, y: p.y as f64 })
            .collect();
        let polygon = GeoPolygon::new(LineString::from(coords), vec![]);
        let area = shoelace(&contour.points);
        if !(area > min_area && area < max_area) {
            continue;
        }

        let Some(rect) = polygon.minimum_rotated_rect() else {
            continue;
        };
        let c: Vec<Coord> = rect.exterior().coords().copied().collect();
        if c.len() < 4 {
            continue;
        }
        let a = (c[1].x - c[0].x).hypot(c[1].y - c[0].y);
        let b = (c[2].x - c[1].x).hypot(c[2].y - c[1].y);
        let (long, short) = (a.max(b), a.min(b));
        let aspect = if short > 0.0 { long / short } else { 1.0 };
        if aspect >= 3.0 {
            continue;
        }

        let width_meters = long * scale_ratio;
        let Some(opening_type) = OpeningType::from_width(width_meters) else {
            continue;
        };
        let center = Point::new((c[0].x + c[2].x) / 2.0, (c[0].y + c[2].y) / 2.0);
        openings.push(Opening {
            opening_type,
            position: center,
            width_meters,
            method: OpeningMethod::Contour,
        });
    }

    openings
}

fn shoelace(points: &[imageproc::point::Point<i32>]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    (twice as f64 / 2.0).abs()
}

/// Keep openings with plausible widths near a wall, then collapse openings
/// closer than the dedupe distance, preferring gap detections
pub fn validate_openings(openings: Vec<Opening>, walls: &[Wall], config: &ReaderConfig) -> Vec<Opening> {
    let valid: Vec<Opening> = openings
        .into_iter()
        .filter(|o| {
            let (min_w, max_w) = o.opening_type.width_range();
            o.width_meters >= min_w && o.width_meters <= max_w
        })
        .filter(|o| {
            walls.is_empty()
                || walls
                    .iter()
                    .any(|w| w.distance_to_point(&o.position) < config.opening_wall_distance_px)
        })
        .collect();

    let mut used = vec![false; valid.len()];
    let mut deduped = Vec::new();
    for i in 0..valid.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut best = i;
        for j in (i + 1)..valid.len() {
            if used[j] {
                continue;
            }
            if valid[i].position.distance_to(&valid[j].position) < config.opening_dedupe_distance_px {
                used[j] = true;
                if valid[best].method != OpeningMethod::Gap && valid[j].method == OpeningMethod::Gap {
                    best = j;
                }
            }
        }
        deduped.push(valid[best].clone());
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn create_wall(x1: f64, y1: f64, x2: f64, y2: f64, scale: f64) -> Wall {
        Wall::new(Point::new(x1, y1), Point::new(x2, y2), scale)
    }

    fn create_opening(x: f64, y: f64, kind: OpeningType, width: f64, method: OpeningMethod) -> Opening {
        Opening {
            opening_type: kind,
            position: Point::new(x, y),
            width_meters: width,
            method,
        }
    }

    /// Room outline as an 8 px edge band with a gap in the bottom wall
    fn room_with_door_gap(gap_from: u32, gap_to: u32) -> GrayImage {
        let mut img = GrayImage::new(500, 400);
        let white = Luma([255u8]);
        draw_filled_rect_mut(&mut img, Rect::at(96, 96).of_size(308, 8), white);
        draw_filled_rect_mut(&mut img, Rect::at(96, 96).of_size(8, 208), white);
        draw_filled_rect_mut(&mut img, Rect::at(396, 96).of_size(8, 208), white);
        draw_filled_rect_mut(&mut img, Rect::at(96, 296).of_size(gap_from - 96, 8), white);
        draw_filled_rect_mut(&mut img, Rect::at(gap_to as i32, 296).of_size(404 - gap_to, 8), white);
        img
    }

    fn room_walls(scale: f64) -> Vec<Wall> {
        vec![
            create_wall(100.0, 100.0, 400.0, 100.0, scale),
            create_wall(400.0, 100.0, 400.0, 300.0, scale),
            create_wall(400.0, 300.0, 100.0, 300.0, scale),
            create_wall(100.0, 300.0, 100.0, 100.0, scale),
        ]
    }

    #[test]
    fn test_single_door_in_gap() {
        let scale = 0.02;
        let img = room_with_door_gap(230, 270);
        let openings = detect_openings(&img, &room_walls(scale), scale, &ReaderConfig::default());

        assert_eq!(openings.len(), 1);
        let door = &openings[0];
        assert_eq!(door.opening_type, OpeningType::Door);
        assert_eq!(door.method, OpeningMethod::Gap);
        assert!(door.position.distance_to(&Point::new(250.0, 300.0)) <= 10.0);
        assert!((door.width_meters - 40.0 * scale).abs() <= 0.1);
    }

    #[test]
    fn test_closed_walls_have_no_gaps() {
        let img = room_with_door_gap(230, 230);
        assert!(detect_gap_openings(&img, &room_walls(0.02), 0.02).is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_widths_and_far_openings() {
        let walls = vec![create_wall(0.0, 0.0, 500.0, 0.0, 0.01)];
        let openings = vec![
            create_opening(100.0, 5.0, OpeningType::Door, 0.9, OpeningMethod::Gap),
            create_opening(200.0, 5.0, OpeningType::Door, 0.3, OpeningMethod::Gap),
            create_opening(300.0, 5.0, OpeningType::Window, 2.5, OpeningMethod::Contour),
            create_opening(400.0, 200.0, OpeningType::Window, 1.5, OpeningMethod::Gap),
        ];
        let valid = validate_openings(openings, &walls, &ReaderConfig::default());
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].position, Point::new(100.0, 5.0));
    }

    #[test]
    fn test_openings_allowed_without_walls() {
        let openings = vec![create_opening(400.0, 200.0, OpeningType::Window, 1.5, OpeningMethod::Contour)];
        assert_eq!(validate_openings(openings, &[], &ReaderConfig::default()).len(), 1);
    }

    #[test]
    fn test_dedupe_prefers_gap_method() {
        let openings = vec![
            create_opening(100.0, 0.0, OpeningType::Door, 0.9, OpeningMethod::Contour),
            create_opening(110.0, 5.0, OpeningType::Door, 0.8, OpeningMethod::Gap),
            create_opening(300.0, 0.0, OpeningType::Door, 0.8, OpeningMethod::Contour),
        ];
        let deduped = validate_openings(openings, &[], &ReaderConfig::default());
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].method, OpeningMethod::Gap);
        assert_eq!(deduped[0].position, Point::new(110.0, 5.0));
    }

    #[test]
    fn test_contour_area_window_scales_with_ratio() {
        let mut img = GrayImage::new(300, 300);
        draw_filled_rect_mut(&mut img, Rect::at(100, 100).of_size(40, 30), Luma([255u8]));
        // ~1100 px² is inside the window at s = 1 but 39 m is too wide to classify
        assert!(detect_contour_openings(&img, 1.0).is_empty());
        // At s = 0.03 the window starts above 111k px²
        assert!(detect_contour_openings(&img, 0.03).is_empty());
    }
}
