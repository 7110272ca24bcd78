use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ReaderConfig;
use crate::hough::Segment;
use crate::plan::{point_segment_distance, Point, Wall};

/// Raw line segment before it becomes a wall
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub start: Point,
    pub end: Point,
}

impl Line {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        self.start.distance_to(&self.end)
    }

    /// Direction in degrees, in [-180, 180]
    pub fn angle(&self) -> f64 {
        (self.end.y - self.start.y).atan2(self.end.x - self.start.x).to_degrees()
    }

    fn midpoint(&self) -> Point {
        Point::new((self.start.x + self.end.x) / 2.0, (self.start.y + self.end.y) / 2.0)
    }
}

impl From<Segment> for Line {
    fn from(s: Segment) -> Self {
        Line::new(
            Point::new(s.x1 as f64, s.y1 as f64),
            Point::new(s.x2 as f64, s.y2 as f64),
        )
    }
}

/// Walls produced from Hough segments, with bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub walls: Vec<Wall>,
    pub metadata: MergeMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub segment_count: usize,
    pub merged_count: usize,
    pub snapped_count: usize,
    pub dropped_short: usize,
    pub capped: bool,
}

const COMMON_ANGLES: [f64; 9] = [0.0, 45.0, 90.0, 135.0, 180.0, -45.0, -90.0, -135.0, -180.0];

/// Merge, snap, and convert Hough segments into walls.
///
/// # Arguments
/// * `segments` - Output of the probabilistic Hough transform
/// * `scale_ratio` - Metres per pixel
/// * `config` - Merge tolerances, snap tolerance, minimum length and cap
pub fn merge_wall_segments(segments: &[Segment], scale_ratio: f64, config: &ReaderConfig) -> MergeResult {
    let lines: Vec<Line> = segments.iter().copied().map(Line::from).collect();

    let merged = merge_parallel_lines(
        &lines,
        config.merge_angle_deg,
        config.merge_distance_px,
        config.merge_max_gap_px,
    );

    let mut metadata = MergeMetadata {
        segment_count: lines.len(),
        merged_count: merged.len(),
        ..Default::default()
    };

    let mut walls = Vec::new();
    for line in &merged {
        let (aligned, snapped) = snap_to_common_angle(line, config.snap_tolerance_deg);
        if snapped {
            metadata.snapped_count += 1;
        }

        let wall = Wall::new(aligned.start, aligned.end, scale_ratio);
        if wall.length_meters < config.min_wall_length_m {
            metadata.dropped_short += 1;
            continue;
        }
        walls.push(wall);
    }

    if walls.len() > config.max_walls {
        walls.truncate(config.max_walls);
        metadata.capped = true;
    }

    info!(
        "Merged {} segments into {} lines ({} snapped, {} too short), {} walls kept",
        metadata.segment_count,
        metadata.merged_count,
        metadata.snapped_count,
        metadata.dropped_short,
        walls.len()
    );

    MergeResult { walls, metadata }
}

/// Greedy grouping of parallel, nearby, overlapping-or-close lines.
///
/// Each unused line seeds a group; later lines join when they are parallel to
/// the seed within `angle_tol`, the seed's midpoint lies within `distance_tol`
/// of their supporting line, and the gap between the two along the seed's
/// direction is at most `max_gap`. The group becomes the farthest-apart pair of
/// its endpoints.
pub fn merge_parallel_lines(lines: &[Line], angle_tol: f64, distance_tol: f64, max_gap: f64) -> Vec<Line> {
    let mut used = vec![false; lines.len()];
    let mut merged = Vec::new();

    for i in 0..lines.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let seed = lines[i];
        let mut current = seed;

        for j in (i + 1)..lines.len() {
            if used[j] {
                continue;
            }
            let other = lines[j];
            if angle_difference_mod_180(seed.angle(), other.angle()) > angle_tol {
                continue;
            }
            if perpendicular_distance(&seed.midpoint(), &other) > distance_tol {
                continue;
            }
            if along_line_gap(&current, &other) > max_gap {
                continue;
            }
            used[j] = true;
            current = extend_line(&current, &other);
        }

        merged.push(current);
    }

    merged
}

/// Snap the direction to the nearest common architectural angle when it is
/// strictly closer than `tolerance_deg`; the start point and length are kept.
pub fn snap_to_common_angle(line: &Line, tolerance_deg: f64) -> (Line, bool) {
    let angle = line.angle();
    let mut best = COMMON_ANGLES[0];
    let mut best_diff = f64::INFINITY;
    for &target in COMMON_ANGLES.iter() {
        let diff = circular_difference(angle, target);
        if diff < best_diff {
            best_diff = diff;
            best = target;
        }
    }

    if best_diff < tolerance_deg {
        let length = line.length();
        let rad = best.to_radians();
        let end = Point::new(line.start.x + length * rad.cos(), line.start.y + length * rad.sin());
        (Line::new(line.start, end), true)
    } else {
        (*line, false)
    }
}

fn circular_difference(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

fn angle_difference_mod_180(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 180.0;
    d.min(180.0 - d)
}

/// Distance from `p` to the infinite line through `line`
fn perpendicular_distance(p: &Point, line: &Line) -> f64 {
    let len = line.length();
    if len < 1e-9 {
        return p.distance_to(&line.start);
    }
    let dx = line.end.x - line.start.x;
    let dy = line.end.y - line.start.y;
    ((p.x - line.start.x) * dy - (p.y - line.start.y) * dx).abs() / len
}

/// Gap between the projections of two lines onto `base`'s direction; 0 when they overlap
fn along_line_gap(base: &Line, other: &Line) -> f64 {
    let len = base.length();
    if len < 1e-9 {
        return point_segment_distance(&base.start, &other.start, &other.end);
    }
    let ux = (base.end.x - base.start.x) / len;
    let uy = (base.end.y - base.start.y) / len;
    let project = |p: &Point| (p.x - base.start.x) * ux + (p.y - base.start.y) * uy;

    let (a0, a1) = (0.0, len);
    let (b0, b1) = {
        let s = project(&other.start);
        let e = project(&other.end);
        (s.min(e), s.max(e))
    };
    (b0 - a1).max(a0 - b1).max(0.0)
}

/// Farthest-apart pair among the four endpoints
fn extend_line(a: &Line, b: &Line) -> Line {
    let points = [a.start, a.end, b.start, b.end];
    let mut best = (points[0], points[1]);
    let mut max_dist = -1.0;
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let d = points[i].distance_to(&points[j]);
            if d > max_dist {
                max_dist = d;
                best = (points[i], points[j]);
            }
        }
    }
    Line::new(best.0, best.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_line(x1: f64, y1: f64, x2: f64, y2: f64) -> Line {
        Line::new(Point::new(x1, y1), Point::new(x2, y2))
    }

    #[test]
    fn test_parallel_close_lines_merge() {
        let lines = vec![
            create_line(0.0, 0.0, 100.0, 0.0),
            create_line(10.0, 4.0, 160.0, 4.0),
        ];
        let merged = merge_parallel_lines(&lines, 5.0, 20.0, 150.0);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].length() - 160.05).abs() < 0.1);
    }

    #[test]
    fn test_reversed_direction_still_parallel() {
        let lines = vec![
            create_line(0.0, 0.0, 100.0, 0.0),
            create_line(100.0, 2.0, 0.0, 2.0),
        ];
        assert_eq!(merge_parallel_lines(&lines, 5.0, 20.0, 150.0).len(), 1);
    }

    #[test]
    fn test_perpendicular_lines_stay_apart() {
        let lines = vec![
            create_line(0.0, 0.0, 100.0, 0.0),
            create_line(0.0, 0.0, 0.0, 100.0),
        ];
        assert_eq!(merge_parallel_lines(&lines, 5.0, 20.0, 150.0).len(), 2);
    }

    #[test]
    fn test_distant_parallel_lines_stay_apart() {
        let lines = vec![
            create_line(0.0, 0.0, 100.0, 0.0),
            create_line(0.0, 50.0, 100.0, 50.0),
        ];
        assert_eq!(merge_parallel_lines(&lines, 5.0, 20.0, 150.0).len(), 2);
    }

    #[test]
    fn test_collinear_lines_far_along_axis_stay_apart() {
        let lines = vec![
            create_line(0.0, 0.0, 100.0, 0.0),
            create_line(400.0, 0.0, 500.0, 0.0),
        ];
        assert_eq!(merge_parallel_lines(&lines, 5.0, 20.0, 150.0).len(), 2);
    }

    #[test]
    fn test_snap_near_horizontal() {
        let line = create_line(0.0, 0.0, 100.0, 5.0);
        let (snapped, changed) = snap_to_common_angle(&line, 10.0);
        assert!(changed);
        assert!(snapped.end.y.abs() < 1e-9);
        assert!((snapped.length() - line.length()).abs() < 1e-9);
    }

    #[test]
    fn test_snap_handles_wraparound() {
        let line = create_line(100.0, 0.0, 0.0, -3.0);
        let (snapped, changed) = snap_to_common_angle(&line, 10.0);
        assert!(changed);
        assert!(snapped.end.y.abs() < 1e-6);
        assert!(snapped.end.x < 1.0);
    }

    #[test]
    fn test_snap_boundary_is_strict() {
        let rad = 10.0f64.to_radians();
        let line = create_line(0.0, 0.0, 100.0 * rad.cos(), 100.0 * rad.sin());
        let (_, changed) = snap_to_common_angle(&line, 10.0 + 1e-9);
        assert!(changed);

        // exactly 10° off horizontal with tolerance 10° stays put
        assert_eq!(line.angle(), 10.0);
        let (same, changed) = snap_to_common_angle(&line, 10.0);
        assert!(!changed);
        assert_eq!(same, line);

        // same edge at a tolerance equal to the measured offset from 45°
        let rad = 55.0f64.to_radians();
        let line = create_line(0.0, 0.0, 100.0 * rad.cos(), 100.0 * rad.sin());
        let (_, changed) = snap_to_common_angle(&line, line.angle() - 45.0);
        assert!(!changed);

        let rad = 22.0f64.to_radians();
        let line = create_line(0.0, 0.0, 100.0 * rad.cos(), 100.0 * rad.sin());
        let (same, changed) = snap_to_common_angle(&line, 10.0);
        assert!(!changed);
        assert_eq!(same, line);
    }

    #[test]
    fn test_short_walls_dropped_and_lengths_scaled() {
        let segments = vec![
            Segment { x1: 0, y1: 0, x2: 300, y2: 0 },
            Segment { x1: 0, y1: 100, x2: 0, y2: 130 },
        ];
        let result = merge_wall_segments(&segments, 0.01, &ReaderConfig::default());
        assert_eq!(result.walls.len(), 1);
        assert_eq!(result.metadata.dropped_short, 1);
        let wall = &result.walls[0];
        assert!((wall.length_meters - 3.0).abs() < 1e-9);
        assert!((wall.length_meters - wall.start.distance_to(&wall.end) * 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_wall_cap() {
        let segments: Vec<Segment> = (0..150)
            .map(|i| Segment { x1: 0, y1: i * 40, x2: 300, y2: i * 40 })
            .collect();
        let config = ReaderConfig::default();
        let result = merge_wall_segments(&segments, 0.01, &config);
        assert_eq!(result.walls.len(), config.max_walls);
        assert!(result.metadata.capped);
    }
}
