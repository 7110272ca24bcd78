//! Hough line transforms over binary edge rasters.

use image::GrayImage;

/// Line in normal form `x·cosθ + y·sinθ = rho`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarLine {
    pub rho: f64,
    pub theta: f64,
    pub votes: u32,
}

/// Finite segment in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Segment {
    pub fn length(&self) -> f64 {
        let dx = (self.x2 - self.x1) as f64;
        let dy = (self.y2 - self.y1) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

struct TrigTable {
    cos: Vec<f64>,
    sin: Vec<f64>,
}

impl TrigTable {
    fn new(num_angles: usize, theta_step: f64) -> Self {
        let angles = (0..num_angles).map(|n| n as f64 * theta_step);
        Self {
            cos: angles.clone().map(f64::cos).collect(),
            sin: angles.map(f64::sin).collect(),
        }
    }
}

/// Linear congruential generator with a fixed seed, so the same edge image
/// always yields the same segments
struct Lcg(u64);

impl Lcg {
    fn next_below(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound.max(1)
    }
}

const SEED: u64 = 0x5EED_0F_11AE5;

/// Standard Hough transform with 1 px / 1° resolution.
///
/// Returns local accumulator maxima with at least `threshold` votes, strongest first.
pub fn hough_lines(edges: &GrayImage, threshold: u32) -> Vec<PolarLine> {
    let (w, h) = edges.dimensions();
    let num_angles = 180usize;
    let max_rho = ((w as f64).hypot(h as f64)).ceil() as i64;
    let num_rho = (2 * max_rho + 1) as usize;
    let trig = TrigTable::new(num_angles, std::f64::consts::PI / num_angles as f64);

    let mut acc = vec![0u32; num_angles * num_rho];
    for (x, y, p) in edges.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        for n in 0..num_angles {
            let r = (x as f64 * trig.cos[n] + y as f64 * trig.sin[n]).round() as i64 + max_rho;
            acc[n * num_rho + r as usize] += 1;
        }
    }

    let at = |n: usize, r: usize| acc[n * num_rho + r];
    let mut lines = Vec::new();
    for n in 0..num_angles {
        for r in 0..num_rho {
            let votes = at(n, r);
            if votes < threshold.max(1) {
                continue;
            }
            let left = if r > 0 { at(n, r - 1) } else { 0 };
            let right = if r + 1 < num_rho { at(n, r + 1) } else { 0 };
            let up = if n > 0 { at(n - 1, r) } else { 0 };
            let down = if n + 1 < num_angles { at(n + 1, r) } else { 0 };
            if votes > left && votes >= right && votes > up && votes >= down {
                lines.push(PolarLine {
                    rho: r as f64 - max_rho as f64,
                    theta: n as f64 * std::f64::consts::PI / num_angles as f64,
                    votes,
                });
            }
        }
    }

    lines.sort_by(|a, b| b.votes.cmp(&a.votes));
    lines
}

/// Progressive probabilistic Hough transform (1 px / 1°).
///
/// Edge points are visited in a seeded random order. Each point votes; once an
/// accumulator cell reaches `threshold`, the corridor along that line is walked
/// in both directions tolerating gaps up to `max_gap`. Segments of at least
/// `min_length` are emitted and their pixels withdraw their votes.
pub fn hough_lines_p(edges: &GrayImage, threshold: u32, min_length: u32, max_gap: u32) -> Vec<Segment> {
    const SHIFT: i64 = 16;

    let (w, h) = edges.dimensions();
    let (width, height) = (w as i64, h as i64);
    let num_angles = 180usize;
    let num_rho = (((w + h) * 2 + 1) as usize).max(1);
    let rho_offset = ((num_rho - 1) / 2) as i64;
    let trig = TrigTable::new(num_angles, std::f64::consts::PI / num_angles as f64);
    let threshold = threshold.max(1);

    let mut mask = vec![false; (w * h) as usize];
    let mut points = Vec::new();
    for (x, y, p) in edges.enumerate_pixels() {
        if p[0] > 0 {
            mask[(y * w + x) as usize] = true;
            points.push((x as i64, y as i64));
        }
    }

    let mut acc = vec![0u32; num_angles * num_rho];
    let cell = |n: usize, x: i64, y: i64| -> usize {
        let r = (x as f64 * trig.cos[n] + y as f64 * trig.sin[n]).round() as i64 + rho_offset;
        n * num_rho + r as usize
    };

    let mut rng = Lcg(SEED);
    let mut segments = Vec::new();

    for remaining in (1..=points.len()).rev() {
        let idx = rng.next_below(remaining);
        let (px, py) = points[idx];
        points.swap(idx, remaining - 1);

        if !mask[(py * width + px) as usize] {
            continue;
        }

        let mut max_votes = threshold - 1;
        let mut max_n = 0usize;
        for n in 0..num_angles {
            let c = cell(n, px, py);
            acc[c] += 1;
            if acc[c] > max_votes {
                max_votes = acc[c];
                max_n = n;
            }
        }
        if max_votes < threshold {
            continue;
        }

        // Walk direction along the line; the major axis steps by one pixel,
        // the minor axis in 16.16 fixed point
        let a = -trig.sin[max_n];
        let b = trig.cos[max_n];
        let x_major = a.abs() > b.abs();
        let (x0, y0, dx0, dy0) = if x_major {
            let dx0 = if a > 0.0 { 1 } else { -1 };
            let dy0 = (b * (1i64 << SHIFT) as f64 / a.abs()).round() as i64;
            (px, (py << SHIFT) + (1 << (SHIFT - 1)), dx0, dy0)
        } else {
            let dy0 = if b > 0.0 { 1 } else { -1 };
            let dx0 = (a * (1i64 << SHIFT) as f64 / b.abs()).round() as i64;
            ((px << SHIFT) + (1 << (SHIFT - 1)), py, dx0, dy0)
        };
        let to_pixel = |x: i64, y: i64| -> (i64, i64) {
            if x_major {
                (x, y >> SHIFT)
            } else {
                (x >> SHIFT, y)
            }
        };

        let mut line_end = [(px, py), (px, py)];
        for (k, end) in line_end.iter_mut().enumerate() {
            let (dx, dy) = if k == 0 { (dx0, dy0) } else { (-dx0, -dy0) };
            let (mut x, mut y) = (x0, y0);
            let mut gap = 0u32;
            loop {
                let (j, i) = to_pixel(x, y);
                if j < 0 || j >= width || i < 0 || i >= height {
                    break;
                }
                if mask[(i * width + j) as usize] {
                    gap = 0;
                    *end = (j, i);
                } else {
                    gap += 1;
                    if gap > max_gap {
                        break;
                    }
                }
                x += dx;
                y += dy;
            }
        }

        let good_line = (line_end[1].0 - line_end[0].0).abs() >= min_length as i64
            || (line_end[1].1 - line_end[0].1).abs() >= min_length as i64;

        for (k, end) in line_end.iter().enumerate() {
            let (dx, dy) = if k == 0 { (dx0, dy0) } else { (-dx0, -dy0) };
            let (mut x, mut y) = (x0, y0);
            loop {
                let (j, i) = to_pixel(x, y);
                if j < 0 || j >= width || i < 0 || i >= height {
                    break;
                }
                let m = (i * width + j) as usize;
                if mask[m] {
                    if good_line {
                        for n in 0..num_angles {
                            let c = cell(n, j, i);
                            acc[c] = acc[c].saturating_sub(1);
                        }
                    }
                    mask[m] = false;
                }
                if (j, i) == *end {
                    break;
                }
                x += dx;
                y += dy;
            }
        }

        if good_line {
            segments.push(Segment {
                x1: line_end[0].0 as i32,
                y1: line_end[0].1 as i32,
                x2: line_end[1].0 as i32,
                y2: line_end[1].1 as i32,
            });
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::draw_line_segment_mut;

    fn canvas() -> GrayImage {
        GrayImage::new(200, 200)
    }

    #[test]
    fn test_standard_hough_finds_horizontal_line() {
        let mut img = canvas();
        draw_line_segment_mut(&mut img, (10.0, 50.0), (190.0, 50.0), Luma([255]));
        let lines = hough_lines(&img, 100);
        assert!(!lines.is_empty());
        let best = lines[0];
        assert!((best.theta.to_degrees() - 90.0).abs() < 1.0);
        assert!((best.rho - 50.0).abs() <= 1.0);
    }

    #[test]
    fn test_probabilistic_hough_recovers_segments() {
        let mut img = canvas();
        draw_line_segment_mut(&mut img, (20.0, 30.0), (180.0, 30.0), Luma([255]));
        draw_line_segment_mut(&mut img, (60.0, 20.0), (60.0, 170.0), Luma([255]));

        let segments = hough_lines_p(&img, 50, 50, 10);
        assert!(segments.len() >= 2);
        assert!(segments.iter().any(|s| s.y1 == s.y2 && s.length() > 140.0));
        assert!(segments.iter().any(|s| s.x1 == s.x2 && s.length() > 130.0));
    }

    #[test]
    fn test_probabilistic_hough_is_deterministic() {
        let mut img = canvas();
        draw_line_segment_mut(&mut img, (10.0, 10.0), (190.0, 150.0), Luma([255]));
        draw_line_segment_mut(&mut img, (10.0, 180.0), (190.0, 180.0), Luma([255]));
        assert_eq!(hough_lines_p(&img, 40, 40, 5), hough_lines_p(&img, 40, 40, 5));
    }

    #[test]
    fn test_short_lines_rejected() {
        let mut img = canvas();
        draw_line_segment_mut(&mut img, (10.0, 10.0), (30.0, 10.0), Luma([255]));
        assert!(hough_lines_p(&img, 10, 50, 5).is_empty());
    }

    #[test]
    fn test_blank_image() {
        assert!(hough_lines(&canvas(), 1).is_empty());
        assert!(hough_lines_p(&canvas(), 1, 1, 1).is_empty());
    }
}
