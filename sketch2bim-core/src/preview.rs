//! Top-down PNG preview of an IFC model.

use ab_glyph::{FontArc, PxScale};
use anyhow::Result;
use ifc_step::model::IfcClass;
use ifc_step::IfcFile;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut, text_size};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::config::ExportConfig;
use crate::exporter::element_meshes;
use crate::image_ops::save_png_atomic;

pub const TITLE: &str = "IFC Model Preview (Top-Down View)";
pub const NO_GEOMETRY: &str = "IFC Preview (No geometry found)";
pub const EXTRACTION_FAILED: &str = "IFC Preview (Geometry extraction failed)";

const WALL_COLOR: Rgb<u8> = Rgb([100, 100, 200]);
const SLAB_COLOR: Rgb<u8> = Rgb([200, 200, 200]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const MARGIN: f64 = 20.0;

const SYSTEM_FONTS: [&str; 6] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// What the preview ended up showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewKind {
    Rendered { faces: usize },
    NoGeometry,
    ExtractionFailed,
}

/// Configured font first, then a few common system fonts
pub fn load_font(configured: Option<&Path>) -> Option<FontArc> {
    let candidates = configured
        .into_iter()
        .map(Path::to_path_buf)
        .chain(SYSTEM_FONTS.iter().map(|p| Path::new(p).to_path_buf()));
    for path in candidates {
        let Ok(bytes) = fs::read(&path) else { continue };
        match FontArc::try_from_vec(bytes) {
            Ok(font) => {
                debug!("Preview font: {}", path.display());
                return Some(font);
            }
            Err(e) => debug!("Unusable font {}: {}", path.display(), e),
        }
    }
    debug!("No TrueType font found, preview text omitted");
    None
}

/// 2 px line: the segment plus a copy shifted one pixel across it
fn thick_line(img: &mut RgbImage, a: (f32, f32), b: (f32, f32), color: Rgb<u8>) {
    draw_line_segment_mut(img, a, b, color);
    let (ox, oy) = if (b.0 - a.0).abs() >= (b.1 - a.1).abs() { (0.0, 1.0) } else { (1.0, 0.0) };
    draw_line_segment_mut(img, (a.0 + ox, a.1 + oy), (b.0 + ox, b.1 + oy), color);
}

fn placeholder(width: u32, height: u32, caption: &str, font: Option<&FontArc>) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, WHITE);
    if let Some(font) = font {
        let scale = PxScale::from(36.0);
        let (tw, th) = text_size(scale, font, caption);
        let x = (width as i32 - tw as i32) / 2;
        let y = (height as i32 - th as i32) / 2;
        draw_text_mut(&mut img, BLACK, x.max(0), y.max(0), scale, font, caption);
    }
    img
}

/// Render the preview for `ifc_path` into `output_path`
pub fn generate_preview(ifc_path: &Path, output_path: &Path, config: &ExportConfig) -> Result<PreviewKind> {
    let file = IfcFile::open(ifc_path)?;
    let font = load_font(config.preview_font_path.as_deref());
    let (width, height) = (config.preview_width, config.preview_height);

    let drawable = [IfcClass::Wall, IfcClass::Slab, IfcClass::Door, IfcClass::Window]
        .iter()
        .map(|c| file.count(c))
        .sum::<usize>();
    if drawable == 0 {
        let img = placeholder(width, height, NO_GEOMETRY, font.as_ref());
        save_png_atomic(&DynamicImage::ImageRgb8(img), output_path)?;
        info!("Placeholder preview written to {} (no geometry)", output_path.display());
        return Ok(PreviewKind::NoGeometry);
    }

    let elements = element_meshes(&file, &[IfcClass::Wall, IfcClass::Slab]);
    let bounds = elements
        .iter()
        .filter_map(|e| e.mesh.bounds())
        .reduce(|(lo, hi), (l, h)| {
            (
                [lo[0].min(l[0]), lo[1].min(l[1]), lo[2].min(l[2])],
                [hi[0].max(h[0]), hi[1].max(h[1]), hi[2].max(h[2])],
            )
        });
    let Some((lo, hi)) = bounds else {
        let img = placeholder(width, height, EXTRACTION_FAILED, font.as_ref());
        save_png_atomic(&DynamicImage::ImageRgb8(img), output_path)?;
        info!("Placeholder preview written to {} (extraction failed)", output_path.display());
        return Ok(PreviewKind::ExtractionFailed);
    };

    let mut span_x = hi[0] - lo[0];
    let mut span_y = hi[1] - lo[1];
    let padding = span_x.max(span_y) * 0.1;
    span_x += 2.0 * padding;
    span_y += 2.0 * padding;
    let scale_x = if span_x > 0.0 { (width as f64 - 2.0 * MARGIN) / span_x } else { 1.0 };
    let scale_y = if span_y > 0.0 { (height as f64 - 2.0 * MARGIN) / span_y } else { 1.0 };
    let scale = scale_x.min(scale_y);
    let center = ((lo[0] + hi[0]) / 2.0, (lo[1] + hi[1]) / 2.0);
    let offset = (width as f64 / 2.0 - center.0 * scale, height as f64 / 2.0 - center.1 * scale);
    let project = |v: [f64; 3]| ((v[0] * scale + offset.0) as f32, (v[1] * scale + offset.1) as f32);

    let mut img = RgbImage::from_pixel(width, height, WHITE);
    let mut faces = 0;
    // slabs first so walls stay visible on top
    for element in elements.iter().rev() {
        let color = if element.class == IfcClass::Slab { SLAB_COLOR } else { WALL_COLOR };
        for tri in &element.mesh.triangles {
            let pts: Vec<(f32, f32)> = tri.iter().map(|&i| project(element.mesh.vertices[i])).collect();
            for k in 0..pts.len() {
                thick_line(&mut img, pts[k], pts[(k + 1) % pts.len()], color);
            }
            faces += 1;
        }
    }

    if let Some(font) = &font {
        draw_text_mut(&mut img, BLACK, 20, 20, PxScale::from(32.0), font, TITLE);
    }

    save_png_atomic(&DynamicImage::ImageRgb8(img), output_path)?;
    info!("Preview written to {} ({} faces)", output_path.display(), faces);
    Ok(PreviewKind::Rendered { faces })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifc_generator::generate_ifc_detailed;
    use crate::plan::{PlanData, Point, Wall};
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sketch2bim_preview_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_renders_walls() {
        let dir = temp_dir();
        let ifc = dir.join("job.ifc");
        let mut plan = PlanData::empty(0.01);
        plan.walls = vec![
            Wall::new(Point::new(100.0, 100.0), Point::new(900.0, 100.0), 0.01),
            Wall::new(Point::new(900.0, 100.0), Point::new(900.0, 700.0), 0.01),
        ];
        generate_ifc_detailed(&plan, &ifc, None).unwrap();

        let png = dir.join("job_preview.png");
        let kind = generate_preview(&ifc, &png, &ExportConfig::default()).unwrap();
        assert_eq!(kind, PreviewKind::Rendered { faces: 24 });

        let img = image::open(&png).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (1920, 1080));
        assert!(img.pixels().any(|p| *p == WALL_COLOR));
        assert!(!png.with_extension("png.tmp").exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_placeholder_without_geometry() {
        let dir = temp_dir();
        let ifc = dir.join("empty.ifc");
        generate_ifc_detailed(&PlanData::empty(0.01), &ifc, None).unwrap();

        let png = dir.join("empty_preview.png");
        let kind = generate_preview(&ifc, &png, &ExportConfig::default()).unwrap();
        assert_eq!(kind, PreviewKind::NoGeometry);
        let img = image::open(&png).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (1920, 1080));
        assert!(!img.pixels().any(|p| *p == WALL_COLOR));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_placeholder_without_font_is_blank() {
        let blank = placeholder(64, 32, NO_GEOMETRY, None);
        assert!(blank.pixels().all(|p| *p == WHITE));
    }
}
