// THEORY:
// A quick-look raster of a heatmap run, for eyeballing results without a map viewer.
// Every cell is filled with its normalized value on a colour scale (blue -> yellow -> red
// unless replaced). Region outlines are traced in white and markers are drawn as small
// white squares.
// The image covers the extent of all records with an equirectangular projection.

use geo_heatmap::{Coordinate, HeatmapError, Region, Renderer, ValueRecord};
use image::ImageEncoder;
use std::path::Path;
use tracing::debug;

const CHANNELS: usize = 4;
const BACKGROUND: [u8; 4] = [0, 0, 0, 255];
const NO_VALUE: [u8; 4] = [96, 96, 96, 255];
const OUTLINE: [u8; 4] = [255, 255, 255, 255];
const MARKER_RADIUS: i64 = 2;

/// Maps a value in `[0, 1]` onto the blue -> yellow -> red gradient. Out-of-range values
/// are clamped.
pub fn gradient(value: f64) -> [u8; 4] {
    let score = value.clamp(0.0, 1.0);
    let (r, g, b) = if score <= 0.5 {
        // Blue to Yellow
        let ratio = score / 0.5;
        (255.0 * ratio, 255.0 * ratio, 255.0 * (1.0 - ratio))
    } else {
        // Yellow to Red
        let ratio = (score - 0.5) / 0.5;
        (255.0, 255.0 * (1.0 - ratio), 0.0)
    };
    [r.round() as u8, g.round() as u8, b.round() as u8, 255]
}

pub fn save(
    path: &Path,
    width: u32,
    height: u32,
    buffer: &[u8],
) -> Result<(), image::error::ImageError> {
    let output = std::fs::File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(output);

    encoder.write_image(buffer, width, height, image::ExtendedColorType::Rgba8)?;

    Ok(())
}

/// Extent of the rendered area and the pixel grid it maps onto.
#[derive(Debug, Clone, Copy)]
struct Viewport {
    min: Coordinate,
    max: Coordinate,
    width: u32,
    height: u32,
}

impl Viewport {
    fn fit(records: &[&ValueRecord], width: u32) -> Option<Self> {
        let mut coords = records.iter().flat_map(|r| r.poly.iter().copied());
        let first = coords.next()?;
        let (min, max) = coords.fold((first, first), |(min, max), c| {
            (
                Coordinate::new(min.lat.min(c.lat), min.lon.min(c.lon)),
                Coordinate::new(max.lat.max(c.lat), max.lon.max(c.lon)),
            )
        });
        let lon_span = (max.lon - min.lon).max(f64::EPSILON);
        let lat_span = (max.lat - min.lat).max(f64::EPSILON);
        let height = ((width as f64) * lat_span / lon_span).round().max(1.0) as u32;
        Some(Self {
            min,
            max,
            width: width.max(1),
            height,
        })
    }

    /// Pixel position of `c`; may lie outside the image.
    fn project(&self, c: Coordinate) -> (f64, f64) {
        let lon_span = (self.max.lon - self.min.lon).max(f64::EPSILON);
        let lat_span = (self.max.lat - self.min.lat).max(f64::EPSILON);
        let x = (c.lon - self.min.lon) / lon_span * self.width as f64;
        let y = (self.max.lat - c.lat) / lat_span * self.height as f64;
        (x, y)
    }
}

/// Renders records and region into an RGBA PNG.
pub struct PngRenderer {
    width: u32,
    viewport: Option<Viewport>,
    buffer: Vec<u8>,
    color_scale: Box<dyn Fn(f64) -> [u8; 4]>,
}

impl PngRenderer {
    pub fn new(width: u32) -> Self {
        Self {
            width,
            viewport: None,
            buffer: Vec::new(),
            color_scale: Box::new(gradient),
        }
    }

    pub fn with_color_scale(mut self, scale: impl Fn(f64) -> [u8; 4] + 'static) -> Self {
        self.color_scale = Box::new(scale);
        self
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.viewport.map(|v| (v.width, v.height))
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let viewport = self.viewport?;
        if x >= viewport.width || y >= viewport.height {
            return None;
        }
        let offset = (y as usize * viewport.width as usize + x as usize) * CHANNELS;
        self.buffer.get(offset..offset + CHANNELS)?.try_into().ok()
    }

    /// Draws a marker centered on `at`. Does nothing before `render`.
    pub fn mark(&mut self, at: Coordinate) {
        let Some(viewport) = self.viewport else {
            return;
        };
        let (x, y) = viewport.project(at);
        let (x, y) = (x as i64, y as i64);
        for dy in -MARKER_RADIUS..=MARKER_RADIUS {
            for dx in -MARKER_RADIUS..=MARKER_RADIUS {
                self.put(x + dx, y + dy, OUTLINE);
            }
        }
    }

    fn put(&mut self, x: i64, y: i64, color: [u8; 4]) {
        let Some(viewport) = self.viewport else {
            return;
        };
        if x < 0 || y < 0 || x >= viewport.width as i64 || y >= viewport.height as i64 {
            return;
        }
        let offset = (y as usize * viewport.width as usize + x as usize) * CHANNELS;
        self.buffer[offset..offset + CHANNELS].copy_from_slice(&color);
    }

    fn fill_cell(&mut self, viewport: Viewport, record: &ValueRecord) {
        let color = record.value.map_or(NO_VALUE, |v| (self.color_scale)(v));
        let projected = record.poly.iter().map(|c| viewport.project(*c)).collect::<Vec<_>>();
        let span = |axis: fn(&(f64, f64)) -> f64| {
            projected
                .iter()
                .map(axis)
                .fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)))
        };
        let (x0, x1) = span(|p| p.0);
        let (y0, y1) = span(|p| p.1);
        for y in y0.floor() as i64..y1.ceil() as i64 {
            for x in x0.floor() as i64..x1.ceil() as i64 {
                self.put(x, y, color);
            }
        }
    }

    fn trace(&mut self, viewport: Viewport, ring: &[Coordinate]) {
        for edge in ring.windows(2) {
            let (ax, ay) = viewport.project(edge[0]);
            let (bx, by) = viewport.project(edge[1]);
            let steps = (bx - ax).abs().max((by - ay).abs()).ceil().max(1.0) as i64;
            for step in 0..=steps {
                let t = step as f64 / steps as f64;
                self.put((ax + (bx - ax) * t) as i64, (ay + (by - ay) * t) as i64, OUTLINE);
            }
        }
    }
}

impl Renderer for PngRenderer {
    fn extension(&self) -> &str {
        "png"
    }

    fn render(&mut self, records: &[&ValueRecord], region: &Region) -> geo_heatmap::Result<()> {
        let Some(viewport) = Viewport::fit(records, self.width) else {
            self.viewport = None;
            self.buffer.clear();
            return Ok(());
        };
        self.viewport = Some(viewport);
        self.buffer = BACKGROUND.repeat(viewport.width as usize * viewport.height as usize);

        for record in records {
            self.fill_cell(viewport, record);
        }
        for polygon in region.rings() {
            for ring in &polygon {
                self.trace(viewport, ring);
            }
        }
        debug!(width = viewport.width, height = viewport.height, "rasterized preview");
        Ok(())
    }

    fn save_to_file(&self, path: &Path) -> geo_heatmap::Result<()> {
        let Some(viewport) = self.viewport else {
            return Err(HeatmapError::Io(std::io::Error::other("nothing was rendered")));
        };
        save(path, viewport.width, viewport.height, &self.buffer)
            .map_err(|e| HeatmapError::Io(std::io::Error::other(e)))
    }
}
