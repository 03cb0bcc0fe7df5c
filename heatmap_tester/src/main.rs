mod image_helper;
mod nearest_point;

use anyhow::Context;
use clap::Parser;
use geo_heatmap::{Coordinate, FetchConfig, GeoJsonRenderer, HeatMap, HeatMapConfig, ValueRecord};
use image_helper::PngRenderer;
use nearest_point::NearestPointGetter;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Heatmap tester - distance to the nearest point of interest over a region
#[derive(Parser, Debug)]
#[command(name = "heatmap_tester", version, about)]
struct Cli {
    /// GeoJSON FeatureCollection of (Multi)Polygons bounding the heatmap
    boundary: PathBuf,

    /// GeoJSON FeatureCollection of Points of interest
    points: PathBuf,

    /// Cell side length in meters
    #[arg(long, env = "HEATMAP_SQUARE_SIZE", default_value_t = 500.0)]
    square_size: f64,

    /// Fetch workers. Defaults to the number of CPUs
    #[arg(long, env = "HEATMAP_THREADS")]
    threads: Option<usize>,

    /// Path stem of the journal and the rendered files
    #[arg(long, env = "HEATMAP_FILENAME", default_value = "intermediate_result")]
    filename: String,

    /// Resume from an existing journal
    #[arg(long)]
    resume: bool,

    /// Keep results in memory only
    #[arg(long)]
    no_save: bool,

    /// Give up on a cell after this many failed passes instead of retrying forever
    #[arg(long, env = "HEATMAP_MAX_PASSES")]
    max_passes: Option<u32>,

    /// Distance in kilometers that defines the highlighted region
    #[arg(long, default_value_t = 1.0)]
    within_km: f64,

    /// Origin passed to the getter, as `lat,lon`
    #[arg(long, value_parser = parse_coordinate)]
    origin: Option<Coordinate>,

    /// Width of the PNG preview in pixels; 0 disables it
    #[arg(long, env = "HEATMAP_PNG_WIDTH", default_value_t = 1024)]
    png_width: u32,
}

/// Runs on a renderer after `render`, before saving.
type Hook<'a, R> = dyn Fn(&mut R, &HeatMap) -> geo_heatmap::Result<()> + 'a;

fn parse_coordinate(s: &str) -> Result<Coordinate, String> {
    let (lat, lon) = s.split_once(',').ok_or("expected `lat,lon`")?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lon = lon.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(Coordinate::new(lat, lon))
}

/// Teal that fades out as the distance grows; near cells are fully opaque.
fn fading_teal(value: f64) -> String {
    let closeness = (1.0 - value.clamp(0.0, 1.0)).powf(1.5);
    let opacity = if closeness > 0.75 { 1.0 } else { closeness / 0.75 };
    format!("hsla(180, 75%, 50%, {opacity:.3})")
}

fn distance_label(record: &ValueRecord) -> Option<String> {
    record.extra_f64("lin_value").map(|km| format!("{km:.2} km"))
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- 1. Argument Parsing & Inputs ---
    let cli = Cli::parse();
    let boundary = read_json(&cli.boundary)?;
    let getter = Arc::new(NearestPointGetter::load(&cli.points)?);

    // --- 2. Heatmap Initialization ---
    let config = HeatMapConfig {
        origin: cli.origin,
        square_size: cli.square_size,
        load_intermediate_results: cli.resume,
        save_intermediate_results: !cli.no_save,
        filename: cli.filename.clone(),
        num_threads: cli.threads.unwrap_or_else(num_cpus::get),
        fetch: FetchConfig {
            max_passes: cli.max_passes,
            ..FetchConfig::default()
        },
        ..HeatMapConfig::default()
    };
    let mut heatmap = HeatMap::new(config, &boundary).context("loading boundary")?;

    // --- 3. Value Extraction ---
    let source = getter.clone();
    heatmap
        .generate(move |origin: Option<Coordinate>, point: Coordinate| source.value(origin, point))
        .await?;

    // --- 4. Normalization & Region ---
    heatmap.normalize(None);
    let style = json!({ "dash_array": [5, 5], "color": "#0ef", "opacity": 0.5, "weight": 2 });
    let Value::Object(style) = style else {
        unreachable!()
    };
    let within_km = cli.within_km;
    let region = heatmap.generate_polygon(
        |r| r.extra_f64("lin_value").is_some_and(|km| km < within_km),
        style,
    );
    info!(polygons = region.polygons.len(), within_km, "region derived");

    // --- 5. Rendering ---
    let geo_json_markers: &Hook<'_, GeoJsonRenderer> = &|renderer, _| {
        for landmark in getter.landmarks() {
            renderer.add_point(landmark.at, landmark.properties.clone());
        }
        Ok(())
    };
    let mut geo_json = GeoJsonRenderer::new()
        .with_color_scale(fading_teal)
        .with_label(distance_label);
    let path = heatmap.render(&mut geo_json, Some(geo_json_markers))?;
    info!(path = %path.display(), "geojson written");

    if cli.png_width > 0 {
        let png_markers: &Hook<'_, PngRenderer> = &|renderer, _| {
            for landmark in getter.landmarks() {
                renderer.mark(landmark.at);
            }
            Ok(())
        };
        let path = heatmap.render(&mut PngRenderer::new(cli.png_width), Some(png_markers))?;
        info!(path = %path.display(), "preview written");
    }

    info!("Processing complete.");
    Ok(())
}
