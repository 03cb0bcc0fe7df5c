// This file is an example of how to use the `geo_heatmap` library.
// The main library entry point is `src/lib.rs`.

use geo_heatmap::{
    CellValue, Coordinate, GeoJsonRenderer, GetterResult, HeatMap, HeatMapConfig, StyleOptions,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn constant(_origin: Option<Coordinate>, _point: Coordinate) -> GetterResult {
    Ok(Some(CellValue::Number(1.0)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Geo Heatmap Engine - Example Runner");

    // --- 1. Boundary: the unit square ---
    let boundary = json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": {},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]]
            }
        }]
    });
    let config = HeatMapConfig {
        square_size: 66_000.0,
        save_intermediate_results: false,
        filename: "example_heatmap".into(),
        ..HeatMapConfig::default()
    };
    let mut heatmap = HeatMap::new(config, &boundary)?;

    // --- 2. Values: a constant getter ---
    heatmap.generate(constant).await?;
    info!(cells = heatmap.cells().len(), "grid filled");

    // --- 3. Normalize and derive the region ---
    heatmap.normalize(None);
    let region = heatmap.generate_polygon(|r| r.original_value == Some(1.0), StyleOptions::new());
    info!(polygons = region.polygons.len(), area = region.area(), "region derived");

    // --- 4. Render ---
    let path = heatmap.render(&mut GeoJsonRenderer::new(), None)?;
    info!(path = %path.display(), "done");
    Ok(())
}
