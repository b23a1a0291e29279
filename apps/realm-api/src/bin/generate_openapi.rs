//! Writes the realm-api OpenAPI document to `specs/realm-api.json`.

use std::path::Path;

use utoipa::OpenApi;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let doc = realm_api::routes::ApiDoc::openapi().to_pretty_json()?;
    let out = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/realm-api.json");
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&out, doc)?;
    println!("Wrote {}", out.display());
    Ok(())
}
