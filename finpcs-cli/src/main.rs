use std::env;
use std::fs;

use anyhow::{Context, Result};
use svccli::cli::{self, CliInfo};
use svccli::ModelRegistry;

const EMBEDDED_PCS: &str = include_str!("models/pcs.yaml");
const EMBEDDED_FINSPACE: &str = include_str!("models/finspace.yaml");

const INFO: CliInfo = CliInfo {
    name: "finpcs",
    version: env!("CARGO_PKG_VERSION"),
    env_prefix: "FINPCS",
};

fn main() {
    match real_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn real_main() -> Result<i32> {
    let mut registry = ModelRegistry::new();
    registry.register_embedded("pcs", EMBEDDED_PCS);
    registry.register_embedded("finspace", EMBEDDED_FINSPACE);

    // Extra models must be known before the command tree is built
    let args: Vec<String> = env::args().collect();
    for path in cli::pre_scan_values(&args, "--model-file") {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read model file: {path}"))?;
        registry
            .register_parsed(text)
            .with_context(|| format!("Invalid model file: {path}"))?;
    }
    let models = registry.load_all().context("Service model loading failed")?;

    let (app, index) = cli::build_cli(&models, &INFO);
    let args = cli::normalize_invocation(args, &index);
    let matches = app.clone().get_matches_from(args);

    cli::GlobalOptions::from_matches(&matches)?.init_logging()?;
    tracing::debug!(
        services = models.len(),
        commands = index.len(),
        "command tree built"
    );

    let (stop_handle, stop) = svccli::stop_pair();
    svccli::stop_on_ctrl_c(stop_handle);

    cli::drive_command(app, &index, &matches, &INFO, stop).await
}
