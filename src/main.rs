//! dicom-loader - fetch DICOM instances and volumes from a DICOMweb server.
//!
//! This binary wires the CLI to a [`LoadCoordinator`] and runs one command.

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dicom_loader::{
    config::{Cli, Command},
    ImagePayload, LoadCoordinator, LoadOptions, LoaderConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match cli.loader_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let loader = match build_loader(config) {
        Some(loader) => loader,
        None => return ExitCode::FAILURE,
    };

    match cli.command {
        Command::Fetch { identifier, output } => {
            run_fetch(&loader, &identifier, output.as_deref()).await
        }
        Command::Volume {
            volume_id,
            identifiers,
        } => run_volume(&loader, &volume_id, identifiers).await,
        Command::Metadata { identifier } => run_metadata(&loader, &identifier).await,
    }
}

fn build_loader(config: LoaderConfig) -> Option<LoadCoordinator> {
    if let Some(ref uri) = config.wado_uri {
        info!("  WADO-URI: {}", uri.base_url);
    }
    if let Some(ref rs) = config.wado_rs {
        info!("  WADO-RS: {}", rs.base_url);
    }

    match LoadCoordinator::new(config) {
        Ok(loader) => Some(loader),
        Err(e) => {
            error!("Failed to create loader: {}", e);
            None
        }
    }
}

// =============================================================================
// Fetch Command
// =============================================================================

async fn run_fetch(loader: &LoadCoordinator, identifier: &str, output: Option<&Path>) -> ExitCode {
    let image = match loader.load_image(identifier, LoadOptions::default()).await {
        Ok(image) => image,
        Err(e) => {
            error!("Failed to load {}: {}", identifier, e);
            return ExitCode::FAILURE;
        }
    };

    print_image(&image);

    if let Some(path) = output {
        if let Err(e) = tokio::fs::write(path, &image.data).await {
            error!("Failed to write {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
        println!("Wrote {} bytes to {}", image.size_bytes(), path.display());
    }

    ExitCode::SUCCESS
}

fn print_image(image: &ImagePayload) {
    println!("Identifier:      {}", image.identifier);
    println!("Content type:    {}", image.content_type);
    println!("Size:            {} bytes", image.size_bytes());
    if let Some(ref syntax) = image.transfer_syntax {
        println!("Transfer syntax: {}", syntax);
    }
    if let Some(ref modality) = image.metadata.modality {
        println!("Modality:        {}", modality);
    }
    if let (Some(rows), Some(columns)) = (image.metadata.rows, image.metadata.columns) {
        println!("Dimensions:      {}x{}", columns, rows);
    }
    if let Some(window) = image.window {
        println!("Window:          W{} / C{}", window.width, window.center);
    }
}

// =============================================================================
// Volume Command
// =============================================================================

async fn run_volume(loader: &LoadCoordinator, volume_id: &str, identifiers: Vec<String>) -> ExitCode {
    let result = match loader
        .load_volume(volume_id, identifiers, LoadOptions::default())
        .await
    {
        Ok(result) => result,
        Err(e) => {
            error!("Failed to load volume {}: {}", volume_id, e);
            return ExitCode::FAILURE;
        }
    };

    let metadata = &result.metadata;
    println!("Volume {}", metadata.volume_id);
    println!("═════════════════════════════════");
    println!(
        "Loaded {}/{} images ({} bytes) in {}ms, ordered by {:?}",
        metadata.loaded, metadata.requested, metadata.total_size_bytes, metadata.elapsed_ms, metadata.ordering
    );
    for (position, image) in result.images.iter().enumerate() {
        println!(
            "  {:>4}  {}  instance={:?}",
            position,
            image.identifier,
            image.metadata.instance_number
        );
    }
    for failure in &result.failures {
        println!("  ✗ {}: {}", failure.identifier, failure.error);
    }

    if result.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// =============================================================================
// Metadata Command
// =============================================================================

async fn run_metadata(loader: &LoadCoordinator, identifier: &str) -> ExitCode {
    let metadata = match loader.load_metadata(identifier).await {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("Failed to load metadata for {}: {}", identifier, e);
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&metadata) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize metadata: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "dicom_loader=debug"
    } else {
        "dicom_loader=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
