//! # inkwell-host
//!
//! Command-line extension host for Inkwell documents.
//!
//! Loads the host configuration, opens a document, installs every
//! extension found in the extensions directory, and runs each registered
//! export hook against the document, writing results into the workspace.
//!
//! ## Running
//!
//! ```bash
//! # Export a document through installed extensions
//! cargo run --bin inkwell-host -- document.json
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin inkwell-host -- document.json
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use inkwell_host::config::Config;
use inkwell_host::document::Document;
use inkwell_host::manager::{ExtensionManager, HOST_API_VERSION};
use quill_runtime::Value;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {e}");
            Config::default()
        }
    };

    let level: Level = config.host.log_level.parse().unwrap_or(Level::INFO);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .init();

    info!(
        "Starting inkwell-host v{} (extension API {})",
        env!("CARGO_PKG_VERSION"),
        HOST_API_VERSION
    );

    let document = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Document::from_file(&path)
            .with_context(|| format!("Failed to load document: {}", path.display()))?,
        None => Document::new("Untitled"),
    };
    info!(
        title = %document.title,
        chapters = document.chapters.len(),
        "loaded document"
    );

    let manager = ExtensionManager::from_config(&config, document)
        .context("Failed to initialize extension manager")?;

    let extensions_dir = config.extensions_dir()?;
    match manager.discover_and_install(&extensions_dir).await {
        Ok(count) => info!(count, dir = %extensions_dir.display(), "installed extensions"),
        Err(e) => warn!(error = %e, "extension discovery failed"),
    }

    for info in manager.list().await {
        info!(
            "Extension: {} v{} ({}) - capabilities: {:?}, exports: {:?}",
            info.id,
            info.version,
            if info.enabled { "enabled" } else { "disabled" },
            info.capabilities,
            info.export_formats
        );
    }

    for format in manager.export_formats().await {
        match manager.run_export(&format, vec![]).await {
            Ok(Value::Str(output)) => {
                let out_path = format!("export.{format}");
                std::fs::write(&out_path, &output)
                    .with_context(|| format!("Failed to write {out_path}"))?;
                info!(format = %format, path = %out_path, bytes = output.len(), "wrote export");
            }
            Ok(other) => {
                warn!(format = %format, result = ?other, "exporter returned a non-string value")
            }
            Err(e) => warn!(format = %format, error = %e, "export failed"),
        }
    }

    info!("Done");
    Ok(())
}
