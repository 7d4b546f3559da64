use anyhow::{bail, Context, Result};
use clap::Parser;
use faceprint_core::Backend;
use tracing_subscriber::EnvFilter;

mod aggregator;
mod config;
mod observer;
mod orchestrator;
mod store;

use config::Config;
use observer::TracingObserver;
use orchestrator::Orchestrator;
use store::Store;

#[derive(Parser)]
#[command(
    name = "faceprint-extract",
    about = "Extract face embeddings from uploaded images and store them per user"
)]
struct Cli {
    /// Only process this user (default: every user with face images)
    user_id: Option<i64>,

    /// Embedding backend: holistic (128-d) or quantized (192-d)
    #[arg(long)]
    backend: Option<Backend>,

    /// Report stored embedding status without extracting anything
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("reading configuration")?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    if cli.check {
        check(&config, cli.user_id)
    } else {
        extract(&config, cli.user_id)
    }
}

fn extract(config: &Config, target: Option<i64>) -> Result<()> {
    if let Some(user_id) = target {
        tracing::info!(user_id, "processing specific user");
    }

    if !config.upload_dir.is_dir() {
        bail!("upload directory not found: {}", config.upload_dir.display());
    }
    tracing::info!(path = %config.upload_dir.display(), "upload directory");

    let mut encoder = faceprint_core::load_encoder(config.backend, &config.model_paths())
        .with_context(|| format!("loading {} encoder", config.backend))?;

    let mut store = Store::connect(&config.database).context("opening database")?;

    let observer = TracingObserver;
    let mut orchestrator = Orchestrator::new(encoder.as_mut(), &config.upload_dir, &observer);
    let stats = orchestrator
        .run(&mut store, target)
        .context("selecting users with face images")?;

    tracing::info!(
        "{}/{} users processed successfully",
        stats.succeeded,
        stats.processed
    );
    Ok(())
}

fn check(config: &Config, target: Option<i64>) -> Result<()> {
    let store = Store::connect(&config.database).context("opening database")?;
    let users = store.candidate_users(target)?;

    if users.is_empty() {
        tracing::warn!(user_id = target, "no users with face images found");
        return Ok(());
    }

    let expected = config.backend.dimension();
    for user in &users {
        let status = store.user_status(user)?;
        if status.dimension_differs(expected) {
            tracing::warn!(
                user_id = user.id,
                stored = status.stored_dimension,
                expected,
                backend = %config.backend,
                "stored embeddings come from a different backend"
            );
        }
        match status.stored_vectors {
            Some(vectors) => tracing::info!(
                user_id = user.id,
                name = %user.name,
                vectors,
                images = status.image_count,
                last_upload = status.last_upload.as_deref(),
                "embeddings stored"
            ),
            None => tracing::warn!(
                user_id = user.id,
                name = %user.name,
                images = status.image_count,
                last_upload = status.last_upload.as_deref(),
                "no embeddings stored; face login will not work"
            ),
        }
    }

    Ok(())
}
