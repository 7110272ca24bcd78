// Runs one sketch-to-BIM job and prints the result as JSON
//
// Usage: sketch2bim <sketch.png> [output_dir] [job_id]
//
// Configuration comes from SKETCH2BIM_* environment variables, or from a JSON
// file named by SKETCH2BIM_CONFIG. When a checkpoint store is configured,
// checkpoints of an earlier run with the same job id are restored first.

use anyhow::{bail, Context, Result};
use sketch2bim_core::{ModelGenerator, PipelineConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

fn load_config() -> Result<PipelineConfig> {
    match std::env::var("SKETCH2BIM_CONFIG") {
        Ok(path) => {
            let mut config = PipelineConfig::from_json_file(&PathBuf::from(path))?;
            config.apply_env(|key| std::env::var(key).ok());
            Ok(config)
        }
        Err(_) => Ok(PipelineConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(sketch) = args.next().map(PathBuf::from) else {
        bail!("usage: sketch2bim <sketch.png> [output_dir] [job_id]");
    };
    let output_dir = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("output"));
    let job_id = args.next().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let config = load_config()?;
    let timeout = Duration::from_secs(config.limits.job_timeout_secs);
    let generator = ModelGenerator::new(config);

    let checkpoints = if generator.store().is_enabled() {
        let restored = generator
            .store()
            .restore_all(&job_id, &output_dir.join("checkpoints"))
            .await;
        if !restored.is_empty() {
            info!("Resuming job {} from {} checkpoints", job_id, restored.len());
        }
        Some(restored)
    } else {
        None
    };

    info!("Processing {} as job {}", sketch.display(), job_id);
    let run = generator.generate_from_sketch(&sketch, &output_dir, &job_id, checkpoints.as_ref());
    let result = match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => bail!("job {} exceeded {}s", job_id, timeout.as_secs()),
    };

    let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
    println!("{}", json);

    if !result.success {
        warn!("Job {} failed: {}", job_id, result.error.as_deref().unwrap_or("unknown error"));
        std::process::exit(1);
    }
    if result.requires_review {
        warn!("Job {} needs manual review", job_id);
    }
    Ok(())
}
