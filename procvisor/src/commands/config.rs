use crate::cli::ConfigArgs;
use anyhow::Context;
use procvisor_core::{Config, ConfigLoader};
use std::path::Path;

pub async fn execute(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load(args.config.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// An explicit file wins over discovery.
pub async fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let loader = ConfigLoader::new();
    match path {
        Some(path) => loader
            .load_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => loader.load().await.context("Failed to load configuration"),
    }
}
