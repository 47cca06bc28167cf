use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;

use pkgimage::config::{Cli, Command, Settings};
use pkgimage::image::ManifestFormat;
use pkgimage::{constants::LATEST_TAG, logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json)?;

    match cli.command {
        Command::Serve(args) => server::start_server(&cli.settings, &args).await,
        Command::Inspect { reference, docker } => inspect(&cli.settings, &reference, docker).await,
    }
}

/// Build `image[:tag]` once and print its manifest to stdout.
async fn inspect(settings: &Settings, reference: &str, docker: bool) -> Result<()> {
    let (image, tag) = reference.split_once(':').unwrap_or((reference, LATEST_TAG));
    let coordinator = settings.coordinator()?;
    let built = coordinator
        .resolve(image, tag)
        .await
        .with_context(|| format!("Failed to build {}:{}", image, tag))?;

    let format = if docker {
        ManifestFormat::Docker
    } else {
        ManifestFormat::Oci
    };
    let descriptor = built
        .manifest(format)
        .context("Build produced no manifest in the requested format")?;
    let manifest = coordinator.store().get(&descriptor.digest)?;
    let pretty: serde_json::Value = serde_json::from_slice(&manifest.bytes)?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string_pretty(&pretty)?)?;
    eprintln!("{} {}:{} {}", descriptor.media_type, image, tag, descriptor.digest);
    Ok(())
}
