// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;
use zp_datasets::{
    Dataset, DatasetDirectory, DatasetProperties, DatasetsConfig, DestroyMode, PermissionOutcome,
};
use zp_logging::CliLoggingArgs;

#[derive(Parser, Debug)]
#[command(
    name = "zp-datasetctl",
    about = "Manage provisioner datasets on storage hosts"
)]
struct Cli {
    /// TOML configuration file (ZP_* environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print JSON output
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a dataset
    Get {
        #[arg(long)]
        host: String,
        name: String,
    },
    /// Create a filesystem dataset
    Create {
        #[arg(long)]
        host: String,
        /// Creation property as key=value, may be repeated
        #[arg(short = 'o', long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
        name: String,
    },
    /// Destroy a dataset
    Destroy {
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "recursive")]
        mode: String,
        name: String,
    },
    /// Update ownership and mode of a dataset's mountpoint
    Chmod {
        #[arg(long)]
        host: String,
        /// Skip the lookup and use this mountpoint
        #[arg(long)]
        mountpoint: Option<String>,
        name: String,
        uid: String,
        gid: String,
        perm: String,
    },
}

#[derive(Serialize)]
struct PermissionPrint {
    dataset: Dataset,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn main() {
    if let Err(err) = run() {
        let _ = writeln!(io::stderr(), "{:#}", err);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.clone().init("zp-datasetctl")?;

    let config = DatasetsConfig::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(operation = "load_config", config = ?config, "configuration loaded");
    let directory = DatasetDirectory::from_config(&config);

    match cli.command {
        Command::Get { host, name } => {
            let dataset = directory.lookup(&name, &host).await?;
            print_dataset(&dataset, cli.json)
        }
        Command::Create {
            host,
            properties,
            name,
        } => {
            let properties: DatasetProperties = properties.into_iter().collect();
            let dataset = directory.create(&name, &host, &properties).await?;
            print_dataset(&dataset, cli.json)
        }
        Command::Destroy { host, mode, name } => {
            let mode: DestroyMode = mode.parse()?;
            let mut dataset = Dataset::new(name, host);
            directory.destroy(&mut dataset, mode).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&dataset)?);
            } else {
                println!("destroyed {} on {}", dataset.name, dataset.host);
            }
            Ok(())
        }
        Command::Chmod {
            host,
            mountpoint,
            name,
            uid,
            gid,
            perm,
        } => {
            let dataset = match mountpoint {
                Some(mountpoint) => Dataset::new(name, host).with_mountpoint(mountpoint),
                None => directory.lookup(&name, &host).await?,
            };
            if dataset.mountpoint.is_empty() {
                return Err(anyhow!(
                    "dataset {} on {} is not mounted; pass --mountpoint",
                    dataset.name,
                    dataset.host
                ));
            }
            let outcome = directory
                .set_permissions(&dataset, &uid, &gid, &perm)
                .await?;
            let print = match outcome {
                PermissionOutcome::Helper { .. } => PermissionPrint {
                    dataset,
                    method: "helper",
                    mode: None,
                },
                PermissionOutcome::GroupWriteFallback { mode, .. } => PermissionPrint {
                    dataset,
                    method: "group-write-fallback",
                    mode: Some(format!("{:o}", mode)),
                },
            };
            if cli.json {
                println!("{}", serde_json::to_string(&print)?);
            } else {
                match &print.mode {
                    Some(mode) => println!(
                        "{} on {}: helper not installed, mode set to {}",
                        print.dataset.mountpoint, print.dataset.host, mode
                    ),
                    None => println!(
                        "{} on {}: permissions updated",
                        print.dataset.mountpoint, print.dataset.host
                    ),
                }
            }
            Ok(())
        }
    }
}

fn print_dataset(dataset: &Dataset, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(dataset)?);
    } else {
        println!(
            "{}\t{}\t{}",
            dataset.name,
            dataset.host,
            if dataset.mountpoint.is_empty() {
                "-"
            } else {
                &dataset.mountpoint
            }
        );
    }
    Ok(())
}
