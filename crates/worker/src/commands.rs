// Subcommand implementations

use std::time::Duration;

use anyhow::{bail, Context, Result};
use pixelforge_engine::TaskResult;
use pixelforge_worker::handlers::{Filter, ImageJob, ImageRequest, SettingsCommand};
use pixelforge_worker::{Manager, Operation};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::Commands;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run every worker until Ctrl-C, saving stats periodically
pub async fn run(manager: &Manager, stats_interval: u64) -> Result<()> {
    manager.start_all()?;
    info!(data_dir = %manager.config().data_dir.display(), "Workers running, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let stats = manager.get_all_stats();
                for (name, worker) in &stats.workers {
                    info!(
                        worker = %name,
                        state = %worker.state,
                        queue_depth = worker.queue_depth,
                        completed = worker.completed,
                        failed = worker.failed,
                        "Worker stats"
                    );
                }
                if let Err(e) = manager.save_stats(None) {
                    warn!(error = %e, "Failed to save stats");
                }
            }
        }
    }

    let stopped = manager.stop_all(true, SHUTDOWN_TIMEOUT).await;
    manager.save_stats(None)?;
    stopped?;
    info!("Shutdown complete");
    Ok(())
}

/// Submit one operation, wait for its result and print it
pub async fn one_shot(manager: &Manager, command: Commands, json: bool) -> Result<()> {
    manager.start_all()?;

    let (tx, rx) = oneshot::channel::<TaskResult>();
    let reply = move |result: TaskResult| {
        let _ = tx.send(result);
    };

    let submitted = match command {
        Commands::Export {
            destination,
            include_images,
            backup_first: true,
        } => manager.backup_and_export(destination, include_images, reply),
        Commands::Batch {
            prompt,
            n,
            size,
            filters,
        } => manager.process_batch_generation(prompt, n, size, filters, reply),
        command => manager.submit(to_operation(command)?, None, reply),
    };
    if let Err(e) = submitted {
        manager.stop_all(false, SHUTDOWN_TIMEOUT).await?;
        return Err(e.into());
    }

    let result = rx.await.context("worker dropped the task without a result");
    manager.stop_all(true, SHUTDOWN_TIMEOUT).await?;

    match result? {
        Ok(value) => {
            print_value(&value, json);
            Ok(())
        }
        Err(failure) => bail!("{failure}"),
    }
}

/// Print the stats file written by `run`
pub fn show_stats(manager: &Manager, json: bool) -> Result<()> {
    let path = manager.stats_path();
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("no saved stats at {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)?;
    print_value(&value, json);
    Ok(())
}

fn to_operation(command: Commands) -> Result<Operation> {
    let operation = match command {
        Commands::Generate {
            prompt,
            n,
            size,
            save,
        } => {
            let request = ImageRequest::generate(prompt, n, size);
            if save {
                request.saving_to_gallery().into()
            } else {
                request.into()
            }
        }
        Commands::Variation { image, n } => ImageRequest::variation(image, n, "1024x1024").into(),
        Commands::Process {
            input,
            output,
            filters,
            resize,
            exact,
        } => {
            let mut job = ImageJob::new(input, output);
            for filter in filters {
                job = job.with_filter(filter);
            }
            if let Some((width, height)) = resize {
                job = job.with_resize(width, height, exact);
            }
            job.into()
        }
        Commands::Export {
            destination,
            include_images,
            ..
        } => SettingsCommand::Export {
            destination,
            include_images,
        }
        .into(),
        Commands::Import { source } => SettingsCommand::Import { source }.into(),
        Commands::Backup { reason } => SettingsCommand::Backup { reason }.into(),
        Commands::Restore { source } => SettingsCommand::Restore { source }.into(),
        Commands::Validate => SettingsCommand::Validate { data: None }.into(),
        Commands::Run { .. } | Commands::Stats | Commands::Batch { .. } => {
            bail!("not a single worker operation")
        }
    };
    Ok(operation)
}

fn print_value(value: &Value, json: bool) {
    match value {
        Value::Object(fields) if !json => {
            for (label, field) in fields {
                let text = match field {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                println!("{:<18} {}", format!("{label}:"), text);
            }
        }
        other => match serde_json::to_string_pretty(other) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{other}"),
        },
    }
}

/// Parse `name[=value]` into a filter
pub fn parse_filter(s: &str) -> Result<Filter, String> {
    let (name, value) = match s.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.trim())),
        None => (s.trim(), None),
    };

    fn number<T: std::str::FromStr>(name: &str, value: Option<&str>) -> Result<T, String> {
        let value = value.ok_or_else(|| format!("{name} needs a value, e.g. {name}=10"))?;
        value
            .parse()
            .map_err(|_| format!("invalid {name} value: {value}"))
    }

    let filter = match name.to_lowercase().as_str() {
        "brightness" => Filter::Brightness {
            value: number(name, value)?,
        },
        "contrast" => Filter::Contrast {
            value: number(name, value)?,
        },
        "blur" => Filter::Blur {
            sigma: number(name, value)?,
        },
        "sharpen" => Filter::Sharpen {
            sigma: value.map(|_| number(name, value)).transpose()?.unwrap_or(1.0),
            threshold: 0,
        },
        "grayscale" | "greyscale" => Filter::Grayscale,
        "invert" => Filter::Invert,
        "hue_rotate" | "hue" => Filter::HueRotate {
            degrees: number(name, value)?,
        },
        other => return Err(format!("unknown filter: {other}")),
    };
    Ok(filter)
}

/// Parse `WIDTHxHEIGHT`
pub fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("invalid dimension: {v}"))
    };
    Ok((parse(width)?, parse(height)?))
}
