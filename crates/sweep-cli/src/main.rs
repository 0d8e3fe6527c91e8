use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sweep",
    version = "0.3.0",
    about = "Resumable fault-injection sweep runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run trials until every grid cell reaches its target.
    Run {
        plan: PathBuf,
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long)]
        target: Option<usize>,
        #[arg(long)]
        max_passes: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show completed and remaining trials per cell.
    Status {
        plan: PathBuf,
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long)]
        target: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Stop the topology and prune its volumes.
    Teardown {
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Download one payload through a running topology.
    Download {
        plan: PathBuf,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(
                    "command_failed",
                    err.to_string(),
                    json!({ "chain": err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>() }),
                ));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            plan,
            ledger,
            target,
            max_passes,
            json,
        } => {
            let overrides = sweep_runner::SweepOverrides {
                ledger,
                target,
                max_passes,
            };
            let result = sweep_runner::run_sweep(&plan, &overrides)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "result": serde_json::to_value(&result)?,
                })));
            }
            println!("family: {}", result.family.as_str());
            println!("ledger: {}", result.ledger.display());
            println!("cells: {}", result.cells);
            println!("target: {}", result.target);
            println!("passes: {}", result.summary.passes);
            println!("attempts: {}", result.summary.attempts);
            println!("recorded: {}", result.summary.recorded);
            println!("discarded: {}", result.summary.discarded);
            println!("outstanding: {}", result.summary.outstanding);
        }
        Commands::Status {
            plan,
            ledger,
            target,
            json,
        } => {
            let overrides = sweep_runner::SweepOverrides {
                ledger,
                target,
                max_passes: None,
            };
            let status = sweep_runner::describe_sweep(&plan, &overrides)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": serde_json::to_value(&status)?,
                })));
            }
            println!("family: {}", status.family.as_str());
            println!("ledger: {}", status.ledger.display());
            println!("target: {}", status.target);
            for cell in &status.cells {
                println!(
                    "{}: completed {}, remaining {}",
                    cell.key, cell.completed, cell.remaining
                );
            }
            println!("outstanding: {}", status.outstanding);
        }
        Commands::Teardown { plan, json } => {
            tracing::info!(plan = %plan.display(), "tearing down topology");
            sweep_runner::teardown_environment(&plan)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "teardown",
                    "plan": plan.display().to_string(),
                })));
            }
            println!("ok");
        }
        Commands::Download {
            plan,
            payload,
            depth,
            address,
            json,
        } => {
            let request = sweep_runner::DownloadRequest {
                payload_size: payload,
                depth,
                address,
            };
            let downloaded = sweep_runner::download_payload(&plan, &request)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "download",
                    "download": downloaded,
                })));
            }
            println!("downloaded: {}", downloaded["file_cid"].as_str().unwrap_or(""));
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Status { json, .. }
        | Commands::Teardown { json, .. }
        | Commands::Download { json, .. } => *json,
    }
}
