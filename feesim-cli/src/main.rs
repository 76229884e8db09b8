use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

mod client;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "feesim-cli")]
#[command(about = "Query and control a running feesim-node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC host of the node
    #[arg(long, default_value = "localhost")]
    host: String,

    /// RPC port of the node
    #[arg(long, default_value_t = 8350)]
    port: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// Show application status
    Status,
    /// Required fee rate (BTC/kB) for confirmation in N blocks; all
    /// available N if omitted
    Estimatefee { n: Option<u32> },
    /// Show prediction scores
    Scores,
    /// Show the tx byte rate function, approximated to N points
    Txrate { n: Option<u32> },
    /// Show the capacity byte rate function, approximated to N points
    Caprate { n: Option<u32> },
    /// Show the mempool size function, approximated to N points
    Mempoolsize { n: Option<u32> },
    /// Pause the sim
    Pause,
    /// Resume the sim after pausing
    Unpause,
    /// Turn debug-level logging on or off
    Setdebug { on: bool },
    /// Show the node's config settings
    Config,
    /// Show sim timing metrics
    Metrics,
    /// Stop the node
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.host, cli.port);

    match cli.command {
        Commands::Status => {
            let status = client.call("status", json!([])).await?;
            for key in ["result", "txsource", "blocksource", "mempool", "predict_drops"] {
                if let Some(v) = status.get(key) {
                    let text = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    println!("{key:<13}: {text}");
                }
            }
        }
        Commands::Estimatefee { n } => {
            let params = match n {
                Some(n) => json!([n]),
                None => json!([]),
            };
            print_json(&client.call("estimatefee", params).await?);
        }
        Commands::Scores => {
            let scores = client.call("predictscores", json!([])).await?;
            print_scores(&scores);
        }
        Commands::Txrate { n } => {
            print_json(&client.call("txrate", points_param(n)).await?);
        }
        Commands::Caprate { n } => {
            print_json(&client.call("caprate", points_param(n)).await?);
        }
        Commands::Mempoolsize { n } => {
            print_json(&client.call("mempoolsize", points_param(n)).await?);
        }
        Commands::Pause => {
            client.call("pause", json!([])).await?;
        }
        Commands::Unpause => {
            client.call("unpause", json!([])).await?;
        }
        Commands::Setdebug { on } => {
            client.call("setdebug", json!([on])).await?;
        }
        Commands::Config => {
            print_json(&client.call("config", json!([])).await?);
        }
        Commands::Metrics => {
            print_json(&client.call("metrics", json!([])).await?);
        }
        Commands::Stop => {
            client.call("stop", json!([])).await?;
        }
    }
    Ok(())
}

fn points_param(n: Option<u32>) -> Value {
    match n {
        Some(n) => json!([n]),
        None => json!([]),
    }
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Scores rendered as per-confirm-target attainment ratios.
fn print_scores(scores: &Value) {
    let attained = scores["attained"].as_array().cloned().unwrap_or_default();
    let exceeded = scores["exceeded"].as_array().cloned().unwrap_or_default();
    println!("{:<8}{:>12}{:>12}{:>8}", "blocks", "attained", "exceeded", "ratio");
    for (i, (a, e)) in attained.iter().zip(&exceeded).enumerate() {
        let a = a.as_f64().unwrap_or(0.0);
        let e = e.as_f64().unwrap_or(0.0);
        let ratio = if a + e > 0.0 { a / (a + e) } else { 0.0 };
        println!("{:<8}{a:>12.2}{e:>12.2}{ratio:>8.3}", i + 1);
    }
}
