use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use tycho::api::{self, ApiState};
use tycho::config::EngineConfig;
use tycho::Tycho;

#[derive(Parser)]
#[command(name = "tycho")]
#[command(about = "Compile and run declarative container systems on Kubernetes")]
#[command(version = tycho::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Tycho HTTP API
    Serve {
        /// Path to the platform configuration
        #[arg(short, long, default_value = "conf/tycho.yaml")]
        config: PathBuf,
        /// Port to listen on
        #[arg(short, long, default_value_t = 5000)]
        port: u16,
    },
    /// Launch a system from a compose file or a single image
    Up {
        /// A docker-compose (subset) formatted system spec
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// System name; defaults to the file stem
        #[arg(short, long)]
        name: Option<String>,
        /// Container image to run when no file is given
        #[arg(short, long)]
        container: Option<String>,
        /// Port to expose
        #[arg(short, long)]
        port: Option<u16>,
        /// Container entrypoint
        #[arg(long)]
        command: Option<String>,
        /// Username the system runs on behalf of
        #[arg(short, long, default_value = "anonymous")]
        username: String,
        /// Tycho API URL
        #[arg(short, long, default_value = "http://localhost:5000")]
        service: String,
    },
    /// Delete a running system by GUID
    Down {
        /// The GUID of the system to reclaim
        name: String,
        /// Tycho API URL
        #[arg(short, long, default_value = "http://localhost:5000")]
        service: String,
    },
    /// Show running systems
    Status {
        /// Limit to one system GUID
        name: Option<String>,
        /// Tycho API URL
        #[arg(short, long, default_value = "http://localhost:5000")]
        service: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => {
            println!("{}", "🚀 Starting Tycho API...".bold().green());

            let config = EngineConfig::load(&config)?;
            let tycho = Tycho::connect(config).await?;
            api::serve(Arc::new(ApiState { tycho }), port).await?;
        }

        Commands::Up {
            file,
            name,
            container,
            port,
            command,
            username,
            service,
        } => {
            let (name, system) = compose_for(file, name, container, port, command)?;
            println!(
                "{}",
                format!("🚀 Launching {name}...").bold().green()
            );

            let mut body = json!({
                "name": name,
                "principal": { "username": username },
                "system": system,
            });
            if let Some(port) = port {
                let mut services = serde_json::Map::new();
                services.insert(name.clone(), json!({ "port": port }));
                body["services"] = serde_json::Value::Object(services);
            }

            let response = post(&service, "start", &body).await?;
            print_response(&response);
            if let Some(services) = response
                .pointer("/result/services")
                .and_then(|v| v.as_array())
            {
                for entry in services {
                    let ip = entry["ip_address"].as_str().unwrap_or("-");
                    let port = entry["port"].as_i64().unwrap_or_default();
                    println!("  {} http://{ip}:{port}", "•".blue());
                }
            }
        }

        Commands::Down { name, service } => {
            println!("{}", format!("🗑  Deleting {name}...").bold().red());

            let response = post(&service, "delete", &json!({ "name": name })).await?;
            print_response(&response);
        }

        Commands::Status { name, service } => {
            println!("{}", "🔍 Fetching status...".bold().blue());

            let response = post(&service, "status", &json!({ "name": name })).await?;
            if let Some(rows) = response.get("result").and_then(|v| v.as_array()) {
                if rows.is_empty() {
                    println!("{}", "no systems running".yellow());
                }
                for row in rows {
                    println!(
                        "  {} {} {} {}:{}",
                        "•".blue(),
                        row["name"].as_str().unwrap_or("-").bold(),
                        row["sid"].as_str().unwrap_or("-").yellow(),
                        row["ip_address"].as_str().unwrap_or("-").cyan(),
                        row["port"].as_str().unwrap_or("-").cyan(),
                    );
                }
            } else {
                print_response(&response);
            }
        }
    }

    Ok(())
}

/// Resolve the compose document for `up`: read the file when one is given,
/// otherwise synthesize a one-service system around the named image.
fn compose_for(
    file: Option<PathBuf>,
    name: Option<String>,
    container: Option<String>,
    port: Option<u16>,
    command: Option<String>,
) -> Result<(String, serde_json::Value)> {
    if let Some(path) = file {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "system".to_string());
        let name = name.unwrap_or(stem);
        let text = std::fs::read_to_string(&path)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&text)?;
        return Ok((name, serde_json::to_value(doc)?));
    }

    let container =
        container.ok_or_else(|| anyhow::anyhow!("either --file or --container is required"))?;
    let name = name.unwrap_or_else(|| {
        container
            .split([':', '/'])
            .next()
            .unwrap_or("system")
            .to_string()
    });
    let mut spec = json!({ "image": container });
    if let Some(command) = command {
        spec["entrypoint"] = json!(command);
    }
    if let Some(port) = port {
        spec["ports"] = json!([port.to_string()]);
    }
    let mut services = serde_json::Map::new();
    services.insert(name.clone(), spec);
    let system = json!({
        "version": "3",
        "services": services
    });
    Ok((name, system))
}

async fn post(service: &str, operation: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
    let url = format!("{}/system/{}", service.trim_end_matches('/'), operation);
    let response = reqwest::Client::new().post(&url).json(body).send().await?;
    Ok(response.json().await?)
}

fn print_response(response: &serde_json::Value) {
    match response.get("status").and_then(|v| v.as_str()) {
        Some("success") => println!("{}", "✅ success".bold().green()),
        _ => {
            let message = response
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            println!("{}", format!("❌ {message}").bold().red());
        }
    }
}
