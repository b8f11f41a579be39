use clap::{Parser, Subcommand};
use serde_json::Value;
use std::error::Error;
use std::path::PathBuf;
use toolmux_core::constants::ENV_PATH;
use toolmux_core::{ServerManager, ToolmuxConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "toolmux",
    version,
    about = "Launch stdio tool servers and route tool calls to them"
)]
struct Cli {
    /// Configuration file (defaults to config/toolmux.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Only log warnings and errors
    #[arg(long, short)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every tool of every ready server
    Tools {
        /// Print the catalog as JSON, schemas included
        #[arg(long)]
        json: bool,
    },
    /// Print the state of each configured server
    Status,
    /// Call a tool by its qualified `server__tool` name
    Call {
        name: String,
        /// Tool arguments as a JSON document
        #[arg(long, default_value = "{}")]
        args: String,
        /// Print only the text content of the result
        #[arg(long)]
        text: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    if let Err(err) = dotenvy::from_filename(ENV_PATH) {
        debug!(path = ENV_PATH, %err, "No environment file loaded");
    }
    debug!(command = ?cli.command, config = ?cli.config, "CLI arguments parsed");

    let config = ToolmuxConfig::load(cli.config.as_deref())?;
    info!(servers = config.servers.len(), "Loaded configuration");

    // reject bad input before any process is spawned
    let arguments = match &cli.command {
        Command::Call { args, .. } => Some(serde_json::from_str::<Value>(args)?),
        _ => None,
    };

    let manager = ServerManager::new(config.client.clone());
    manager.start_all(config.servers).await;

    let outcome = run(&manager, cli.command, arguments).await;

    let report = manager.shutdown().await;
    for err in &report.errors {
        warn!(server = %err.server(), %err, "Tool server did not stop cleanly");
    }
    outcome
}

async fn run(
    manager: &ServerManager,
    command: Command,
    arguments: Option<Value>,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Tools { json } => {
            let tools = manager.aggregated_tools();
            if json {
                println!("{}", serde_json::to_string_pretty(&tools)?);
            } else {
                for tool in &tools {
                    println!("{:<40} {}", tool.qualified_name, tool.descriptor.description);
                }
            }
        }
        Command::Status => {
            let states = manager.status();
            let failures = manager.failures();
            for (server, state) in &states {
                match failures.get(server) {
                    Some(err) => println!("{server:<24} {:<12} {err}", state.as_str()),
                    None => println!("{server:<24} {}", state.as_str()),
                }
            }
            for (server, err) in &failures {
                if !states.contains_key(server) {
                    println!("{server:<24} {:<12} {err}", "rejected");
                }
            }
        }
        Command::Call { name, text, .. } => {
            let response = manager
                .call_tool(&name, arguments.unwrap_or(Value::Null))
                .await?;
            let failed = response.is_error();
            if text {
                println!("{}", response.text());
            } else {
                println!("{}", serde_json::to_string_pretty(&response.into_value())?);
            }
            if failed {
                return Err(format!("tool '{name}' reported an error").into());
            }
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();
}
