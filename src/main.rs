//! vtube-bridge - call tool servers through a chosen bridge strategy.
//!
//! Usage:
//!   vtube-bridge servers                        # List registry entries
//!   vtube-bridge tools <server>                 # List a server's tools (JSON)
//!   vtube-bridge call <server> <tool> --args '{"city": "Oslo"}'

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use vtube_bridge::config::BridgeConfig;
use vtube_bridge::logging::{self, LogTarget};
use vtube_bridge::mcp_client::{BridgeStrategy, McpBridge, ServerRegistry};

#[derive(Parser)]
#[command(name = "vtube-bridge")]
#[command(about = "Tool-protocol (MCP) bridge", long_about = None)]
struct Cli {
    /// Config file (default: search upward for vtube-bridge.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bridge strategy: direct, thread_isolated, queued or subprocess
    #[arg(long, global = true)]
    strategy: Option<BridgeStrategy>,

    /// Server registry file (overrides the config's registry_path)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Log to bridge.log in the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers
    Servers,

    /// List the tools a server exposes
    Tools {
        /// Server name from the registry
        server: String,
    },

    /// Call a tool and print the normalized result
    Call {
        /// Server name from the registry
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_tracing(if cli.log_file {
        LogTarget::default_file()
    } else {
        LogTarget::Stderr
    });

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::discover(&std::env::current_dir()?)?,
    };
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }
    if let Some(registry) = cli.registry {
        config.registry_path = registry;
    }

    let registry = ServerRegistry::load(&config.registry_path).with_context(|| {
        format!(
            "cannot load server registry from {}",
            config.registry_path.display()
        )
    })?;

    match cli.command {
        Commands::Servers => {
            print_servers(&registry);
            Ok(())
        }
        command => {
            let bridge =
                McpBridge::start(config.strategy, Arc::new(registry), config.options()).await?;
            let outcome = run(&bridge, command).await;
            bridge.close().await;
            outcome
        }
    }
}

async fn run(bridge: &McpBridge, command: Commands) -> Result<()> {
    match command {
        Commands::Servers => Ok(()),
        Commands::Tools { server } => {
            let tools = bridge.list_tools(&server).await?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
            Ok(())
        }
        Commands::Call { server, tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args is not valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }
            let result = bridge.call_tool(&server, &tool, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn print_servers(registry: &ServerRegistry) {
    if registry.is_empty() {
        println!("No servers configured.");
        return;
    }
    for name in registry.names() {
        if let Some(spec) = registry.get(&name) {
            println!(
                "{name:<20} {} {}  (timeout {}s)",
                spec.command,
                spec.args.join(" "),
                spec.timeout.as_secs_f64()
            );
        }
    }
}
