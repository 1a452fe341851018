use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backend_orchestrator::config::loader::{load_config, ConfigError};
use backend_orchestrator::config::OrchestratorConfig;
use backend_orchestrator::observability::logging;
use backend_orchestrator::providers::{ChatMessage, CompletionRequest};
use backend_orchestrator::tool_server::ExecutionOptions;
use backend_orchestrator::{Orchestrator, ToolServerManager};

#[derive(Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Inspect and exercise an orchestrator configuration", long_about = None)]
struct Cli {
    /// Log at debug level instead of warn.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    Validate { config: PathBuf },
    /// Connect to every tool server and list its tools
    Tools { config: PathBuf },
    /// Call one tool with JSON arguments
    Call {
        config: PathBuf,
        server: String,
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,
        /// Override the server timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Send one prompt through the provider pool
    Complete {
        config: PathBuf,
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Tools { config } => {
            let config = load(&config, cli.verbose)?;
            let tools = ToolServerManager::from_config(&config).await;
            for status in tools.get_server_status(None)? {
                println!("{} [{}] {}", status.id, status.transport, status.status);
                for tool in tools.list_tools(Some(&status.id))? {
                    let description = tool.tool.description.as_deref().unwrap_or("");
                    println!("  {:<32} {}", tool.tool.name, description);
                }
            }
            tools.shutdown().await;
            Ok(())
        }
        Commands::Call {
            config,
            server,
            tool,
            args,
            timeout,
        } => {
            let params: serde_json::Value = serde_json::from_str(&args)?;
            let config = load(&config, cli.verbose)?;
            let tools = ToolServerManager::from_config(&config).await;
            let options = ExecutionOptions {
                timeout: timeout.map(Duration::from_secs),
                ..ExecutionOptions::default()
            };
            let outcome = tools.execute_tool(&server, &tool, params, options).await;
            tools.shutdown().await;

            let executed = outcome?;
            println!("{}", serde_json::to_string_pretty(&executed.result)?);
            if executed.result.is_error {
                return Err(format!("tool '{tool}' reported an error").into());
            }
            Ok(())
        }
        Commands::Complete {
            config,
            prompt,
            system,
            stream,
        } => {
            let config = load(&config, cli.verbose)?;
            let orchestrator = Orchestrator::from_config(&config)?;

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let request = CompletionRequest::new(messages);

            if stream {
                let mut chunks = orchestrator.stream_complete(request).await?;
                let mut stdout = std::io::stdout();
                while let Some(chunk) = chunks.next().await {
                    write!(stdout, "{}", chunk?.delta)?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
            } else {
                let response = orchestrator.complete(request).await?;
                println!("{}", response.content);
                if let Some(usage) = response.usage {
                    eprintln!(
                        "[{} / {}] {} prompt + {} completion tokens",
                        response.provider_id, response.model, usage.prompt_tokens, usage.completion_tokens
                    );
                }
            }
            orchestrator.shutdown();
            Ok(())
        }
    }
}

fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match load_config(path) {
        Ok(config) => {
            println!(
                "{}: ok ({} providers, {} tool servers, strategy {:?})",
                path.display(),
                config.providers.len(),
                config.tool_servers.len(),
                config.strategy
            );
            Ok(())
        }
        Err(ConfigError::Validation(errors)) => {
            eprintln!("{}: {} problem(s)", path.display(), errors.len());
            for error in &errors {
                eprintln!("  {error}");
            }
            Err("configuration is invalid".into())
        }
        Err(e) => Err(e.into()),
    }
}

fn load(path: &Path, verbose: bool) -> Result<OrchestratorConfig, ConfigError> {
    let config = load_config(path)?;
    let mut observability = config.observability.clone();
    observability.log_level = if verbose { "debug" } else { "warn" }.to_string();
    logging::init_tracing(&observability);
    Ok(config)
}
