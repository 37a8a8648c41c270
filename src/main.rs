//! Redfire FXS main application

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::runtime::Handle;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use redfire_fxs::{
    config::FxsConfig,
    core::{LineRegistry, Monitor},
    interfaces::SystemDevices,
    services::{run_echo, Console, Dialplan, ChannelHost, Reply},
    utils::setup_logging,
};

#[derive(Parser)]
#[command(name = "redfire-fxs")]
#[command(about = "Analog telephone line controller")]
#[command(version = redfire_fxs::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "REDFIRE_FXS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the line controller
    Run {
        /// Do not read console commands from the terminal
        #[arg(long)]
        no_console: bool,
    },
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        return generate_default_config(output.clone());
    }

    let mut config = load_configuration(&cli)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    let _log_guard = setup_logging(&config.logging)?;

    info!("Starting {} v{}", redfire_fxs::NAME, redfire_fxs::VERSION);
    info!("Description: {}", redfire_fxs::DESCRIPTION);

    match cli.command {
        Some(Commands::Run { no_console }) => run_lines(config, !no_console).await,
        None => run_lines(config, true).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { .. }) => Ok(()),
    }
}

fn load_configuration(cli: &Cli) -> anyhow::Result<FxsConfig> {
    let config = if let Some(config_path) = &cli.config {
        FxsConfig::load_from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        match FxsConfig::load_from_env() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("No usable environment configuration ({}), using defaults", e);
                FxsConfig::default_config()
            }
        }
    };

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run_lines(config: FxsConfig, interactive: bool) -> anyhow::Result<()> {
    info!("Initializing {} line(s)", config.lines.len());

    let dialplan = Dialplan::from_config(&config.dialplan)?;
    let mut host = ChannelHost::new(dialplan);
    let events = host
        .take_event_receiver()
        .ok_or_else(|| redfire_fxs::Error::internal("Failed to get event receiver"))?;
    let host = Arc::new(host);

    let registry = Arc::new(LineRegistry::new(&config, &SystemDevices, host.clone())?);
    info!("✓ {} line(s) ready", registry.line_count());

    let cancel = CancellationToken::new();
    let readers = registry.spawn_event_readers(&cancel);
    let monitor = Monitor::new(Arc::clone(&registry), &config.general).spawn(cancel.clone());
    let echo = tokio::spawn(run_echo(Arc::clone(&registry), events, cancel.clone()));

    let console = if interactive {
        let console = Console::new(Arc::clone(&registry), Arc::clone(&host));
        let handle = Handle::current();
        Some(tokio::task::spawn_blocking(move || run_console(console, handle)))
    } else {
        None
    };

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = async {
            match console {
                Some(task) => {
                    if let Err(e) = task.await {
                        error!("Console task failed: {}", e);
                    }
                }
                None => std::future::pending::<()>().await,
            }
        } => info!("Console closed, shutting down"),
    }

    registry.shutdown().await;
    cancel.cancel();

    if let Err(e) = monitor.await {
        error!("Monitor task failed: {}", e);
    }
    if let Err(e) = echo.await {
        error!("Echo task failed: {}", e);
    }
    for reader in readers {
        let _ = reader.await;
    }

    info!("Redfire FXS shutdown complete");
    Ok(())
}

fn run_console(console: Console, handle: Handle) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            warn!("Console unavailable: {}", e);
            return;
        }
    };
    println!("Type 'help' for commands");

    loop {
        let input = match editor.readline("fxs> ") {
            Ok(input) => input,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                error!("Console read failed: {}", e);
                break;
            }
        };
        if !input.trim().is_empty() {
            let _ = editor.add_history_entry(input.as_str());
        }

        match handle.block_on(console.handle_input(&input)) {
            Ok(Reply::Text(text)) if text.is_empty() => {}
            Ok(Reply::Text(text)) => println!("{}", text.trim_end()),
            Ok(Reply::Quit) => break,
            Err(e) => println!("✗ {}", e),
        }
    }
}

fn validate_configuration(config: &FxsConfig) -> anyhow::Result<()> {
    info!("Validating configuration...");

    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  Idle timeout: {} ms", config.general.idle_timeout_ms);
    println!("  Dialplan contexts: {}", config.dialplan.contexts.len());
    for (index, line) in config.lines.iter().enumerate() {
        println!(
            "  Line {}: {} context={} capture={} playback={} events={}",
            index + 1,
            if line.enable { "enabled" } else { "disabled" },
            line.context,
            line.capture_device,
            line.playback_device,
            if line.event_input_device.is_empty() { "console" } else { line.event_input_device.as_str() }
        );
    }

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = FxsConfig::default_config();
    let toml_content = toml::to_string_pretty(&config).context("Failed to serialize config")?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fxs.toml");
        generate_default_config(Some(path.clone())).unwrap();

        let loaded = FxsConfig::load_from_file(&path).unwrap();
        assert!(validate_configuration(&loaded).is_ok());
    }

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::parse_from(["redfire-fxs"]);
        assert!(cli.command.is_none());
        let cli = Cli::parse_from(["redfire-fxs", "-l", "debug", "run", "--no-console"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Some(Commands::Run { no_console: true })));
    }
}
