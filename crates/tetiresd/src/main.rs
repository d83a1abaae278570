//! tetiresd - Tire-wear acquisition daemon
//!
//! Usage:
//!   tetiresd [OPTIONS] [config.toml]
//!
//! Options:
//!   --log-json   Emit logs as JSON
//!
//! Without a config file the daemon uses host serial ports and BlueZ with
//! default settings. Operator commands are read from stdin.

use tetiresd::{ConsoleCommand, Daemon, TetiresConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "tetiresd=info,tetires_link=debug,tetires_session=info";

/// Parsed command-line arguments
struct Args {
    /// Config file (TOML)
    config_path: Option<String>,
    log_json: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        log_json: false,
    };

    for arg in &args {
        match arg.as_str() {
            "--log-json" => result.log_json = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(arg.to_string());
            }
            _ => eprintln!("Unknown argument: {}", arg),
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"tetiresd - Tire-wear acquisition daemon

Usage: tetiresd [OPTIONS] [config.toml]

Options:
  --log-json    Emit logs as JSON
  -h, --help    Print this help message

Examples:
  # Host serial ports and BlueZ, default settings
  tetiresd

  # With a config file, JSON logs
  tetiresd --log-json /etc/tetires/tetiresd.toml

Type 'help' at the prompt for operator commands.
"#
    );
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout belongs to the console
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    init_logging(args.log_json);

    tracing::info!("Starting tetiresd");

    let config = match &args.config_path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path);
            TetiresConfig::load(path)?
        }
        None => {
            tracing::info!("No config file provided, using defaults");
            TetiresConfig::default()
        }
    };

    let daemon = Daemon::start(&config);
    let console = daemon.console();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };
        // EOF on stdin
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match console.execute(command).await {
            Ok(reply) => {
                for line in &reply.lines {
                    println!("{}", line);
                }
                if reply.quit {
                    break;
                }
            }
            Err(e) => println!("Error: {}", e),
        }
    }

    daemon.shutdown().await;
    Ok(())
}
