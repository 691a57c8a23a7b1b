//! Shroud - obfuscated, encrypted multiplexing tunnel

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use shroud::app::{TunnelClient, TunnelServer};
use shroud::config::Config;
use shroud::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Client,
    Server,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(config_type) = args.gen_config {
        let config = match config_type.as_str() {
            "client" => Config::default_client(),
            "server" => Config::default_server(),
            _ => {
                eprintln!("Unknown config type: {}. Use 'client' or 'server'", config_type);
                std::process::exit(1);
            }
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    let Some(mode) = args.mode else {
        print_help();
        std::process::exit(1);
    };

    let config = match args.config {
        Some(path) => Config::load(&path)?,
        None => match mode {
            Mode::Client => Config::default_client(),
            Mode::Server => Config::default_server(),
        },
    };

    // RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<Level>().ok())
        .or_else(|| config.log.max_level());

    if let Some(level) = log_level {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;
    }

    info!("Shroud v{} starting in {:?} mode...", env!("CARGO_PKG_VERSION"), mode);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match mode {
            Mode::Client => {
                let client = TunnelClient::bind(&config).await?;
                tokio::select! {
                    _ = client.run() => {}
                    signal = tokio::signal::ctrl_c() => signal?,
                }
            }
            Mode::Server => {
                let server = TunnelServer::bind(&config).await?;
                tokio::select! {
                    _ = server.run() => {}
                    signal = tokio::signal::ctrl_c() => signal?,
                }
            }
        }
        info!("Shutting down...");
        Ok::<(), Error>(())
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    mode: Option<Mode>,
    config: Option<PathBuf>,
    gen_config: Option<String>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut mode = None;
        let mut config = None;
        let mut gen_config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "client" if mode.is_none() => mode = Some(Mode::Client),
                "server" if mode.is_none() => mode = Some(Mode::Server),
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => {
                    if i + 1 < args.len() {
                        gen_config = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() && mode.is_some() => {
                    // Positional argument after the mode: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            mode,
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(r#"Shroud - obfuscated, encrypted multiplexing tunnel

USAGE:
    shroud <client|server> [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config <TYPE>     Generate example config (client/server)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    shroud --gen-config server > server.json
    shroud server -c server.json
    shroud client -c client.json

ENVIRONMENT:
    RUST_LOG                Log level (trace, debug, info, warn, error),
                            overrides "log.level" in the config file
"#);
}

fn print_version() {
    println!("Shroud v{}", env!("CARGO_PKG_VERSION"));
    println!("Obfuscated, encrypted multiplexing tunnel");
}
