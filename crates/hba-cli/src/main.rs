//! `hbabot` – command line front end for the HBA robot.
//!
//! ```bash
//! hbabot get hba_basicio buttons
//! hbabot set hba_basicio leds 3c
//! hbabot watch hba_qtr.qtr hba_quad.enc1 --json
//! hbabot tablebot
//! hbabot patrol
//! hbabot config --save
//! ```
//!
//! Every robot program runs on a single-threaded Tokio runtime.  Ctrl-C
//! goes through the event bus shutdown path, which stops all actuators and
//! closes every link before the process exits.

mod commands;
mod config;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use hba_types::Channel;

#[derive(Parser, Debug)]
#[command(name = "hbabot", version, about = "Drive an HBA robot through its hardware daemon")]
struct Cli {
    /// Daemon host (overrides config and HBABOT_HOST).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Daemon port (overrides config and HBABOT_PORT).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Config file (default ~/.hbabot/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read one register.
    Get { peripheral: String, register: String },

    /// Write one register.
    Set {
        peripheral: String,
        register: String,
        value: String,
    },

    /// Stream live readings of one or more `peripheral.register` channels.
    Watch {
        #[arg(required = true)]
        channels: Vec<Channel>,

        /// One JSON object per reading.
        #[arg(long)]
        json: bool,
    },

    /// Drive around the table top without falling off.
    Tablebot,

    /// Cruise to the edge, turn around, repeat.
    Patrol,

    /// Show the effective configuration.
    Config {
        /// Write it to the config file.
        #[arg(long)]
        save: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = hba_runtime::init_tracing("hbabot");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = config::resolve(&path)?;
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    if let Commands::Config { save } = cli.command {
        print!("{}", toml::to_string_pretty(&cfg)?);
        if save {
            config::save_to(&cfg, &path)?;
            println!("\n  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        match &cli.command {
            Commands::Get { peripheral, register } => commands::get(&cfg, peripheral, register).await,
            Commands::Set {
                peripheral,
                register,
                value,
            } => commands::set(&cfg, peripheral, register, value).await,
            Commands::Watch { channels, json } => commands::watch(&cfg, channels, *json).await,
            Commands::Tablebot => commands::tablebot(&cfg).await,
            Commands::Patrol => commands::patrol(&cfg).await,
            Commands::Config { .. } => Ok(()),
        }
    })
}
