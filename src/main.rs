// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::path::PathBuf;
use std::time::Duration;
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use buoylink::packet::BlockSize;
use buoylink::serial::{RealSerialPort, SerialSettings};
use buoylink::{Transfer, TransferConfig};

#[derive(Parser)]
#[command(name = "buoylink")]
#[command(about = "Resumable YMODEM batch transfer over a serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// TOML file with transfer settings
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Consecutive errors tolerated before giving up
    #[arg(long)]
    retry: Option<u32>,

    /// Seconds to wait for each byte from the peer
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Packet size for sending (128 or 1024)
    #[arg(long, value_name = "BYTES")]
    block_size: Option<u16>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files as one YMODEM batch, resuming where the last session stopped
    Send {
        /// Files to send, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Receive a YMODEM batch
    Receive {
        /// Directory to save received files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn serial_settings(cli: &Cli) -> Result<SerialSettings, String> {
    Ok(SerialSettings {
        port_name: cli.port.clone(),
        baud_rate: cli.baud,
        data_bits: parse_data_bits(cli.data_bits)?,
        parity: parse_parity(&cli.parity)?,
        stop_bits: parse_stop_bits(cli.stop_bits)?,
    })
}

/// Config file (or defaults) with command line overrides applied.
fn transfer_config(cli: &Cli) -> Result<TransferConfig, String> {
    let mut config = match &cli.config {
        Some(path) => TransferConfig::load(path).map_err(|e| e.to_string())?,
        None => TransferConfig::default(),
    };

    if let Some(retry) = cli.retry {
        config.retry_limit = retry;
    }
    if let Some(secs) = cli.timeout {
        config.read_timeout = Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Invalid timeout {}: {}", secs, e))?;
    }
    if let Some(bytes) = cli.block_size {
        config.block_size = BlockSize::try_from(bytes)?;
    }
    Ok(config)
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let settings = serial_settings(&cli).unwrap_or_else(|e| exit_with(e));
    let config = transfer_config(&cli).unwrap_or_else(|e| exit_with(e));

    info!("Opening serial port: {}", settings.port_name);
    info!("Settings: {} baud, {:?}, {:?}, {:?}",
          settings.baud_rate, settings.data_bits, settings.parity, settings.stop_bits);

    let serial_port = RealSerialPort::open(&settings)
        .unwrap_or_else(|e| exit_with(format!("Failed to open serial port: {}", e)));

    let transfer = Transfer::new(config);
    match cli.command {
        Commands::Send { files } => {
            if let Err(e) = transfer.try_send(Box::new(serial_port), files) {
                exit_with(format!("Send failed: {}", e));
            }
            info!("Batch sent successfully");
        }
        Commands::Receive { output_dir } => {
            if !output_dir.is_dir() {
                exit_with(format!("Output directory not found: {}", output_dir.display()));
            }
            if let Err(e) = transfer.try_receive(Box::new(serial_port), output_dir) {
                exit_with(format!("Receive failed: {}", e));
            }
            info!("Batch received successfully");
        }
    }
}
