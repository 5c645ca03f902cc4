//! open-peq CLI: read and write PEQ banks on supported audio devices.

mod transport;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use open_peq_core::device::{discover_devices, DeviceInfo};
use open_peq_core::registry::MODEL_TABLE;
use open_peq_core::{
    AdapterConfig, AdapterRegistry, Connector, DeviceHandle, FilterSet, Transport,
    PEQ_DISABLED_SLOT, SLOT_UNAVAILABLE,
};
use std::io::Read;
use std::sync::Arc;
use transport::{HidDeviceTransport, SerialTransport};

const JDS_MANUFACTURER: &str = "JDS Labs";

#[derive(Parser)]
#[command(
    name = "open-peq",
    version,
    about = "Read and write parametric EQ on USB audio devices"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How to pick the device to talk to.
#[derive(Args)]
struct Target {
    /// HID device path (see `list-devices`). Defaults to the first supported device.
    #[arg(long, conflicts_with = "serial")]
    path: Option<String>,
    /// Serial TTY of a JDS Labs device.
    #[arg(long)]
    serial: Option<String>,
    /// Product name of the serial device.
    #[arg(long, default_value = "Element IV", requires = "serial")]
    serial_model: String,
    /// Report id the device uses for device-to-host responses. Repeatable.
    #[arg(long = "input-report-id", value_parser = parse_report_id)]
    input_report_ids: Vec<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected PEQ-capable HID devices.
    ListDevices {
        #[arg(long)]
        json: bool,
    },
    /// Show the model capability table.
    Models {
        #[arg(long)]
        json: bool,
    },
    /// List the preset slots of a device.
    Slots {
        #[command(flatten)]
        target: Target,
    },
    /// Show the active slot.
    CurrentSlot {
        #[command(flatten)]
        target: Target,
    },
    /// Read a filter bank and print it as JSON.
    Pull {
        #[command(flatten)]
        target: Target,
        /// Slot to read. Defaults to the active slot.
        #[arg(long)]
        slot: Option<i32>,
    },
    /// Write a filter bank read from a JSON file (`-` for stdin).
    Push {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        slot: i32,
        /// FilterSet JSON as printed by `pull`.
        file: String,
        /// Override the file's global gain (dB).
        #[arg(long, allow_hyphen_values = true)]
        preamp: Option<f64>,
    },
    /// Switch PEQ on at a slot.
    Enable {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        slot: i32,
    },
    /// Switch PEQ off.
    Disable {
        #[command(flatten)]
        target: Target,
    },
}

fn parse_report_id(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid report id '{s}': {e}"))
}

fn describe_slot(slot: i32) -> String {
    match slot {
        PEQ_DISABLED_SLOT => "PEQ disabled".to_string(),
        SLOT_UNAVAILABLE => "unknown (device did not answer)".to_string(),
        n => n.to_string(),
    }
}

fn pick_hid(connector: &Connector, path: Option<&str>) -> Result<DeviceInfo> {
    let devices = discover_devices(connector.registry())?;
    let found = match path {
        Some(p) => devices.into_iter().find(|d| d.path == p),
        None => devices.into_iter().next(),
    };
    found.ok_or_else(|| anyhow!("No supported PEQ device found"))
}

async fn open_target(connector: &Connector, target: &Target) -> Result<Arc<DeviceHandle>> {
    if let Some(tty) = &target.serial {
        let transport: Arc<dyn Transport> = Arc::new(SerialTransport::new(tty));
        return connector
            .connect(transport, JDS_MANUFACTURER, &target.serial_model)
            .await
            .with_context(|| format!("open serial device {tty}"));
    }

    let info = pick_hid(connector, target.path.as_deref())?;
    let transport: Arc<dyn Transport> =
        Arc::new(HidDeviceTransport::new(&info.path, &target.input_report_ids));
    connector
        .connect(transport, &info.manufacturer, &info.product)
        .await
        .with_context(|| format!("open {} {}", info.manufacturer, info.product))
}

fn read_filter_set(file: &str) -> Result<FilterSet> {
    let mut text = String::new();
    if file == "-" {
        std::io::stdin().read_to_string(&mut text)?;
    } else {
        text = std::fs::read_to_string(file).with_context(|| format!("read {file}"))?;
    }
    serde_json::from_str(&text).with_context(|| format!("parse filter set from {file}"))
}

async fn run(cli: Cli) -> Result<()> {
    let connector = Connector::new(AdapterRegistry::with_defaults(AdapterConfig::default()));

    match cli.command {
        Commands::ListDevices { json } => {
            let devices = discover_devices(connector.registry())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No supported PEQ devices found.");
                println!("JDS Labs devices are serial; pass --serial <tty> to other commands.");
            } else {
                for dev in &devices {
                    println!(
                        "{} {} [{}] (VID: 0x{:04X}, PID: 0x{:04X}, path: {})",
                        dev.manufacturer, dev.product, dev.adapter, dev.vid, dev.pid, dev.path
                    );
                }
            }
        }
        Commands::Models { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(MODEL_TABLE)?);
            } else {
                for entry in MODEL_TABLE {
                    let c = &entry.config;
                    println!(
                        "{} / {}: {} bands, gain {}..{} dB, disabled preset {}",
                        entry.manufacturer,
                        entry.model,
                        c.max_filters,
                        c.min_gain,
                        c.max_gain,
                        c.disabled_preset_id
                    );
                }
            }
        }
        Commands::Slots { target } => {
            let handle = open_target(&connector, &target).await?;
            for slot in connector.get_available_slots(&handle) {
                let writable = if handle.model_config().is_writable_slot(slot.id) {
                    " (writable)"
                } else {
                    ""
                };
                println!("{:>4}  {}{writable}", slot.id, slot.name);
            }
            connector.close_device(&handle).await?;
        }
        Commands::CurrentSlot { target } => {
            let handle = open_target(&connector, &target).await?;
            let slot = connector.get_current_slot(&handle).await?;
            println!("Current slot: {}", describe_slot(slot));
            connector.close_device(&handle).await?;
        }
        Commands::Pull { target, slot } => {
            let handle = open_target(&connector, &target).await?;
            let slot = match slot {
                Some(s) => s,
                None => connector.get_current_slot(&handle).await?,
            };
            if slot == SLOT_UNAVAILABLE {
                return Err(anyhow!("Active slot unknown; pass --slot"));
            }
            let set = connector.pull_from_device(&handle, slot).await?;
            println!("{}", serde_json::to_string_pretty(&set)?);
            connector.close_device(&handle).await?;
        }
        Commands::Push {
            target,
            slot,
            file,
            preamp,
        } => {
            let set = read_filter_set(&file)?;
            let global_gain = preamp.unwrap_or(set.global_gain);
            let handle = open_target(&connector, &target).await?;
            let reconnect = connector
                .push_to_device(&handle, slot, global_gain, &set.filters)
                .await?;
            let written = set.len().min(handle.model_config().max_filters);
            println!("Wrote {written} bands to slot {slot}");
            if reconnect {
                println!("Device is restarting to apply the preset; reconnect before use.");
            } else {
                connector.close_device(&handle).await?;
            }
        }
        Commands::Enable { target, slot } => {
            let handle = open_target(&connector, &target).await?;
            connector.enable_peq(&handle, true, slot).await?;
            println!("PEQ enabled at slot {slot}");
            connector.close_device(&handle).await?;
        }
        Commands::Disable { target } => {
            let handle = open_target(&connector, &target).await?;
            connector.enable_peq(&handle, false, PEQ_DISABLED_SLOT).await?;
            println!("PEQ disabled");
            connector.close_device(&handle).await?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_id_accepts_hex_and_decimal() {
        assert_eq!(parse_report_id("0x09"), Ok(9));
        assert_eq!(parse_report_id("8"), Ok(8));
        assert!(parse_report_id("0x100").is_err());
    }

    #[test]
    fn slot_sentinels_are_described() {
        assert_eq!(describe_slot(-1), "PEQ disabled");
        assert!(describe_slot(-99).starts_with("unknown"));
        assert_eq!(describe_slot(160), "160");
    }

    #[test]
    fn cli_parses_push_with_negative_preamp() {
        let cli = Cli::try_parse_from([
            "open-peq", "push", "--slot", "160", "--preamp", "-3.5", "bands.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Push { slot, preamp, .. } => {
                assert_eq!(slot, 160);
                assert_eq!(preamp, Some(-3.5));
            }
            _ => panic!("expected push"),
        }
    }
}
