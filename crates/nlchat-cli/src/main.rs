//! nlchat - chat with a CH34x serial adapter from the terminal
//!
//! Without an action flag every stdin line is sent as one packet and every
//! received packet is printed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use nlchat_core::link::{
    chip_name, DataBits, DeviceEnumerator, FlowControl, FramingMode, MemoryDevices,
    MemoryTransport, Parity, SerialConfig, SessionEvent, SessionHandle, SessionManager, StopBits,
};

/// Port name used in demo mode
const DEMO_PORT: &str = "demo0";

/// How long `--write` waits for a reply before exiting
const WRITE_LINGER: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "nlchat", version, about = "Chat with CH34x USB-serial adapters")]
struct Args {
    /// List attached CH34x adapters and exit
    #[arg(short, long)]
    list: bool,

    /// Serial port to open (e.g. /dev/ttyUSB0 or COM3)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Data bits (5-8)
    #[arg(long, value_parser = clap::value_parser!(u8).range(5..=8))]
    data: Option<u8>,

    /// Stop bits (1, 1.5 or 2)
    #[arg(long)]
    stop: Option<StopBits>,

    /// Parity (none, odd, even, mark, space)
    #[arg(long)]
    parity: Option<Parity>,

    /// Flow control (none, hard, soft)
    #[arg(long)]
    flow: Option<FlowControl>,

    /// Load settings from a JSON file before applying flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the resolved settings to a JSON file
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Package mode start marker
    #[arg(long, requires = "package_end")]
    package_start: Option<String>,

    /// Package mode end marker (enables package mode)
    #[arg(long)]
    package_end: Option<String>,

    /// Package mode inactivity timeout in milliseconds
    #[arg(long, requires = "package_end")]
    package_timeout: Option<u64>,

    /// Reopen the port automatically when the device disappears
    #[arg(long)]
    auto_reconnect: bool,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long)]
    reconnect_interval: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    max_reconnects: Option<u32>,

    /// Send one packet and exit
    #[arg(short, long, group = "action")]
    write: Option<String>,

    /// Print received packets until interrupted
    #[arg(short, long, group = "action")]
    read: bool,

    /// Print settings and statistics as JSON and exit
    #[arg(short, long, group = "action")]
    status: bool,

    /// Talk to a built-in echo device instead of real hardware
    #[arg(long)]
    demo: bool,
}

impl Args {
    fn resolve_config(&self) -> Result<SerialConfig> {
        let mut config = match &self.config {
            Some(path) => SerialConfig::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => SerialConfig::default(),
        };

        if let Some(port) = &self.port {
            config.port_name = port.clone();
        } else if self.demo && config.port_name.is_empty() {
            config.port_name = DEMO_PORT.to_string();
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(bits) = self.data.and_then(DataBits::from_count) {
            config.data_bits = bits;
        }
        if let Some(stop) = self.stop {
            config.stop_bits = stop;
        }
        if let Some(parity) = self.parity {
            config.parity = parity;
        }
        if let Some(flow) = self.flow {
            config.flow_control = flow;
        }
        if let Some(end) = &self.package_end {
            let timeout = self
                .package_timeout
                .map(Duration::from_millis)
                .or(config.framing.package_timeout())
                .unwrap_or(Duration::from_millis(1000));
            config.framing = FramingMode::package(
                self.package_start.as_deref().map(unescape).unwrap_or_default(),
                unescape(end),
                timeout,
            )?;
        }
        if self.auto_reconnect {
            config.auto_reconnect = true;
        }
        if let Some(ms) = self.reconnect_interval {
            config.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_reconnects {
            config.max_reconnect_attempts = max;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Turn `\n`, `\r` and `\t` typed on the command line into control bytes
fn unescape(marker: &str) -> String {
    marker
        .replace("\\r", "\r")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
}

fn list_devices() -> Result<()> {
    let devices = DeviceEnumerator::system()
        .list_device_info()
        .context("Failed to enumerate serial ports")?;

    if devices.is_empty() {
        println!("No CH34x adapters found");
        return Ok(());
    }
    for device in devices {
        let chip = device.pid.and_then(chip_name).unwrap_or("CH34x");
        let serial = device.serial_number.as_deref().unwrap_or("-");
        println!("{}\t{}\t{}", device.name, chip, serial);
    }
    Ok(())
}

/// Echo every byte back, like a loopback plug
async fn run_echo_device(mut devices: MemoryDevices) {
    while let Some(mut device) = devices.accept().await {
        tokio::spawn(async move {
            loop {
                let bytes = device.read_available().await;
                if bytes.is_empty() {
                    break;
                }
                device.send(&bytes).await;
            }
        });
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::PacketReceived(packet) => {
            println!("<< {}", String::from_utf8_lossy(packet));
        }
        SessionEvent::Error(message) => eprintln!("error: {message}"),
        SessionEvent::PortsChanged => eprintln!("device list changed"),
        SessionEvent::Reconnecting { attempt, max } => {
            eprintln!("reconnecting ({attempt}/{max})")
        }
        SessionEvent::PackageTimeout => eprintln!("incomplete package timed out"),
        SessionEvent::StateChanged(state) => tracing::info!(?state, "connection state"),
        SessionEvent::StatisticsUpdated(_) => {}
    }
}

async fn chat(session: &SessionHandle, events: &mut UnboundedReceiver<SessionEvent>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    if let Err(e) = session.write(line).await {
                        tracing::debug!("write failed: {e}");
                    }
                }
                None => return Ok(()),
            },
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn follow(events: &mut UnboundedReceiver<SessionEvent>) -> Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.list {
        return list_devices();
    }

    let config = args.resolve_config()?;
    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("Failed to save settings to {}", path.display()))?;
        tracing::info!(path = %path.display(), "settings saved");
    }
    if config.port_name.is_empty() {
        if args.save_config.is_some() {
            return Ok(());
        }
        bail!("No port given, use --port or --list");
    }

    let (session, mut events) = if args.demo {
        let (transport, devices) = MemoryTransport::new();
        transport.plug(config.port_name.clone());
        tokio::spawn(run_echo_device(devices));
        SessionManager::spawn(Box::new(transport.clone()), Box::new(transport))
    } else {
        SessionManager::spawn_system()
    };

    let port = config.port_name.clone();
    session
        .apply_config(config)
        .await
        .with_context(|| format!("Failed to open {port}"))?;

    if args.status {
        let status = serde_json::json!({
            "state": session.state().await?,
            "config": session.current_config().await?,
            "statistics": session.statistics().await?,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else if let Some(data) = &args.write {
        let written = session
            .write(unescape(data))
            .await
            .context("Failed to write")?;
        eprintln!("wrote {written} bytes to {port}");
        let _ = tokio::time::timeout(WRITE_LINGER, follow(&mut events)).await;
    } else if args.read {
        follow(&mut events).await?;
    } else {
        eprintln!("connected to {port}, type to send, Ctrl-D to quit");
        chat(&session, &mut events).await?;
    }

    session.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_markers_are_unescaped() {
        let args = Args::try_parse_from([
            "nlchat",
            "--port",
            "/dev/ttyUSB0",
            "--package-start",
            "\\r",
            "--package-end",
            "\\r\\n",
        ])
        .unwrap();
        let config = args.resolve_config().unwrap();

        match config.framing {
            FramingMode::Package { start, end, .. } => {
                assert_eq!(start, "\r");
                assert_eq!(end, "\r\n");
            }
            other => panic!("expected package framing, got {other:?}"),
        }
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("<\\t>"), "<\t>");
        assert_eq!(unescape("plain"), "plain");
    }
}
