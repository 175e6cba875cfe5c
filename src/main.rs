//! Scan coordinator console
//!
//! Runs the coordinator against simulated hardware and drives it from
//! line commands on stdin. Accepted scans are printed as JSON lines.
//!
//! Module structure:
//! - `domain/` - Scan events, device/permission states, errors
//! - `io/` - Hardware ports (BLE, camera, permissions) and simulators
//! - `services/` - Gate, discovery, connection, optical, arbiter, coordinator
//! - `infra/` - Config, logging, metrics

use anyhow::Context;
use clap::Parser;
use scan_coordinator::domain::{AdapterState, Capability, PeripheralId, PermissionState, Symbology};
use scan_coordinator::infra::{init_logging, Config, Metrics};
use scan_coordinator::io::{
    LogFeedback, PermissionId, SimBleCentral, SimCamera, SimPeripheral, SimPermissions,
};
use scan_coordinator::services::{Coordinator, Hardware};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Scan coordinator console - camera and BLE scanner simulation
#[derive(Parser, Debug)]
#[command(name = "scan-coordinator", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Simulated scanner peripherals in range at startup (id[=name])
    #[arg(short, long = "peripheral")]
    peripherals: Vec<String>,
}

const HELP: &str = "\
commands:
  camera                    toggle the camera
  decode <symbology> <data> deliver a camera decode
  discover                  start a discovery session
  select <id>               pick a discovered peripheral
  cancel                    cancel discovery
  advertise <id> [name]     bring a scanner into range
  connect <id>              connect to a scanner
  notify <text>             send scanner data from the connected peripheral
  drop                      drop the link from the peripheral side
  disconnect                disconnect the scanner
  adapter on|off            power the adapter
  deny camera|bluetooth     permanently deny a permission
  status                    print the coordinator snapshot
  quit";

struct Console {
    coordinator: Arc<Coordinator>,
    ble: Arc<SimBleCentral>,
    permissions: Arc<SimPermissions>,
    config: Config,
}

impl Console {
    fn scanner(&self, id: &str, name: Option<&str>) -> SimPeripheral {
        SimPeripheral::scanner(
            id,
            name,
            self.config.service_uuid(),
            self.config.characteristic_uuid(),
        )
    }

    /// Run one command line; `Ok(false)` ends the session
    async fn run(&self, line: &str) -> anyhow::Result<bool> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(true);
        };
        let rest: Vec<&str> = parts.collect();

        match (cmd, rest.as_slice()) {
            ("camera", []) => match self.coordinator.toggle_camera().await {
                Ok(true) => println!("camera open"),
                Ok(false) => println!("camera closed"),
                Err(e) => println!("error: {e}"),
            },
            ("decode", [symbology, payload @ ..]) if !payload.is_empty() => {
                let payload = payload.join(" ");
                if !self.coordinator.optical().on_decode(Symbology::new(*symbology), &payload) {
                    println!("decode dropped");
                }
            }
            ("discover", []) => match self.coordinator.start_discovery().await {
                Ok(()) => println!(
                    "discovering for {}s",
                    self.config.discovery_timeout().as_secs_f32()
                ),
                Err(e) => println!("error: {e}"),
            },
            ("select", [id]) => {
                match self.coordinator.select_peripheral(&PeripheralId::new(*id)).await {
                    Ok(p) => println!("selected {} ({})", p.id, p.label()),
                    Err(e) => println!("error: {e}"),
                }
            }
            ("cancel", []) => {
                self.coordinator.cancel_discovery().await;
                println!("discovery cancelled");
            }
            ("advertise", [id, name @ ..]) => {
                let name = (!name.is_empty()).then(|| name.join(" "));
                self.ble.add_peripheral(self.scanner(id, name.as_deref()));
            }
            ("connect", [id]) => match self.coordinator.connect(PeripheralId::new(*id)).await {
                Ok(()) => println!("connected to {id}"),
                Err(e) => println!("error: {e}"),
            },
            ("notify", text) if !text.is_empty() => {
                match self.coordinator.snapshot().connected_peripheral {
                    Some(peripheral) => {
                        self.ble.notify(&peripheral, text.join(" "));
                    }
                    None => println!("error: no peripheral connected"),
                }
            }
            ("drop", []) => match self.coordinator.snapshot().connected_peripheral {
                Some(peripheral) => self.ble.drop_link(&peripheral),
                None => println!("error: no peripheral connected"),
            },
            ("disconnect", []) => {
                if let Err(e) = self.coordinator.disconnect().await {
                    println!("error: {e}");
                }
            }
            ("adapter", ["on"]) => self.ble.set_adapter_state(AdapterState::PoweredOn),
            ("adapter", ["off"]) => self.ble.set_adapter_state(AdapterState::PoweredOff),
            ("deny", ["camera"]) => {
                self.permissions.set_state(PermissionId::Camera, PermissionState::DeniedPermanently);
                self.coordinator.check_permission(Capability::Camera);
            }
            ("deny", ["bluetooth"]) => {
                for id in [
                    PermissionId::BluetoothScan,
                    PermissionId::BluetoothConnect,
                    PermissionId::FineLocation,
                    PermissionId::Bluetooth,
                ] {
                    self.permissions.set_state(id, PermissionState::DeniedPermanently);
                }
                self.coordinator.check_permission(Capability::Bluetooth);
            }
            ("status", []) => {
                let snapshot = self.coordinator.snapshot();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot).context("serializing snapshot")?
                );
            }
            ("help", _) => println!("{HELP}"),
            ("quit", _) | ("exit", _) => return Ok(false),
            _ => println!("unknown command: {line} (try `help`)"),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_from_path(&args.config);
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        config_file = %config.config_file(),
        platform = ?config.platform(),
        cooldown_ms = %config.cooldown_ms(),
        discovery_timeout_ms = %config.discovery_timeout_ms(),
        payload_encoding = ?config.payload_encoding(),
        "scan_coordinator_starting"
    );

    let ble = Arc::new(SimBleCentral::default());
    let permissions = Arc::new(SimPermissions::granted());
    let metrics = Arc::new(Metrics::new());

    let console = Console {
        coordinator: Arc::new(Coordinator::start(
            config.clone(),
            Hardware {
                ble: ble.clone(),
                permissions: permissions.clone(),
                camera: Arc::new(SimCamera::default()),
                feedback: Arc::new(LogFeedback),
            },
            metrics.clone(),
        )),
        ble,
        permissions,
        config,
    };

    for entry in &args.peripherals {
        let (id, name) = match entry.split_once('=') {
            Some((id, name)) => (id, Some(name)),
            None => (entry.as_str(), None),
        };
        console.ble.add_peripheral(console.scanner(id, name));
    }

    // Scan events as JSON lines on stdout
    let mut events = console.coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", event.to_json()),
                Err(RecvError::Lagged(skipped)) => warn!(skipped = %skipped, "event_printer_lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut notices = console.coordinator.notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => println!("notice: {}", notice.message()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Start metrics reporter
    let metrics_interval = console.config.metrics_interval_secs();
    if metrics_interval > 0 {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics_clone.report().log();
            }
        });
    }

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        if !console.run(line.trim()).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }
    }

    console.coordinator.shutdown().await;
    metrics.report().log();
    info!("scan_coordinator_stopped");
    Ok(())
}
