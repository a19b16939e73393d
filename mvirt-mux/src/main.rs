use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_mux::host::{PacketUplink, ProcNamespaces, TapDevice, TapFactory};
use mvirt_mux::{Encap, MuxBuilder, MuxConfig};

#[derive(Parser)]
#[command(name = "mvirt-mux")]
#[command(about = "mvirt virtual network multiplexer daemon")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mux interface name (also the control socket name)
    #[arg(short, long)]
    name: Option<String>,

    /// Uplink encapsulation: vlan or vpls
    #[arg(short, long)]
    encap: Option<Encap>,

    /// Uplink interface; comma-separated alternatives, repeat for more uplinks
    #[arg(short, long)]
    uplink: Vec<String>,

    /// Interval between telemetry snapshots logged at debug level, in seconds
    #[arg(long, default_value_t = 60)]
    telemetry_interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_mux=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MuxConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MuxConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = Some(name);
    }
    if let Some(encap) = args.encap {
        config.encap = encap;
    }
    if !args.uplink.is_empty() {
        config.uplinks = args.uplink;
    }

    let name = config.name();
    info!(name = %name, compatible = config.compatible(), "Initializing mvirt-mux");

    let device = TapDevice::create(&name)?;
    if let Err(e) = device.set_up() {
        warn!(error = %e, "mux device stays down");
    }

    let mux = MuxBuilder::from_config(&config, device.clone())
        .factory(Arc::new(TapFactory::new()))
        .namespaces(Arc::new(ProcNamespaces::new()))
        .build()?;

    let weak = Arc::downgrade(&mux);
    device.spawn_reader(move |frame| {
        if let Some(mux) = weak.upgrade() {
            mux.xmit(frame);
        }
    })?;

    let mut uplinks = Vec::new();
    for akas in config.uplink_akas() {
        let Some(uplink) = akas.iter().find_map(|aka| PacketUplink::open(aka).ok()) else {
            warn!(akas = ?akas, "no uplink present");
            continue;
        };
        mux.attach_uplink(uplink.clone())?;
        uplink.spawn_reader(&mux)?;
        uplinks.push(uplink);
    }

    mux.start_service()?;
    info!(name = %name, uplinks = uplinks.len(), "mvirt-mux running");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = ticker.tick() => {
                match serde_json::to_string(&mux.telemetry()) {
                    Ok(json) => debug!(telemetry = %json, "telemetry"),
                    Err(e) => warn!(error = %e, "failed to serialize telemetry"),
                }
            }
        }
    }

    info!("Shutting down");
    mux.teardown();
    for uplink in &uplinks {
        uplink.close();
    }
    device.close();
    Ok(())
}
