mod ui;

use std::sync::Arc;

use anyhow::Context;
use dioxus_desktop::{Config, WindowBuilder};
use tracing_subscriber::EnvFilter;
use webrtc_rooms::config::AppConfig;
use webrtc_rooms::media::{CpalDevices, StaticDevices};
use webrtc_rooms::peer::{LocalNetwork, WebRtcNetwork};
use webrtc_rooms::room::RoomContext;
use webrtc_rooms::session::FileStorage;
use webrtc_rooms::store::{MemoryStore, RemoteStore};

use crate::ui::Shell;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "failed to start");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    let storage = FileStorage::open(&config.app.storage_path).context("opening local storage")?;

    // Owns the relay connection for the lifetime of the window.
    let runtime = tokio::runtime::Runtime::new()?;
    let ctx = match config.store.url.clone() {
        Some(url) => {
            let store = runtime
                .block_on(RemoteStore::connect(&url))
                .with_context(|| format!("connecting to store relay {}", url))?;
            tracing::info!(%url, broker = %config.peer.broker_url, "using remote store and WebRTC peers");
            RoomContext {
                store: Arc::new(store),
                network: Arc::new(WebRtcNetwork::new(config.peer.clone())),
                devices: Arc::new(CpalDevices),
                config,
            }
        }
        None => {
            tracing::info!("no store relay configured, running in-process");
            RoomContext {
                store: Arc::new(MemoryStore::new()),
                network: Arc::new(LocalNetwork::new()),
                devices: Arc::new(StaticDevices::all()),
                config,
            }
        }
    };

    let shell = Shell {
        ctx,
        storage: Arc::new(storage),
    };
    dioxus_desktop::launch_with_props(
        ui::App,
        shell,
        Config::new().with_window(WindowBuilder::new().with_title("WebRTC Rooms")),
    );
    drop(runtime);
    Ok(())
}
