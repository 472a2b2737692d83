// meshcast daemon: LAN peer discovery, chunk uploads, chunk downloads.

mod config;
mod file_manager;

use std::sync::Arc;
use std::time::Duration;

use meshcast_core::{
    Catalog, Discovery, DiscoveryEvent, DownloadEngine, FileManager, PeerDirectory, PeerId, SettingsStore, SocketPool,
    UploadEngine,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use file_manager::LocalFileManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("meshcast-daemon {VERSION} — LAN peer-to-peer file sharing daemon");
    println!();
    println!("USAGE:");
    println!("    meshcast-daemon [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Advertises presence on the LAN, serves the files listed under");
    println!("    `shared_dirs`, and fetches chunks requested by other meshcast peers.");
    println!();
    println!("    Discovery   UDP 45678/45679  (LAN multicast 239.255.60.60)");
    println!("    Transfer    TCP 45680        (chunk upload/download)");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/meshcast/config.toml");
    println!("      /etc/meshcast/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      transfer_port = 45680");
    println!("      shared_dirs = [\"/home/user/Shared\"]");
    println!("      downloads_dir = \"/home/user/Downloads/meshcast\"");
    println!();
    println!("      [core]");
    println!("      nickname = \"my-host\"");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    MESHCAST_NICKNAME, MESHCAST_MULTICAST_PORT, MESHCAST_UNICAST_PORT,");
    println!("    MESHCAST_TRANSFER_PORT, MESHCAST_MULTICAST_GROUP, MESHCAST_DATA_DIR,");
    println!("    MESHCAST_DOWNLOADS_DIR, MESHCAST_SHARED_DIRS");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
}

fn main() -> anyhow::Result<()> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("meshcast-daemon {VERSION}");
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("meshcast-daemon: unknown option '{other}'\n");
                print_help();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let cfg = config::load();
    cfg.core.validate()?;

    let settings = SettingsStore::new(cfg.data_dir.clone());
    let local_id = load_or_mint_identity(&settings);

    let file_manager: Arc<dyn FileManager> =
        Arc::new(LocalFileManager::scan(&cfg.shared_dirs).map_err(|e| anyhow::anyhow!("scanning shared dirs: {e}"))?);

    let directory = PeerDirectory::with_timeout(local_id, cfg.core.peer_timeout());
    let catalog = Catalog::new();
    let rate = Arc::new(meshcast_core::rate::TransferRateCalculator::new());

    let upload = UploadEngine::new(local_id, catalog.clone(), file_manager.clone(), rate, cfg.core.upload_config());
    let pool = SocketPool::with_idle_timeout(upload.clone(), cfg.core.socket_idle_timeout());
    upload.bind_pool(pool.clone());

    let download = DownloadEngine::new(local_id, directory.clone(), catalog.clone(), file_manager.clone(), cfg.core.download_config());
    download.bind_pool(pool.clone());

    let discovery = Discovery::bind(
        cfg.core.discovery_config(cfg.transfer_port),
        local_id,
        directory.clone(),
        catalog.clone(),
        file_manager.clone(),
        download.clone(),
    )
    .await?;

    let listener = TcpListener::bind(("0.0.0.0", cfg.transfer_port)).await?;
    tracing::info!(%local_id, port = cfg.transfer_port, "meshcast-daemon: listening for transfers");

    spawn_event_bridge(discovery.subscribe(), download.clone());
    let accept_task = spawn_accept_loop(listener, pool.clone());
    let reaper = spawn_reaper(pool.clone());
    let evictor = spawn_evictor(directory.clone());
    let discovery_task = tokio::spawn(discovery.run());
    let download_task = tokio::spawn(download.run());

    shutdown_signal().await?;
    tracing::info!("meshcast-daemon: shutting down");
    accept_task.abort();
    reaper.abort();
    evictor.abort();
    discovery_task.abort();
    download_task.abort();
    Ok(())
}

/// Forwards unicast/multicast discovery events into the components that care: a
/// `ChunkOwned` reply feeds the download scheduler a new source candidate.
fn spawn_event_bridge(mut events: tokio::sync::broadcast::Receiver<DiscoveryEvent>, download: Arc<DownloadEngine>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DiscoveryEvent::ChunkOwned { from, hash, .. }) => {
                    download.note_source(hash, from).await;
                }
                Ok(DiscoveryEvent::FindResult { from, entries, .. }) => {
                    tracing::debug!(%from, count = entries.len(), "meshcast-daemon: search results");
                }
                Ok(DiscoveryEvent::Chat { from, text }) => {
                    tracing::info!(%from, %text, "meshcast-daemon: chat message");
                }
                Err(RecvError::Closed) => return,
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    })
}

fn spawn_accept_loop(listener: TcpListener, pool: Arc<SocketPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        pool.accept(Box::new(stream)).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "meshcast-daemon: accept failed");
                }
            }
        }
    })
}

fn spawn_reaper(pool: Arc<SocketPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            pool.reap_stale_slots().await;
        }
    })
}

fn spawn_evictor(directory: Arc<PeerDirectory>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            ticker.tick().await;
            directory.evict_stale().await;
        }
    })
}

fn load_or_mint_identity(settings: &SettingsStore) -> PeerId {
    const KEY: &str = "peer_id";
    match settings.get_value(KEY) {
        Ok(bytes) if bytes.len() == meshcast_core::identity::PEER_ID_LEN => {
            let mut arr = [0u8; meshcast_core::identity::PEER_ID_LEN];
            arr.copy_from_slice(&bytes);
            PeerId::from_bytes(arr)
        }
        _ => {
            let id = PeerId::generate();
            if let Err(e) = settings.set_value(KEY, id.as_bytes()) {
                tracing::warn!(error = %e, "meshcast-daemon: failed to persist peer id");
            }
            id
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, spawned tasks are aborted explicitly.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
