//! Process bootstrap: configuration, serial link, fleet directory, store,
//! the supervisor reactor, the operator HTTP surface, and graceful
//! shutdown wiring.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use fuelvisor::api::{self, AppState, Md5Authenticator, SessionStore};
use fuelvisor::directory::{FleetDirectory, HttpDirectory};
use fuelvisor::port::{open_serial, NozzleLink, NozzlePort};
use fuelvisor::store::FileStore;
use fuelvisor::subscribers::{LogWriter, Subscribe, SubscriberSet};
use fuelvisor::supervisor::Supervisor;
use fuelvisor::{shutdown, Bus, Config, HealthMonitor, RuntimeError};

#[derive(Parser, Debug)]
#[command(name = "fuelvisor", version, about = "Vehicle fuel-dispensing supervisor")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "fuelvisor.toml")]
    config: PathBuf,

    /// Override the serial device path.
    #[arg(long)]
    serial: Option<String>,

    /// Override the operator listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut cfg = Config::load(&cli.config)?;
    if let Some(serial) = cli.serial {
        cfg.serial.path = serial;
    }
    if let Some(listen) = cli.listen {
        cfg.api.listen = listen;
    }
    log::info!(
        "nozzle {} on {} @ {} baud, tank {}",
        cfg.nozzle_id,
        cfg.serial.path,
        cfg.serial.baud,
        cfg.tank_id
    );

    let bus = Bus::new(1024);
    let health = Arc::new(HealthMonitor::new(
        cfg.board_heartbeat_budget(),
        cfg.nozzle_heartbeat_budget(),
        cfg.app_comm_budget(),
    ));

    // Without the permitted-vehicle set no tag can ever clear, so a
    // directory failure here is fatal; once running, directory trouble is
    // an event, not a crash.
    let directory = Arc::new(HttpDirectory::new(cfg.directory.clone(), cfg.tank_id));
    let permitted = directory
        .refresh_tags()
        .await
        .map_err(RuntimeError::DirectoryInit)?;
    log::info!("{permitted} vehicles permitted for tank {}", cfg.tank_id);

    let store = Arc::new(
        FileStore::open(cfg.store_path.clone())
            .await
            .map_err(RuntimeError::StoreInit)?,
    );

    let serial = open_serial(&cfg.serial)?;
    let (frames_tx, frames_rx) = mpsc::channel(256);
    let port = NozzlePort::spawn(serial, frames_tx, bus.clone(), cfg.uart_response_timeout());
    let link: Arc<dyn NozzleLink> = port.clone();

    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (machine, status_rx) = Supervisor::new(
        cfg.clone(),
        link.clone(),
        store,
        directory,
        health.clone(),
        bus.clone(),
    );

    let cancel = CancellationToken::new();
    let machine_task = tokio::spawn(machine.run(frames_rx, commands_rx, cancel.clone()));

    // Bus → subscriber fan-out. Observation lives out here; nothing on the
    // bus refers back into the supervisor.
    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let set = SubscriberSet::new(subscribers, bus.clone());
    let mut bus_rx = bus.subscribe();
    let pump = tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(ev) => set.emit_arc(Arc::new(ev)),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    let app_state = Arc::new(AppState {
        commands: commands_tx,
        status: status_rx,
        health: health.clone(),
        port: link,
        sessions: SessionStore::new(),
        authenticator: Arc::new(Md5Authenticator::new(
            &cfg.api.username,
            &cfg.api.shared_secret,
        )),
        upload_dir: cfg.api.upload_dir.clone(),
    });
    let router = api::router(app_state);
    let listener = tokio::net::TcpListener::bind(&cfg.api.listen)
        .await
        .map_err(|e| RuntimeError::Listen {
            addr: cfg.api.listen.clone(),
            reason: e.to_string(),
        })?;
    log::info!("operator surface listening on {}", cfg.api.listen);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    shutdown::wait_for_shutdown_signal().await?;
    log::info!("shutdown signal received");
    cancel.cancel();

    let _ = machine_task.await;
    if let Ok(Err(err)) = server.await {
        log::error!("operator surface exited with {err}");
    }
    pump.abort();
    Ok(())
}
