use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use itc_core::{paths, InitMode, Itc, ItcConfig, COORD_MASK};

use crate::config::CoordConfig;
use crate::directory::NameDirectory;
use crate::error::{CoordError, Result};
use crate::name_server::NameServer;
use crate::service::{bind_fresh, Service, Sweep};
use crate::slots::SlotPools;

/// A running Coordinator: the handshake service, the zombie sweeps and the
/// name server, sharing one set of slot pools and one directory.
///
/// Must be started from within a tokio runtime. Dropping it stops the
/// service loop; [`Coordinator::shutdown`] also waits for everything to
/// finish and releases the Coordinator's own ITC context.
pub struct Coordinator {
    config: CoordConfig,
    itc: Itc,
    slots: Arc<SlotPools>,
    directory: Arc<NameDirectory>,
    shutdown: watch::Sender<bool>,
    service: Option<JoinHandle<()>>,
    name_server: Option<NameServer>,
}

impl Coordinator {
    pub async fn start(config: CoordConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.socket_dir)?;

        let itc = Itc::init_coordinator(ItcConfig {
            mailbox_count: config.mailbox_count,
            namespace: config.namespace.clone(),
            socket_dir: config.socket_dir.clone(),
            mode: InitMode::Coordinated,
            ..ItcConfig::default()
        })?;

        let slots = Arc::new(SlotPools::new(config.max_processes));
        let directory = Arc::new(NameDirectory::new());

        let (name_server, ready) =
            NameServer::spawn(itc.clone(), Arc::clone(&slots), Arc::clone(&directory))?;
        let started = match ready.await {
            Ok(result) => result,
            Err(_) => Err(CoordError::NameServer(
                "exited during startup".to_string(),
            )),
        };
        if let Err(e) = started {
            stop_name_server(name_server).await;
            return Err(e);
        }

        let listener = match bind_fresh(&paths::coordinator_socket(&config.socket_dir)) {
            Ok(listener) => listener,
            Err(e) => {
                stop_name_server(name_server).await;
                return Err(e.into());
            }
        };

        let service = Arc::new(Service::new(
            config.socket_dir.clone(),
            COORD_MASK,
            itc.coordinator(),
            Arc::clone(&slots),
            Arc::clone(&directory),
            Sweep {
                tick: config.tick(),
                zombie_ticks: config.zombie_ticks,
                low_water: config.low_water,
            },
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(service.run(listener, shutdown_rx));

        info!(
            socket_dir = %config.socket_dir.display(),
            max_processes = config.max_processes,
            namespace = %config.namespace,
            "coordinator started"
        );

        Ok(Self {
            config,
            itc,
            slots,
            directory,
            shutdown,
            service: Some(handle),
            name_server: Some(name_server),
        })
    }

    /// Stop serving, wait for the service and the name server, and shut the
    /// Coordinator's ITC context down.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(service) = self.service.take() {
            if let Err(e) = service.await {
                error!(error = %e, "coordinator service task failed");
            }
        }
        if let Some(name_server) = self.name_server.take() {
            tokio::task::spawn_blocking(move || name_server.stop())
                .await
                .map_err(|e| CoordError::NameServer(e.to_string()))??;
        }
        self.itc.exit()?;
        info!("coordinator stopped");
        Ok(())
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn socket_dir(&self) -> &Path {
        &self.config.socket_dir
    }

    pub fn slots(&self) -> &SlotPools {
        &self.slots
    }

    pub fn directory(&self) -> &NameDirectory {
        &self.directory
    }

    /// The Coordinator's own ITC context.
    pub fn itc(&self) -> &Itc {
        &self.itc
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn stop_name_server(name_server: NameServer) {
    match tokio::task::spawn_blocking(move || name_server.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "name server did not stop cleanly"),
        Err(e) => error!(error = %e, "cannot join name server"),
    }
}
