// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Manager
//!
//! Owns the single logical connection/channel of the process. Publishers and
//! consumers borrow the current channel through `connect()`, which reuses a
//! live link and otherwise establishes a new one and installs the topology.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> (Error | Closed)`,
//! and on transport loss `Reconnecting -> Connecting ...` after a fixed delay,
//! forever, until `close()` is called. Topology errors are setup errors: they
//! are returned to the caller and do not trigger the reconnect loop.

use crate::{
    channel::{AmqpChannel, Connector, LapinConnector},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    topology::AmqpTopology,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
    Reconnecting,
}

struct CurrentLink {
    generation: u64,
    channel: Arc<dyn AmqpChannel>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    topology: AmqpTopology,
    reconnect_delay: Duration,
    current: Mutex<Option<CurrentLink>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    reconnect_pending: AtomicBool,
    shutdown: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: AmqpTopology,
        reconnect_delay: Duration,
    ) -> Arc<ConnectionManager> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(ConnectionManager {
            connector,
            topology,
            reconnect_delay,
            current: Mutex::new(None),
            state,
            generation: AtomicU64::new(0),
            reconnect_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Manager for the payment topology over lapin.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(LapinConnector::new(cfg.clone())),
            AmqpTopology::payments(),
            cfg.reconnect_delay(),
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn topology(&self) -> &AmqpTopology {
        &self.topology
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Returns the live channel, establishing a new link when there is none.
    ///
    /// Transport failures schedule a reconnect after the fixed delay and are
    /// returned. Topology failures are returned as setup errors.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(AmqpError::ShutdownError);
        }

        let mut current = self.current.lock().await;
        if let Some(link) = current.as_ref() {
            if link.channel.is_open() {
                return Ok(link.channel.clone());
            }
        }
        *current = None;

        self.set_state(ConnectionState::Connecting);
        debug!("connecting to rabbitmq...");

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(err) => {
                error!(error = err.to_string(), "failed to connect to rabbitmq");
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect();
                return Err(err);
            }
        };

        if let Err(err) = self.topology.install(link.channel.as_ref()).await {
            error!(
                error = err.to_string(),
                "error setting up rabbitmq queues and exchanges"
            );
            let _ = link.channel.close().await;

            if err.is_connectivity() {
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect();
            } else {
                self.set_state(ConnectionState::Error);
            }
            return Err(err);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *current = Some(CurrentLink {
            generation,
            channel: link.channel.clone(),
        });
        self.set_state(ConnectionState::Connected);
        info!(generation, "rabbitmq connected successfully");

        self.watch_link(generation, link.lost);
        Ok(link.channel)
    }

    /// Current channel without connecting, if a link is established.
    pub async fn current_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|link| link.channel.clone())
    }

    fn watch_link(self: &Arc<Self>, generation: u64, mut lost: mpsc::UnboundedReceiver<AmqpError>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = lost
                .recv()
                .await
                .map(|err| err.to_string())
                .unwrap_or_else(|| "link dropped".to_owned());

            let Some(manager) = manager.upgrade() else {
                return;
            };
            if manager.shutdown.load(Ordering::SeqCst) || !manager.release(generation).await {
                return;
            }

            warn!(reason = %reason, "rabbitmq connection closed, reconnecting...");
            manager.set_state(ConnectionState::Reconnecting);
            manager.schedule_reconnect();
        });
    }

    /// Drops the current link if it is still `generation`.
    async fn release(&self, generation: u64) -> bool {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(link) if link.generation == generation => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager: Weak<ConnectionManager> = Arc::downgrade(self);
        let delay = self.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.reconnect_pending.store(false, Ordering::SeqCst);
            if manager.shutdown.load(Ordering::SeqCst) {
                return;
            }

            if let Err(err) = manager.connect().await {
                debug!(error = err.to_string(), "reconnect attempt failed");
            }
        });
    }

    /// Closes the channel, then the connection, and stops reconnecting.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown.store(true, Ordering::SeqCst);

        let current = self.current.lock().await.take();
        let result = match current {
            Some(link) => link.channel.close().await,
            None => Ok(()),
        };

        self.set_state(ConnectionState::Closed);
        match &result {
            Ok(()) => info!("rabbitmq connection closed"),
            Err(err) => error!(error = err.to_string(), "error closing rabbitmq connection"),
        }
        result
    }

    /// Waits for SIGINT or SIGTERM, then closes gracefully.
    pub async fn close_on_signal(&self) -> Result<(), AmqpError> {
        shutdown_signal().await;
        warn!("termination signal received");
        self.close().await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = err.to_string(), "failure to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to listen for sigterm");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
