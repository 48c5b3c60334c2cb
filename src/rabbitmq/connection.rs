// src/rabbitmq/connection.rs

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use super::backend::{Backend, QueueDescriptor, Session};
use super::errors::Result;
use super::topology::Topology;

/// A session known to be live at the moment it was handed out, together with the queue
/// declared on it.
pub struct LiveSession<S> {
    pub session: Arc<S>,
    pub queue: QueueDescriptor,
}

impl<S> Clone for LiveSession<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            queue: self.queue.clone(),
        }
    }
}

/// Owns the connection and channel handles and recovers them lazily.
///
/// There is no background monitor: liveness is checked by [`ConnectionSupervisor::ensure_live`]
/// at the moment an operation needs a channel. The check-and-reconnect sequence runs under a
/// single lock, so concurrent callers during an outage wait for one reconnect instead of each
/// dialing their own.
pub struct ConnectionSupervisor<B: Backend> {
    backend: B,
    uri: String,
    topology: Topology,
    connect_timeout: Option<Duration>,
    current: Mutex<Option<LiveSession<B::Session>>>,
    reconnects: AtomicU64,
}

impl<B: Backend> ConnectionSupervisor<B> {
    /// Dial the backend and declare the topology once. Any failure is returned and no
    /// supervisor is built.
    pub async fn connect(
        backend: B,
        uri: impl Into<String>,
        topology: Topology,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let supervisor = Self {
            backend,
            uri: uri.into(),
            topology,
            connect_timeout,
            current: Mutex::new(None),
            reconnects: AtomicU64::new(0),
        };

        let live = supervisor.establish().await?;
        *supervisor.current.lock().await = Some(live);
        info!(
            queue = %supervisor.topology.queue_name(),
            exchange = %supervisor.topology.exchange_name(),
            "Connected to RabbitMQ"
        );
        Ok(supervisor)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of times a dead session has been replaced since construction.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map_or(false, |live| live.session.is_live())
    }

    /// Return the current session if it is still live, otherwise reconnect and re-declare the
    /// topology first.
    ///
    /// A failed reconnect leaves the previously held handles in place so the next call can try
    /// again.
    pub async fn ensure_live(&self) -> Result<LiveSession<B::Session>> {
        let mut current = self.current.lock().await;

        if let Some(live) = current.as_ref() {
            if live.session.is_live() {
                return Ok(live.clone());
            }
            warn!(
                queue = %self.topology.queue_name(),
                "RabbitMQ session is closed, reconnecting"
            );
        }

        let live = self.establish().await?;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!(
            queue = %live.queue.name,
            reconnects = self.reconnect_count(),
            "Reconnected to RabbitMQ and re-declared topology"
        );

        *current = Some(live.clone());
        Ok(live)
    }

    /// Open a connection and channel and declare the topology on them. When a connect timeout is
    /// configured it bounds both steps together, and a session opened before the deadline
    /// passed is closed again.
    async fn establish(&self) -> Result<LiveSession<B::Session>> {
        let deadline = self.connect_timeout.map(|limit| Instant::now() + limit);

        let session = within(deadline, self.backend.open(&self.uri))
            .await
            .map_err(|e| {
                error!("Failed to connect to RabbitMQ: {}", e);
                e
            })?;

        match within(deadline, self.topology.declare(&session)).await {
            Ok(queue) => Ok(LiveSession {
                session: Arc::new(session),
                queue,
            }),
            Err(e) => {
                error!("Failed to declare topology: {}", e);
                if let Err(close_err) = session.close().await {
                    warn!("Failed to close session after topology error: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Release the channel and connection. Already-closed handles are tolerated.
    pub async fn close(&self) -> Result<()> {
        let released = self.current.lock().await.take();
        match released {
            Some(live) => {
                info!(queue = %live.queue.name, "Closing RabbitMQ session");
                live.session.close().await
            }
            None => Ok(()),
        }
    }
}

async fn within<T>(
    deadline: Option<Instant>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => timeout_at(deadline, operation).await?,
        None => operation.await,
    }
}
