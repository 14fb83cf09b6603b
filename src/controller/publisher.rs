//! Publisher Controller - single entry point for the UI layer
//!
//! Wires the three publishing components together for one session and owns the
//! `Idle`/`Publishing` switch:
//!
//! ```text
//! SampleSource ─[on_sample]→ PublishQueue ─[drain loop]→ BrokerConnection ─→ broker
//!                    │                                          │
//!                    └────────────── StatusBoard ◄──────────────┘
//! ```
//!
//! The switch is an atomic compare-and-swap, so concurrent `start()` calls cannot both
//! win. Session setup and teardown run under one async mutex, which serializes
//! `start()`, `stop()` and the teardown triggered by a fatal connection failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PublisherConfig;
use crate::error::PublisherError;
use crate::location::{
    Active, LocationProvider, LocationSample, PermissionGate, SampleSink, SampleSource,
};
use crate::mqtt::{BrokerConnection, ConnectionState, QueuedSample, SessionIdentity, TransportFactory};
use crate::queue::{Enqueued, PublishQueue};
use crate::status::{PublisherState, PublisherStatus, SessionStatus, StatusBoard};

/// Feeds samples from the source into the session queue
struct QueueSink {
    queue: Arc<PublishQueue<QueuedSample>>,
    status: SessionStatus,
}

#[async_trait]
impl SampleSink for QueueSink {
    async fn on_sample(&self, sample: LocationSample) {
        self.status.record_received();
        match self.queue.enqueue(QueuedSample::from(sample)).await {
            Ok(Enqueued::Appended) => {}
            Ok(Enqueued::Evicted(old)) => {
                debug!(
                    "Queue full, dropped sample from {}",
                    old.sample.timestamp_ms()
                );
                self.status.record_lost(1);
            }
            // Full is the only enqueue failure, raised once the block timeout expires.
            Err(_) => {
                let err = PublisherError::QueueFull;
                warn!("Dropping sample: {}", err);
                self.status.record_lost(1);
                self.status.record_error(&err);
            }
        }
    }
}

struct Session {
    source: SampleSource<Active>,
    queue: Arc<PublishQueue<QueuedSample>>,
    status: SessionStatus,
    cancel: CancellationToken,
    drain: JoinHandle<Result<(), PublisherError>>,
    grace: Duration,
}

struct Inner {
    provider: Arc<dyn LocationProvider>,
    permissions: Arc<dyn PermissionGate>,
    transports: Arc<dyn TransportFactory>,
    publishing: AtomicBool,
    session: Mutex<Option<Session>>,
    status: StatusBoard,
}

/// Handle to the publisher; clones share the same session
#[derive(Clone)]
pub struct PublisherController {
    inner: Arc<Inner>,
}

impl PublisherController {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        permissions: Arc<dyn PermissionGate>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                permissions,
                transports,
                publishing: AtomicBool::new(false),
                session: Mutex::new(None),
                status: StatusBoard::new(),
            }),
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.inner.publishing.load(Ordering::Acquire)
    }

    /// Latest status snapshot
    pub fn status(&self) -> PublisherStatus {
        self.inner.status.snapshot()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<PublisherStatus> {
        self.inner.status.subscribe()
    }

    /// Starts a new publishing session
    ///
    /// # Errors
    ///
    /// * [`PublisherError::AlreadyPublishing`] - a session is running; it is left untouched
    /// * [`PublisherError::InvalidConfig`] - `config` failed validation
    /// * [`PublisherError::PermissionDenied`] - location permission missing and refused
    /// * [`PublisherError::LocationUnavailable`] - the provider refused to start updates
    pub async fn start(&self, config: PublisherConfig) -> Result<(), PublisherError> {
        if self
            .inner
            .publishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("start() ignored, publisher is already running");
            return Err(PublisherError::AlreadyPublishing);
        }

        match self.launch(config).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Failed to start publisher: {}", err);
                self.inner.status.record_error(&err);
                self.inner.publishing.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn launch(&self, config: PublisherConfig) -> Result<(), PublisherError> {
        config
            .validate()
            .map_err(|e| PublisherError::InvalidConfig(e.to_string()))?;

        let mut slot = self.inner.session.lock().await;

        let identity = SessionIdentity::for_session(&config.broker);
        info!(
            "Starting publisher session {} -> {}:{}/{}",
            identity.client_id(),
            identity.host(),
            identity.port(),
            identity.topic()
        );
        let status = self.inner.status.begin_session(identity.client_id());

        let queue = Arc::new(PublishQueue::new(
            config.queue.capacity,
            config.queue.overflow_policy,
            config.block_timeout(),
        ));
        let sink = Arc::new(QueueSink {
            queue: queue.clone(),
            status: status.clone(),
        });

        let source = SampleSource::create(
            self.inner.provider.clone(),
            self.inner.permissions.clone(),
        )
        .start(config.location.update_request(), sink)
        .await?;

        let controller = Arc::downgrade(&self.inner);
        let generation = status.generation();
        let connection = BrokerConnection::new(
            self.inner.transports.create(),
            identity,
            config.student_id.clone(),
            config.connection_settings(),
            queue.clone(),
            status.clone(),
        )
        .on_fatal(move |err| {
            error!("Publisher halting after fatal error: {}", err);
            let controller = controller.clone();
            tokio::spawn(async move {
                halt_after_fatal(controller, generation).await;
            });
        });

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(connection.run(cancel.clone()));

        status.set_state(PublisherState::Publishing);
        *slot = Some(Session {
            source,
            queue,
            status,
            cancel,
            drain,
            grace: config.stop_grace(),
        });

        info!("Publisher session started");
        Ok(())
    }

    /// Stops the running session. Safe to call when idle.
    ///
    /// Returns within the configured grace period even if the broker hangs; a drain
    /// loop that does not wind down in time is aborted.
    pub async fn stop(&self) {
        let mut slot = self.inner.session.lock().await;
        let Some(session) = slot.take() else {
            debug!("stop() called while idle");
            return;
        };

        teardown(session, &self.inner.publishing, true).await;
        info!("Publisher stopped");
    }
}

async fn halt_after_fatal(inner: Weak<Inner>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut slot = inner.session.lock().await;
    let current = slot
        .as_ref()
        .is_some_and(|session| session.status.generation() == generation);
    if !current {
        debug!("Session {} already torn down", generation);
        return;
    }

    if let Some(session) = slot.take() {
        // The drain task is the one reporting the failure; it finishes on its own.
        teardown(session, &inner.publishing, false).await;
    }
    warn!("Publisher returned to idle after fatal connection failure");
}

async fn teardown(mut session: Session, publishing: &AtomicBool, join_drain: bool) {
    info!("Tearing down publisher session {}", session.status.generation());
    let deadline = tokio::time::Instant::now() + session.grace;

    session.cancel.cancel();
    if tokio::time::timeout_at(deadline, session.source.stop())
        .await
        .is_err()
    {
        warn!("Sample source did not stop within {:?}", session.grace);
    }

    if join_drain {
        match tokio::time::timeout_at(deadline, &mut session.drain).await {
            Ok(Ok(Ok(()))) => debug!("Drain loop finished"),
            Ok(Ok(Err(e))) => debug!("Drain loop ended with: {}", e),
            Ok(Err(e)) => error!("Drain loop task failed: {}", e),
            Err(_) => {
                warn!(
                    "Drain loop did not stop within {:?}, aborting it",
                    session.grace
                );
                session.drain.abort();
            }
        }
    }

    let discarded = session.queue.clear();
    session.status.record_lost(discarded as u64);
    session.status.set_connection_state(ConnectionState::Disconnected);
    // Cleared before announcing Idle so an observer can restart right away.
    publishing.store(false, Ordering::Release);
    session.status.set_state(PublisherState::Idle);
}
