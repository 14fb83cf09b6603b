//! Broker connection lifecycle and the drain loop
//!
//! # State Machine
//!
//! ```text
//!                 connect()            success
//! Disconnected ─────────────► Connecting ─────────► Connected ──┐
//!      ▲                        │    ▲                  │       │ publish ok
//!      │ disconnect()           │    │ backoff          │◄──────┘
//!      │ / fatal       failure  ▼    │                  │ publish failure
//!      └──────────────────── Failed ─┘◄─────────────────┘ (via Connecting)
//! ```
//!
//! Consecutive failures, failed connects and failed publishes alike, are retried
//! with exponential backoff. Only a successful publish resets the count. Once the
//! count exceeds `max_reconnect_attempts` the fatal handler runs and the connection
//! halts in `Disconnected`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::config::SessionIdentity;
use super::payload;
use super::transport::{Transport, TransportError};
use crate::error::PublisherError;
use crate::location::LocationSample;
use crate::queue::PublishQueue;
use crate::status::SessionStatus;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Retry and timing knobs for one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// Retries per sample after its first failed publish
    pub max_publish_retries: u32,
    pub backoff: Backoff,
    pub batch_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            max_publish_retries: 3,
            backoff: Backoff::default(),
            batch_size: 10,
        }
    }
}

/// A sample waiting in the publish queue together with its failed attempts
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueuedSample {
    pub sample: LocationSample,
    pub attempts: u32,
}

impl From<LocationSample> for QueuedSample {
    fn from(sample: LocationSample) -> Self {
        Self {
            sample,
            attempts: 0,
        }
    }
}

pub type FatalHandler = Box<dyn Fn(&PublisherError) + Send + Sync>;

enum Step {
    Ready,
    Cancelled,
}

/// Batch taken off the queue but not yet resolved
///
/// Whatever is still held when it drops was never sent: the drain loop was cancelled
/// or its task aborted mid-batch. Those samples are counted lost.
struct InFlight {
    items: VecDeque<QueuedSample>,
    status: SessionStatus,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.items.is_empty() {
            debug!("Discarding {} unsent samples from the current batch", self.items.len());
            self.status.record_lost(self.items.len() as u64);
        }
    }
}

pub struct BrokerConnection {
    transport: Box<dyn Transport>,
    identity: SessionIdentity,
    student_id: String,
    settings: ConnectionSettings,
    queue: Arc<PublishQueue<QueuedSample>>,
    status: SessionStatus,
    on_fatal: Option<FatalHandler>,
    state: ConnectionState,
    consecutive_failures: u32,
}

impl BrokerConnection {
    pub fn new(
        transport: Box<dyn Transport>,
        identity: SessionIdentity,
        student_id: String,
        settings: ConnectionSettings,
        queue: Arc<PublishQueue<QueuedSample>>,
        status: SessionStatus,
    ) -> Self {
        Self {
            transport,
            identity,
            student_id,
            settings,
            queue,
            status,
            on_fatal: None,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
        }
    }

    /// Registers the callback run once reconnect attempts are exhausted
    pub fn on_fatal(mut self, handler: impl Fn(&PublisherError) + Send + Sync + 'static) -> Self {
        self.on_fatal = Some(Box::new(handler));
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.status.set_connection_state(state);
        }
    }

    /// Opens the transport, bounded by the connect timeout
    pub async fn connect(&mut self) -> Result<(), PublisherError> {
        self.set_state(ConnectionState::Connecting);
        info!(
            "Connecting to {}:{} as {}",
            self.identity.host(),
            self.identity.port(),
            self.identity.client_id()
        );

        let timeout = self.settings.connect_timeout;
        let cause = match tokio::time::timeout(timeout, self.transport.connect(&self.identity)).await
        {
            Ok(Ok(())) => {
                self.set_state(ConnectionState::Connected);
                info!("Connected to broker");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", timeout),
        };

        self.set_state(ConnectionState::Failed);
        warn!("Connecting to broker failed: {}", cause);
        Err(PublisherError::ConnectError { cause })
    }

    /// Publishes one sample; on failure it goes back to the queue head for retry
    pub async fn publish(&mut self, item: QueuedSample) -> Result<(), PublisherError> {
        match self.send(&item).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.retry_later(item);
                Err(PublisherError::PublishError {
                    cause: e.to_string(),
                })
            }
        }
    }

    /// Best-effort close; transport errors are only logged
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            debug!("Already disconnected");
            return;
        }

        info!("Disconnecting from broker");
        if let Err(cause) = self.close_transport().await {
            warn!("Error while disconnecting from broker: {}", cause);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Closes the transport, bounded by the connect timeout
    async fn close_transport(&mut self) -> Result<(), String> {
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.disconnect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("disconnect timed out after {:?}", timeout)),
        }
    }

    /// Drain loop: connects, then moves queued samples to the broker until cancelled
    ///
    /// # Errors
    ///
    /// Only [`PublisherError::FatalConnectionFailure`]; every other failure is retried.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PublisherError> {
        info!(
            "Starting drain loop for session {}",
            self.identity.client_id()
        );

        let result = self.drain(&cancel).await;
        if result.is_ok() {
            self.disconnect().await;
            info!("Drain loop stopped");
        }
        result
    }

    async fn drain(&mut self, cancel: &CancellationToken) -> Result<(), PublisherError> {
        if let Step::Cancelled = self.establish(cancel).await? {
            return Ok(());
        }

        let batch_size = self.settings.batch_size;
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                batch = self.queue.recv_batch(batch_size) => batch,
            };
            debug!("Drained batch of {} samples", batch.len());

            let mut in_flight = InFlight {
                items: batch.into(),
                status: self.status.clone(),
            };
            while let Some(item) = in_flight.items.front().copied() {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = self.send(&item) => sent,
                };
                in_flight.items.pop_front();

                if let Err(e) = sent {
                    let err = PublisherError::PublishError {
                        cause: e.to_string(),
                    };
                    warn!("{}", err);
                    self.status.record_error(&err);

                    let rest: Vec<QueuedSample> = in_flight.items.drain(..).collect();
                    self.requeue_untouched(rest);
                    self.retry_later(item);

                    self.set_state(ConnectionState::Connecting);
                    match self.recover(cancel).await? {
                        Step::Ready => break,
                        Step::Cancelled => return Ok(()),
                    }
                }
            }
        }
    }

    async fn send(&mut self, item: &QueuedSample) -> Result<(), TransportError> {
        let line = payload::encode(&self.student_id, &item.sample);
        debug!("Publishing to {}: {}", self.identity.topic(), line);

        self.transport
            .publish(self.identity.topic(), line.into_bytes())
            .await?;

        self.consecutive_failures = 0;
        self.status.record_sent();
        Ok(())
    }

    fn retry_later(&self, mut item: QueuedSample) {
        item.attempts += 1;
        if item.attempts > self.settings.max_publish_retries {
            warn!(
                "Dropping sample from {} after {} failed attempts",
                item.sample.timestamp_ms(),
                item.attempts
            );
            self.status.record_lost(1);
            return;
        }
        if self.queue.requeue_front(item).is_some() {
            warn!("Publish queue full, dropping sample instead of retrying it");
            self.status.record_lost(1);
        }
    }

    /// Puts never-attempted batch items back ahead of newer samples, keeping order
    fn requeue_untouched(&self, rest: Vec<QueuedSample>) {
        let lost = rest
            .into_iter()
            .rev()
            .filter_map(|item| self.queue.requeue_front(item))
            .count();
        self.status.record_lost(lost as u64);
    }

    async fn establish(&mut self, cancel: &CancellationToken) -> Result<Step, PublisherError> {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Cancelled),
            connected = self.connect() => connected,
        };

        match connected {
            Ok(()) => Ok(Step::Ready),
            Err(err) => {
                self.status.record_error(&err);
                self.recover(cancel).await
            }
        }
    }

    /// Reconnects with backoff until connected, cancelled or out of attempts
    async fn recover(&mut self, cancel: &CancellationToken) -> Result<Step, PublisherError> {
        loop {
            self.consecutive_failures += 1;
            let attempt = self.consecutive_failures;
            if attempt > self.settings.max_reconnect_attempts {
                return Err(self.halt().await);
            }

            let delay = self.settings.backoff.delay(attempt);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, self.settings.max_reconnect_attempts
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                connected = self.connect() => connected,
            };
            match connected {
                Ok(()) => return Ok(Step::Ready),
                Err(err) => self.status.record_error(&err),
            }
        }
    }

    async fn halt(&mut self) -> PublisherError {
        let err = PublisherError::FatalConnectionFailure {
            attempts: self.settings.max_reconnect_attempts,
        };
        error!("{}", err);

        if let Err(cause) = self.close_transport().await {
            debug!("Ignoring disconnect error after fatal failure: {}", cause);
        }
        self.set_state(ConnectionState::Disconnected);
        self.status.record_error(&err);

        if let Some(handler) = &self.on_fatal {
            handler(&err);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerSettings;
    use crate::queue::OverflowPolicy;
    use crate::status::StatusBoard;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Script {
        connect_failures: u32,
        publish_failures: u32,
        hang_publish: bool,
        hang_disconnect: bool,
        connects: Vec<Instant>,
        published: Vec<String>,
    }

    struct ScriptedTransport(Arc<Mutex<Script>>);

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self, _identity: &SessionIdentity) -> Result<(), TransportError> {
            let mut script = self.0.lock().unwrap();
            script.connects.push(Instant::now());
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(TransportError::Refused("scripted".to_string()));
            }
            Ok(())
        }

        async fn publish(&mut self, _topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            let hang = self.0.lock().unwrap().hang_publish;
            if hang {
                std::future::pending::<()>().await;
            }
            let mut script = self.0.lock().unwrap();
            if script.publish_failures > 0 {
                script.publish_failures -= 1;
                return Err(TransportError::Lost("scripted".to_string()));
            }
            script
                .published
                .push(String::from_utf8(payload).unwrap());
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            let hang = self.0.lock().unwrap().hang_disconnect;
            if hang {
                std::future::pending::<()>().await;
            }
            Err(TransportError::NotConnected)
        }
    }

    struct Harness {
        script: Arc<Mutex<Script>>,
        queue: Arc<PublishQueue<QueuedSample>>,
        board: StatusBoard,
        connection: BrokerConnection,
    }

    fn harness(script: Script, settings: ConnectionSettings) -> Harness {
        let script = Arc::new(Mutex::new(script));
        let queue = Arc::new(PublishQueue::new(
            8,
            OverflowPolicy::DropOldest,
            Duration::from_secs(1),
        ));
        let board = StatusBoard::new();
        let identity = SessionIdentity::for_session(&BrokerSettings::default());
        let connection = BrokerConnection::new(
            Box::new(ScriptedTransport(script.clone())),
            identity.clone(),
            "student".to_string(),
            settings,
            queue.clone(),
            board.begin_session(identity.client_id()),
        );
        Harness {
            script,
            queue,
            board,
            connection,
        }
    }

    fn settings(max_reconnect_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            max_reconnect_attempts,
            max_publish_retries: 10,
            ..ConnectionSettings::default()
        }
    }

    fn sample(ts: i64) -> QueuedSample {
        LocationSample::new(ts, 1.0, 2.0, 10.0).into()
    }

    fn gaps(connects: &[Instant]) -> Vec<Duration> {
        connects.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test]
    async fn connect_and_disconnect_walk_the_state_machine() {
        let mut h = harness(Script::default(), settings(3));
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);

        h.connection.connect().await.unwrap();
        assert_eq!(h.connection.state(), ConnectionState::Connected);
        assert_eq!(h.board.snapshot().connection_state, ConnectionState::Connected);

        // Transport errors on disconnect are swallowed
        h.connection.disconnect().await;
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connect_enters_failed() {
        let mut h = harness(
            Script {
                connect_failures: 1,
                ..Script::default()
            },
            settings(3),
        );
        let err = h.connection.connect().await.unwrap_err();
        assert!(matches!(err, PublisherError::ConnectError { .. }));
        assert_eq!(h.connection.state(), ConnectionState::Failed);

        h.connection.disconnect().await;
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_publish_requeues_sample() {
        let mut h = harness(
            Script {
                publish_failures: 1,
                ..Script::default()
            },
            settings(3),
        );
        h.connection.connect().await.unwrap();

        let err = h.connection.publish(sample(1)).await.unwrap_err();
        assert!(matches!(err, PublisherError::PublishError { .. }));
        let retried = h.queue.try_dequeue().unwrap();
        assert_eq!(retried.attempts, 1);

        h.connection.publish(retried).await.unwrap();
        assert_eq!(h.board.snapshot().samples_sent, 1);
        assert_eq!(h.script.lock().unwrap().published.len(), 1);
    }

    #[tokio::test]
    async fn sample_is_dropped_after_max_retries() {
        let mut h = harness(
            Script {
                publish_failures: 10,
                ..Script::default()
            },
            ConnectionSettings {
                max_publish_retries: 1,
                ..ConnectionSettings::default()
            },
        );
        h.connection.connect().await.unwrap();

        let _ = h.connection.publish(sample(1)).await;
        let retried = h.queue.try_dequeue().unwrap();
        let _ = h.connection.publish(retried).await;

        assert!(h.queue.is_empty());
        assert_eq!(h.board.snapshot().samples_lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failures_back_off_with_growing_delays() {
        let h = harness(
            Script {
                publish_failures: 3,
                ..Script::default()
            },
            settings(3),
        );
        h.queue.enqueue(sample(1)).await.unwrap();
        h.queue.enqueue(sample(2)).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.connection.run(cancel.clone()));

        for _ in 0..100 {
            if h.script.lock().unwrap().published.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let script = h.script.lock().unwrap();
        assert_eq!(script.connects.len(), 4);
        assert_eq!(
            gaps(&script.connects),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(script.published[0], "student|36.00|1|1.000000|2.000000");
        assert_eq!(script.published[1], "student|36.00|2|1.000000|2.000000");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_are_fatal() {
        let h = harness(
            Script {
                publish_failures: u32::MAX,
                ..Script::default()
            },
            settings(3),
        );
        h.queue.enqueue(sample(1)).await.unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let connection = {
            let fired = fired.clone();
            h.connection
                .on_fatal(move |_| fired.store(true, Ordering::SeqCst))
        };

        let result = connection.run(CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(PublisherError::FatalConnectionFailure { attempts: 3 })
        );
        assert!(fired.load(Ordering::SeqCst));

        let status = h.board.snapshot();
        assert_eq!(status.connection_state, ConnectionState::Disconnected);
        assert_eq!(
            status.last_error,
            Some(PublisherError::FatalConnectionFailure { attempts: 3 })
        );

        let script = h.script.lock().unwrap();
        let delays = gaps(&script.connects);
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_disconnect_does_not_block_fatal_handler() {
        let h = harness(
            Script {
                connect_failures: u32::MAX,
                hang_disconnect: true,
                ..Script::default()
            },
            settings(1),
        );
        let fired = Arc::new(AtomicBool::new(false));
        let connection = {
            let fired = fired.clone();
            h.connection
                .on_fatal(move |_| fired.store(true, Ordering::SeqCst))
        };

        let result = tokio::time::timeout(
            Duration::from_secs(60),
            connection.run(CancellationToken::new()),
        )
        .await
        .expect("fatal path must not wait on the transport");
        assert!(matches!(
            result,
            Err(PublisherError::FatalConnectionFailure { attempts: 1 })
        ));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(
            h.board.snapshot().connection_state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_batch_is_counted_lost() {
        let h = harness(
            Script {
                hang_publish: true,
                ..Script::default()
            },
            settings(3),
        );
        for ts in 1..=3 {
            h.queue.enqueue(sample(ts)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.connection.run(cancel.clone()));
        for _ in 0..100 {
            if h.queue.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let status = h.board.snapshot();
        assert_eq!(status.samples_sent, 0);
        assert_eq!(status.samples_lost, 3);
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_is_fatal_after_retries() {
        let h = harness(
            Script {
                connect_failures: u32::MAX,
                ..Script::default()
            },
            settings(2),
        );
        let result = h.connection.run(CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(PublisherError::FatalConnectionFailure { .. })
        ));
        assert_eq!(h.script.lock().unwrap().connects.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let h = harness(
            Script {
                connect_failures: u32::MAX,
                ..Script::default()
            },
            ConnectionSettings {
                backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
                ..settings(5)
            },
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.connection.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = Instant::now();
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
