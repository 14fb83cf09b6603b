//! Transport boundary: connect, publish and disconnect on one MQTT session
//!
//! [`RumqttTransport`] drives a `rumqttc` event loop. The CONNACK is awaited inline so a
//! refused identifier surfaces from `connect()`; afterwards a poller task keeps the event
//! loop running and records the first connection error, which fails the next publish.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{BrokerSettings, SessionIdentity};

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("Connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    Lost(String),
}

/// Pub/sub transport library boundary
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, identity: &SessionIdentity) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Creates one transport per publishing session
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self) -> Box<dyn Transport> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    pub request_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keep_alive: MIN_KEEP_ALIVE,
            credentials: None,
            request_capacity: 10,
        }
    }
}

impl From<&BrokerSettings> for TransportOptions {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            keep_alive: settings.keep_alive(),
            credentials: settings.credentials(),
            ..Self::default()
        }
    }
}

struct LiveSession {
    client: AsyncClient,
    poller: JoinHandle<()>,
    failure: watch::Receiver<Option<String>>,
}

pub struct RumqttTransport {
    options: TransportOptions,
    session: Option<LiveSession>,
}

impl RumqttTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            session: None,
        }
    }

    pub fn factory(options: TransportOptions) -> impl TransportFactory {
        move || Box::new(RumqttTransport::new(options.clone())) as Box<dyn Transport>
    }

    fn mqtt_options(&self, identity: &SessionIdentity) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(identity.client_id(), identity.host(), identity.port());
        mqtt_options.set_keep_alive(self.options.keep_alive.max(MIN_KEEP_ALIVE));
        if let Some((user, pw)) = &self.options.credentials {
            mqtt_options.set_credentials(user.clone(), pw.clone());
        }
        mqtt_options
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.poller.abort();
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&mut self, identity: &SessionIdentity) -> Result<(), TransportError> {
        self.drop_session();

        let (client, mut eventloop) =
            AsyncClient::new(self.mqtt_options(identity), self.options.request_capacity);

        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(connack)) => {
                    if connack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(TransportError::Refused(format!("{:?}", connack.code)));
                }
                event => debug!("MQTT event while connecting: {:?}", event),
            }
        }
        info!(
            "MQTT session established with {}:{}",
            identity.host(),
            identity.port()
        );

        let (failure_tx, failure_rx) = watch::channel(None);
        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker closed the MQTT session");
                        let _ = failure_tx.send(Some("broker sent disconnect".to_string()));
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect flushed");
                        break;
                    }
                    Ok(event) => debug!("MQTT event: {:?}", event),
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        let _ = failure_tx.send(Some(e.to_string()));
                        break;
                    }
                }
            }
        });

        self.session = Some(LiveSession {
            client,
            poller,
            failure: failure_rx,
        });
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        let failure = session.failure.borrow().clone();
        if let Some(cause) = failure {
            return Err(TransportError::Lost(cause));
        }
        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let result = session.client.disconnect().await;
        if tokio::time::timeout(DISCONNECT_FLUSH, &mut session.poller)
            .await
            .is_err()
        {
            debug!("MQTT poller still running after disconnect, aborting it");
            session.poller.abort();
        }
        result.map_err(TransportError::from)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.drop_session();
    }
}
