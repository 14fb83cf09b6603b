use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::payload::DEFAULT_TOPIC;

/// Broker endpoint and connection options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Generated per session when absent
    pub client_id: Option<String>,
    pub topic: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            topic: DEFAULT_TOPIC.to_string(),
            connect_timeout_ms: 10_000,
            keep_alive_secs: 5,
            username: None,
            password: None,
        }
    }
}

impl BrokerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pw)) => Some((user.clone(), pw.clone())),
            (Some(user), None) => Some((user.clone(), String::new())),
            _ => None,
        }
    }
}

/// Client identifier and endpoint for one publishing session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    client_id: String,
    host: String,
    port: u16,
    topic: String,
}

impl SessionIdentity {
    /// Builds the identity for a new session, generating a client id if none is configured
    pub fn for_session(settings: &BrokerSettings) -> Self {
        let client_id = settings
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_client_id);

        Self {
            client_id,
            host: settings.host.clone(),
            port: settings.port,
            topic: settings.topic.clone(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

pub fn generate_client_id() -> String {
    format!("geopublisher-{}", Uuid::new_v4())
}
