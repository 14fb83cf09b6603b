//! Observable publisher status
//!
//! The [`StatusBoard`] is the single source of truth the UI layer reads. It wraps a
//! `watch` channel so callers can either poll a snapshot or await changes.
//!
//! Every session writes through a [`SessionStatus`] stamped with the session
//! generation. Writes from a session that has already been replaced are ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tracing::debug;

use crate::error::PublisherError;
use crate::mqtt::ConnectionState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublisherState {
    #[default]
    Idle,
    Publishing,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublisherStatus {
    pub state: PublisherState,
    pub connection_state: ConnectionState,
    pub last_error: Option<PublisherError>,
    pub client_id: Option<String>,
    pub samples_received: u64,
    pub samples_sent: u64,
    pub samples_lost: u64,
    pub last_activity: Option<DateTime<Local>>,
}

struct Board {
    tx: watch::Sender<PublisherStatus>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct StatusBoard {
    board: Arc<Board>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PublisherStatus::default());
        Self {
            board: Arc::new(Board {
                tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> PublisherStatus {
        self.board.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublisherStatus> {
        self.board.tx.subscribe()
    }

    /// Resets counters for a new session and returns its writer
    pub fn begin_session(&self, client_id: &str) -> SessionStatus {
        let generation = self.board.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Beginning status session {} for {}", generation, client_id);
        self.board.tx.send_modify(|status| {
            *status = PublisherStatus {
                client_id: Some(client_id.to_string()),
                last_activity: Some(Local::now()),
                ..PublisherStatus::default()
            };
        });
        SessionStatus {
            board: self.board.clone(),
            generation,
        }
    }

    /// Records an error raised outside any running session
    pub fn record_error(&self, err: &PublisherError) {
        let err = err.clone();
        self.board.tx.send_modify(|status| {
            status.last_error = Some(err);
            status.last_activity = Some(Local::now());
        });
    }
}

/// Status writer bound to one session
#[derive(Clone)]
pub struct SessionStatus {
    board: Arc<Board>,
    generation: u64,
}

impl SessionStatus {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.board.generation.load(Ordering::Acquire) == self.generation
    }

    pub fn set_state(&self, state: PublisherState) {
        self.update(|status| status.state = state);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.update(|status| status.connection_state = state);
    }

    pub fn record_received(&self) {
        self.update(|status| status.samples_received += 1);
    }

    pub fn record_sent(&self) {
        self.update(|status| status.samples_sent += 1);
    }

    pub fn record_lost(&self, count: u64) {
        if count > 0 {
            self.update(|status| status.samples_lost += count);
        }
    }

    pub fn record_error(&self, err: &PublisherError) {
        let err = err.clone();
        self.update(move |status| status.last_error = Some(err));
    }

    fn update(&self, apply: impl FnOnce(&mut PublisherStatus)) {
        let generation = self.generation;
        let board = &self.board;
        board.tx.send_if_modified(|status| {
            if board.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            apply(status);
            status.last_activity = Some(Local::now());
            true
        });
    }
}
