//! Uniform connector contract
//!
//! Every source implements [`CdcConnector`]. Streams are lazy and unbounded,
//! and every failure shows up as an `Err` item: a stream only ends on
//! shutdown, on a failure class that is terminal for that source (see
//! [`CdcError::is_terminal_for`]), or when the source itself closes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::CdcError;
use crate::event::ChangeEvent;
use crate::position::CdcPosition;

/// Item type of a change stream
pub type ChangeResult = std::result::Result<ChangeEvent, CdcError>;

/// Change stream borrowed from its connector for the duration of one call
pub type ChangeStream<'a> = BoxStream<'a, ChangeResult>;

/// Provider tag of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Kafka,
    MongoDb,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Kafka => "kafka",
            ConnectorKind::MongoDb => "mongodb",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-effect-free connectivity and position probe
///
/// Used by health checks. Implementations bound their own network calls and
/// never touch stream state.
#[async_trait]
pub trait PositionProbe: Send + Sync {
    /// Stable id, the only key into the position store
    fn connector_id(&self) -> &str;

    fn kind(&self) -> ConnectorKind;

    /// Verify connectivity and return the last saved position, or the source's
    /// sentinel position when nothing has been saved yet
    async fn get_current_position(&self) -> Result<CdcPosition, CdcError>;
}

/// A change data capture source
///
/// `stream_changes` borrows the connector mutably, so one instance has at most
/// one reader. Health checks go through [`CdcConnector::probe`] instead, which
/// shares the connector's client without touching the stream.
pub trait CdcConnector: PositionProbe {
    fn stream_changes(&mut self, shutdown: Shutdown) -> ChangeStream<'_>;

    fn probe(&self) -> Arc<dyn PositionProbe>;
}

/// Observable connector lifecycle state
///
/// Cloned handles share the same cell. Never held across an await.
#[derive(Debug, Clone, Default)]
pub struct StateCell<S>(Arc<Mutex<S>>);

impl<S: Copy + PartialEq> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> S {
        *self.0.lock()
    }

    pub fn set(&self, state: S) {
        *self.0.lock() = state;
    }

    /// Move to `to` only if the current state is one of `from`
    pub fn transition(&self, from: &[S], to: S) -> bool {
        let mut state = self.0.lock();
        if from.contains(&state) {
            *state = to;
            true
        } else {
            false
        }
    }
}

/// Cooperative cancellation signal for change streams
///
/// Wraps a `watch::Receiver<bool>`; sending `true` ends the stream without an
/// error item. Dropping the sender without sending `true` never cancels.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(rx)
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // sender dropped without signalling
                if *self.rx.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}

impl From<watch::Receiver<bool>> for Shutdown {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self::new(rx)
    }
}
