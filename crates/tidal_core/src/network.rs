//! Observable connectivity signal.
//!
//! Platform code reports reachability through [`NetworkMonitor::set`]; the
//! monitor turns those reports into a current state plus a stream of
//! transitions.

use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tracing::info;

const EVENT_CAPACITY: usize = 64;

/// Current reachability of the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connectivity {
    /// The remote is reachable.
    Online,
    /// The remote is not reachable.
    Offline,
}

impl Connectivity {
    /// Returns true when online.
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityEvent {
    /// Went from offline to online.
    BecameOnline,
    /// Went from online to offline.
    BecameOffline,
}

/// Tracks connectivity and broadcasts transitions.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: watch::Sender<Connectivity>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl NetworkMonitor {
    /// Creates a monitor starting in `initial`.
    pub fn new(initial: Connectivity) -> Self {
        Self {
            state: watch::channel(initial).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    /// Returns the current connectivity.
    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Returns true when online.
    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Reports the current connectivity, returning the transition it caused.
    ///
    /// Repeating the current state emits nothing.
    pub fn set(&self, connectivity: Connectivity) -> Option<ConnectivityEvent> {
        let previous = self.state.send_replace(connectivity);
        if previous == connectivity {
            return None;
        }
        let event = match connectivity {
            Connectivity::Online => ConnectivityEvent::BecameOnline,
            Connectivity::Offline => ConnectivityEvent::BecameOffline,
        };
        info!(?event, "connectivity changed");
        // No subscribers is not an error.
        let _ = self.events.send(event);
        Some(event)
    }

    /// Reports that the remote is reachable.
    pub fn set_online(&self) -> Option<ConnectivityEvent> {
        self.set(Connectivity::Online)
    }

    /// Reports that the remote is unreachable.
    pub fn set_offline(&self) -> Option<ConnectivityEvent> {
        self.set(Connectivity::Offline)
    }

    /// Subscribes to transitions that happen after this call.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub fn observe(&self) -> impl Stream<Item = ConnectivityEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Subscribes to the connectivity state, starting with the current one.
    pub fn observe_state(&self) -> impl Stream<Item = Connectivity> + Send + 'static {
        WatchStream::new(self.state.subscribe())
    }

    /// Returns a receiver for waiting on state changes.
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}
