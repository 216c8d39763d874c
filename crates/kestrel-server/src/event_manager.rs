use kestrel_common::Mac;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Fleet changes, published after they are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    DeviceUpdated(Mac),
    DeviceForgotten(Mac),
    BindingChanged(Mac),
    TopologyChanged,
    DhcpApplied { hosts: usize },
}

impl fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetEvent::DeviceUpdated(mac) => write!(f, "device_updated:{}", mac),
            FleetEvent::DeviceForgotten(mac) => write!(f, "device_forgotten:{}", mac),
            FleetEvent::BindingChanged(mac) => write!(f, "binding_changed:{}", mac),
            FleetEvent::TopologyChanged => f.write_str("topology_changed"),
            FleetEvent::DhcpApplied { hosts } => write!(f, "dhcp_applied:{}", hosts),
        }
    }
}

// Fan-out of fleet events to whoever listens (sessions, watchers)
#[derive(Clone)]
pub struct EventManager {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; returns how many got it
    pub fn send(&self, event: FleetEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            // No subscriber is the normal case for a headless server
            Err(broadcast::error::SendError(event)) => {
                debug!(%event, "no event subscribers");
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}
