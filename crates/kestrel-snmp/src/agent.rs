//! Switch capability trait

use crate::error::Result;
use crate::types::{Neighbor, SwitchTarget};

/// What the orchestrator needs from a managed switch.
///
/// Calls block the current thread. Implementations must not keep per-call
/// state that would make concurrent calls on different switches interfere.
pub trait SwitchAgent: Send + Sync {
    /// Read the LLDP remote table
    fn neighbors(&self, switch: &SwitchTarget) -> Result<Vec<Neighbor>>;

    /// Enable or disable PoE on a port.
    ///
    /// Returns `true` if the switch accepted the change.
    fn set_port_power(&self, switch: &SwitchTarget, port: u32, on: bool) -> Result<bool>;

    /// Current PoE admin state of a port, `None` if the switch cannot tell
    fn port_power(&self, switch: &SwitchTarget, port: u32) -> Result<Option<bool>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SnmpError;
    use kestrel_common::Mac;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    // Mock switch for testing
    struct MockSwitch {
        ports: Mutex<HashMap<u32, bool>>,
    }

    impl SwitchAgent for MockSwitch {
        fn neighbors(&self, _switch: &SwitchTarget) -> Result<Vec<Neighbor>> {
            let mac: Mac = "00:00:00:00:00:aa".parse().unwrap();
            Ok(vec![Neighbor::new(1, mac)])
        }

        fn set_port_power(&self, _switch: &SwitchTarget, port: u32, on: bool) -> Result<bool> {
            self.ports.lock().unwrap().insert(port, on);
            Ok(true)
        }

        fn port_power(&self, switch: &SwitchTarget, port: u32) -> Result<Option<bool>> {
            match self.ports.lock().unwrap().get(&port) {
                Some(state) => Ok(Some(*state)),
                None => Err(SnmpError::Unsupported(switch.ip, format!("port {}", port))),
            }
        }
    }

    fn target() -> SwitchTarget {
        SwitchTarget::new("00:00:00:00:00:01".parse().unwrap(), Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn test_mock_port_power() {
        let switch = MockSwitch {
            ports: Mutex::new(HashMap::from([(1, true)])),
        };

        assert_eq!(switch.port_power(&target(), 1).unwrap(), Some(true));
        assert!(switch.set_port_power(&target(), 1, false).unwrap());
        assert_eq!(switch.port_power(&target(), 1).unwrap(), Some(false));
        assert!(switch.port_power(&target(), 9).is_err());
    }

    #[test]
    fn test_trait_object() {
        let switch: Box<dyn SwitchAgent> = Box::new(MockSwitch {
            ports: Mutex::new(HashMap::new()),
        });
        assert_eq!(switch.neighbors(&target()).unwrap().len(), 1);
    }
}
