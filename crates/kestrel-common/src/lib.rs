pub mod device;
pub mod error;
pub mod mac;
pub mod topology;

pub use device::*;
pub use error::Error;
pub use mac::Mac;
pub use topology::{PortRef, TopologyEdge};

pub type Result<T> = std::result::Result<T, Error>;

/// Image tag every node boots until someone deploys something else.
pub const DEFAULT_IMAGE: &str = "default";
