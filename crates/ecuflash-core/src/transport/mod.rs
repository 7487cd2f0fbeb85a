//! Transport layer module.

pub mod frame;
pub mod isotp;
pub mod mock;
pub mod sim;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
pub mod traits;

pub use frame::CanFrame;
pub use isotp::{IsoTpChannel, IsoTpConfig};
pub use mock::MockBus;
pub use sim::SimulatedBus;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use socketcan::SocketCanBus;
pub use traits::{CanBus, TransportError};
