// Communication and hardware drivers
//
// Bus access, the telemetry and SDO layers built on it, and the hardware
// seams the measurement tasks talk to.

/// CAN bus communication driver
/// SocketCAN socket plus the `BusDriver`/`FrameHandler` traits
pub mod can;

/// Bit-packed PDO telemetry map
pub mod canmap;

/// Expedited SDO client and server
pub mod sdo;

/// Hardware collaborator traits and simulated implementations
pub mod hal;

/// In-process bus used for bench runs and tests
pub mod virtual_bus;

pub use can::{BusDriver, CanDriver, CanError, FrameHandler};
pub use canmap::CanMap;
pub use virtual_bus::{VirtualBus, VirtualPort};
