//! Herd device kernel.
//!
//! Supervises the long-running workers of an edge device (capture, streaming,
//! recording, heartbeat, command listener, status API), routes remote commands
//! to handlers and announces the device to the fleet over a pub/sub bus.
//!
//! ```text
//!  fleet ──{scope}/COMMAND──▶ CommandListener ──put_command──▶ inbox ──▶ Device::run
//!                                                                          │
//!  fleet ◀──global/IFF──── IffPublisher                          handlers start/stop workers
//!  host  ◀──local/health── LocalHealthPublisher (loopback only)
//! ```

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod logging;
pub mod profiles;
pub mod protocol;
pub mod services;
pub mod signals;
pub mod worker;

pub use bus::{Bus, MemoryBus, MqttBus, SharedBus};
pub use device::{Device, DeviceBuilder, DeviceEvent, DeviceHandle, DeviceState};
pub use error::{BusError, DeviceError, StoreError, WorkerError};
pub use profiles::{CameraProfile, DeviceProfile, MasterProfile};
pub use worker::{Health, Worker, WorkerContext, WorkerHandle};
