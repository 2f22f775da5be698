//! Workers every device runs regardless of its profile.

mod heartbeat;
mod listener;
mod status_api;

pub use heartbeat::{IffPublisher, LocalHealthPublisher, IFF_WORKER, LOCAL_HEALTH_WORKER};
pub use listener::{CommandListener, LISTENER_WORKER};
pub use status_api::{build_router, StatusApi, StatusView, STATUS_API_WORKER};
