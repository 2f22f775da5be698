//! Herd fleet console.
//!
//! Watches `global/IFF`, keeps a TTL-based liveness table of every device it
//! has ever heard from, and lets an operator publish commands to any scope.

pub mod fleet;
pub mod http;
pub mod prompt;
pub mod render;

pub use fleet::{FleetAggregator, FleetEntry, FleetTable};
pub use render::render_table;
