//! Stateful managers for the Dropline runtime
//!
//! Each manager owns one slice of driver state. None of them spawns tasks;
//! the driver in `tasks` calls into them from its select loop.

pub mod connection;
pub mod delivery;
pub mod reconnection;

pub use connection::{compose_status_text, ConnectionManager, ConnectionStats};
pub use delivery::{create_shared_timeline, DeliveryManager, DeliveryStats, SharedTimeline};
pub use reconnection::{RecoveryManager, RecoveryStats, RecoveryStep};
