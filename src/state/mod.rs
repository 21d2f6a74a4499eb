pub mod channel;
pub mod registry;

pub use channel::{ChannelBook, SettlementStatus, TrackedChannel};
pub use registry::{ClientRegistry, SharedClient};
