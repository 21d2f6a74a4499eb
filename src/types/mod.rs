pub mod asset;
pub mod channel;
pub mod error;
pub mod rpc;

pub use asset::Asset;
pub use channel::{Allocation, Channel, ChannelState, Intent};
pub use error::{ClientError, VerifyError};
