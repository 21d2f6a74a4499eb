pub mod amount;
pub mod clock;
pub mod crypto;

pub use clock::{Clock, FixedClock, SystemClock};
