pub mod handshake;
pub mod signer;

pub use handshake::{authenticate, AuthHandshake, AuthState, AuthStep};
pub use signer::{Eip712Signer, Policy, RequestSigner, SessionKey, SessionSigner, SignPayload};
