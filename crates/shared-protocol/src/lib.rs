//! Shared Protocol Definitions for CareLink
//!
//! Wire messages, identifiers and session states shared between the
//! crypto core and the relay server.

mod error;
mod messages;
mod session;

pub use error::*;
pub use messages::*;
pub use session::*;

/// Generator used for every Diffie-Hellman session
pub const DH_GENERATOR: u32 = 2;

/// Default bit length of the per-session DH modulus
pub const DEFAULT_DH_PRIME_BITS: usize = 2048;

/// Maximum accepted size of a single text frame
pub const MAX_FRAME_SIZE: usize = 256 * 1024;
