//! Durable state: a key/value store abstraction with TTL, the credential set
//! and the auth-state persistence layered on top of it.

mod auth_state;
mod credentials;
mod file;
mod keys;
mod memory;
mod traits;

pub use auth_state::*;
pub use credentials::*;
pub use file::*;
pub use keys::*;
pub use memory::*;
pub use traits::*;
