//! Core types shared by the connector modules: connection status, the
//! session record, published events and network addresses.

mod events;
mod jid;
mod status;

pub use events::*;
pub use jid::*;
pub use status::*;
