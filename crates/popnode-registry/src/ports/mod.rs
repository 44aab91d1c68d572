//! # Ports Layer
//!
//! Inbound: what the registry offers to the session layer and to
//! consensus collaborators. Outbound: what the host must provide.

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
