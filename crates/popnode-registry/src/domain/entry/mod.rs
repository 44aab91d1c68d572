//! # Registry Entries
//!
//! A [`NodeEntry`] is created from the first accepted [`Announcement`] for
//! an identity and kept alive by [`Ping`]s. Its [`PopnodeState`] is always
//! re-derived by [`NodeEntry::check`], never set directly by gossip.

mod announcement;
mod node;
mod ping;
mod state;

pub use announcement::Announcement;
pub use node::{CheckContext, NodeEntry};
pub use ping::Ping;
pub use state::PopnodeState;

#[cfg(test)]
mod tests;
