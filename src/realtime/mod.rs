//! Inbound server-pushed updates
//!
//! [`RealtimeChannel`] receives [`RealtimeEvent`]s over the first transport
//! that connects, failing over and backing off as [`state::transition`]
//! dictates.

pub mod channel;
pub mod event;
pub mod state;
pub mod transport;

pub use channel::{EventHandler, RealtimeChannel};
pub use event::{parse_message, subscribe_message, EventKind, RealtimeEvent};
pub use state::{ChannelAction, ChannelInput, ChannelState, ReconnectPolicy};
pub use transport::{build_transports, LocalNotifier, Transport};
