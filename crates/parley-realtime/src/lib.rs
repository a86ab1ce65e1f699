//! Real-time channel: Socket.IO (Engine.IO v4) over a WebSocket, decoded into
//! [`RealtimeEvent`]s and fed by [`RealtimeCommand`]s.
//!
//! [`RealtimeEvent`]: parley_types::events::RealtimeEvent
//! [`RealtimeCommand`]: parley_types::events::RealtimeCommand

pub mod channel;
pub mod codec;
pub mod error;

pub use channel::{ChannelConfig, ChannelStatus, RealtimeChannel, TokenSource};
pub use codec::Packet;
pub use error::RealtimeError;
