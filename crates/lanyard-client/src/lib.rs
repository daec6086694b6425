//! Client side of the lanyard socket protocol: one multiplexed WebSocket
//! carrying topic-scoped channels with ref-correlated push/reply.

pub mod channel;
pub mod socket;

pub use channel::{Channel, ChannelError, ChannelState, HandlerId};
pub use socket::{Socket, SocketOptions, SocketStatus};
