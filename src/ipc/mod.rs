//! Message channels layered on top of the loop, including synchronous
//! request/reply channels with nested dispatch.
//!
//! Two threads matter for every channel: the *listener thread* (a loop
//! thread that owns the [`SyncChannel`] and receives messages) and the *I/O
//! thread* (a loop thread, usually a dedicated [`Thread`], that moves
//! messages on and off the transport). They must be distinct, or a blocking
//! send could never make progress.
//!
//! The interesting part is [`SyncChannel::send`] with a sync message: the
//! caller blocks for the reply, but inbound *synchronous* messages keep
//! being dispatched so that the two sides can call back into each other
//! without deadlocking. See the [`sync_channel`] docs for the mechanism.
//!
//! [`Thread`]: crate::Thread
//! [`SyncChannel::send`]: SyncChannel::send

pub mod channel;
pub mod message;
pub mod sync_channel;
pub mod sync_filter;
pub mod sync_message;

pub use self::channel::{Channel, ChannelHandle, Mode};
pub use self::message::Message;
pub use self::sync_channel::{MessageFilter, MessageSender, SyncChannel};
pub use self::sync_filter::SyncMessageFilter;
pub use self::sync_message::{ReplyDeserializer, SyncMessage};

/// Receives a channel's inbound messages on the listener thread.
///
/// Implementations are shared with the channel machinery (`Arc`), so state
/// lives behind interior mutability; all callbacks arrive on the listener
/// thread.
pub trait Listener: Send + Sync {
    /// Handles a message. Returns whether it was handled (currently
    /// informational).
    fn on_message_received(&self, message: &Message) -> bool;

    /// The channel found its peer; `peer_id` identifies the remote endpoint.
    fn on_channel_connected(&self, _peer_id: i32) {}

    /// The channel broke (peer closed or the transport failed).
    fn on_channel_error(&self) {}
}
