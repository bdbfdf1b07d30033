//! The message value type moved across channels.

use std::fmt;

use crate::ipc::sync_message::ReplyDeserializer;

// Flag bits. The priority of a message lives in the low bits in the wire
// format this derives from; only the behavioral bits are kept here.
const SYNC_BIT: u32 = 1 << 2;
const REPLY_BIT: u32 = 1 << 3;
const REPLY_ERROR_BIT: u32 = 1 << 4;
const UNBLOCK_BIT: u32 = 1 << 5;
const PUMPING_MSGS_BIT: u32 = 1 << 6;

/// The message type reserved for replies to synchronous messages.
pub const REPLY_MESSAGE_TYPE: u32 = 0xFFFF_FFF0;

/// A routed, typed message with an opaque payload.
///
/// `routing_id` addresses an object behind the channel, `msg_type` tells the
/// receiver how to read the payload, and the flag bits carry the sync/reply
/// protocol. Messages for synchronous requests are built through
/// [`SyncMessage`], which frames a request id into the payload and attaches
/// the reply deserializer.
///
/// [`SyncMessage`]: crate::ipc::SyncMessage
pub struct Message {
    routing_id: i32,
    msg_type: u32,
    flags: u32,
    payload: Vec<u8>,
    /// Consumed by the send path before the message reaches the transport;
    /// never set on a received message.
    pub(crate) deserializer: Option<Box<dyn ReplyDeserializer>>,
}

impl Message {
    pub fn new(routing_id: i32, msg_type: u32) -> Message {
        Message {
            routing_id,
            msg_type,
            flags: 0,
            payload: Vec::new(),
            deserializer: None,
        }
    }

    pub fn routing_id(&self) -> i32 {
        self.routing_id
    }

    pub fn msg_type(&self) -> u32 {
        self.msg_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Appends bytes to the payload.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    /// True for a synchronous request expecting a reply.
    pub fn is_sync(&self) -> bool {
        self.flags & SYNC_BIT != 0
    }

    /// True for a reply to a synchronous request.
    pub fn is_reply(&self) -> bool {
        self.flags & REPLY_BIT != 0
    }

    /// True for a reply that reports failure instead of output parameters.
    pub fn is_reply_error(&self) -> bool {
        self.flags & REPLY_ERROR_BIT != 0
    }

    /// True when a blocked sender on the receiving side should dispatch this
    /// message rather than sit on it (the sender may need it to make
    /// progress).
    pub fn should_unblock(&self) -> bool {
        self.flags & UNBLOCK_BIT != 0
    }

    /// True when the sender asked to keep running a nested loop while
    /// blocked on this message's reply.
    pub fn should_pump_messages(&self) -> bool {
        self.flags & PUMPING_MSGS_BIT != 0
    }

    pub fn set_reply(&mut self) {
        self.flags |= REPLY_BIT;
    }

    pub fn set_reply_error(&mut self) {
        self.flags |= REPLY_ERROR_BIT;
    }

    pub fn set_unblock(&mut self, unblock: bool) {
        if unblock {
            self.flags |= UNBLOCK_BIT;
        } else {
            self.flags &= !UNBLOCK_BIT;
        }
    }

    pub(crate) fn set_sync(&mut self) {
        self.flags |= SYNC_BIT;
    }

    pub(crate) fn set_pumping_messages(&mut self) {
        self.flags |= PUMPING_MSGS_BIT;
    }

    pub(crate) fn take_deserializer(&mut self) -> Option<Box<dyn ReplyDeserializer>> {
        self.deserializer.take()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("routing_id", &self.routing_id)
            .field("msg_type", &self.msg_type)
            .field("sync", &self.is_sync())
            .field("reply", &self.is_reply())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let message = Message::new(1, 42);
        assert!(!message.is_sync());
        assert!(!message.is_reply());
        assert!(!message.is_reply_error());
        assert!(!message.should_unblock());
    }

    #[test]
    fn unblock_toggles() {
        let mut message = Message::new(1, 42);
        message.set_unblock(true);
        assert!(message.should_unblock());
        message.set_unblock(false);
        assert!(!message.should_unblock());
    }
}
