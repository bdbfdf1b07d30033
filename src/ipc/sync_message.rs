//! Framing for synchronous messages: a request id ahead of the payload, and
//! the deserializer that turns the reply payload into output parameters.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use crate::event::WaitableEvent;
use crate::ipc::message::{Message, REPLY_MESSAGE_TYPE};

/// Bytes of sync framing ahead of the user payload: the request id.
const SYNC_HEADER_SIZE: usize = 4;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Deserializes the payload of a reply into the sender's output parameters.
///
/// Returns false to reject the payload, which surfaces as a failed send;
/// the payload's contents are not otherwise exposed to the sender. Plain
/// `FnMut(&[u8]) -> bool` closures implement this.
pub trait ReplyDeserializer: Send {
    fn deserialize_reply(&mut self, payload: &[u8]) -> bool;
}

impl<F: FnMut(&[u8]) -> bool + Send> ReplyDeserializer for F {
    fn deserialize_reply(&mut self, payload: &[u8]) -> bool {
        self(payload)
    }
}

/// A synchronous request message.
///
/// Construction assigns a process-unique request id and stamps it into the
/// message, sets the sync and unblock bits, and attaches the deserializer
/// that will run on the reply. Derefs to [`Message`] for payload writing;
/// send it with [`SyncChannel::send`] via `Into<Message>`.
///
/// [`SyncChannel::send`]: crate::ipc::SyncChannel::send
pub struct SyncMessage {
    message: Message,
}

impl SyncMessage {
    pub fn new(
        routing_id: i32,
        msg_type: u32,
        deserializer: Box<dyn ReplyDeserializer>,
    ) -> SyncMessage {
        let mut message = Message::new(routing_id, msg_type);
        message.set_sync();
        message.set_unblock(true);
        message.deserializer = Some(deserializer);

        // The sync framing goes ahead of any user payload.
        debug_assert!(message.payload().is_empty());
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        message.write_bytes(&id.to_le_bytes());

        SyncMessage { message }
    }

    /// Asks the send path to run a nested run loop (with nestable tasks
    /// allowed) while blocked on this message's reply, instead of a plain
    /// blocking wait. Use when the receiver may take long enough that this
    /// thread's own tasks must keep flowing.
    pub fn enable_message_pumping(&mut self) {
        self.message.set_pumping_messages();
    }

    /// The request id of a sync message or reply; 0 for other messages.
    pub fn message_id(message: &Message) -> i32 {
        if !message.is_sync() && !message.is_reply() {
            return 0;
        }
        read_sync_header(message).unwrap_or(0)
    }

    /// True iff `message` is the reply to the request with `request_id`.
    pub fn is_reply_to(message: &Message, request_id: i32) -> bool {
        message.is_reply() && Self::message_id(message) == request_id
    }

    /// Builds the reply to a sync request, carrying the same request id.
    /// The receiver fills in the payload (after the framing) and sends it
    /// back as an ordinary message.
    pub fn generate_reply(message: &Message) -> Message {
        debug_assert!(message.is_sync());
        let mut reply = Message::new(message.routing_id(), REPLY_MESSAGE_TYPE);
        reply.set_reply();
        let id = Self::message_id(message);
        reply.write_bytes(&id.to_le_bytes());
        reply
    }

    /// The payload of a sync message or reply, past the framing.
    pub fn data(message: &Message) -> &[u8] {
        message.payload().get(SYNC_HEADER_SIZE..).unwrap_or(&[])
    }
}

impl Deref for SyncMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for SyncMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl From<SyncMessage> for Message {
    fn from(sync: SyncMessage) -> Message {
        sync.message
    }
}

fn read_sync_header(message: &Message) -> Option<i32> {
    let bytes = message.payload().get(..SYNC_HEADER_SIZE)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

/// A process-wide, permanently signaled event. Waiting on it alongside the
/// real wake sources makes the pump-messages branch of a blocking send fire
/// immediately, without a dedicated signaling side.
pub(crate) fn pump_messages_event() -> &'static WaitableEvent {
    static EVENT: OnceLock<WaitableEvent> = OnceLock::new();
    EVENT.get_or_init(|| WaitableEvent::new(true, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_deserializer() -> Box<dyn ReplyDeserializer> {
        Box::new(|_: &[u8]| true)
    }

    #[test]
    fn assigns_distinct_request_ids() {
        let a = SyncMessage::new(1, 10, noop_deserializer());
        let b = SyncMessage::new(1, 10, noop_deserializer());
        let a_id = SyncMessage::message_id(&a);
        let b_id = SyncMessage::message_id(&b);
        assert_ne!(a_id, 0);
        assert_ne!(a_id, b_id);
    }

    #[test]
    fn reply_carries_the_request_id() {
        let request = SyncMessage::new(7, 10, noop_deserializer());
        let id = SyncMessage::message_id(&request);

        let reply = SyncMessage::generate_reply(&request);
        assert!(reply.is_reply());
        assert_eq!(reply.routing_id(), 7);
        assert!(SyncMessage::is_reply_to(&reply, id));
    }

    #[test]
    fn data_skips_the_framing() {
        let mut request = SyncMessage::new(1, 10, noop_deserializer());
        request.write_bytes(b"abc");
        assert_eq!(SyncMessage::data(&request), b"abc");
    }

    #[test]
    fn non_sync_messages_have_no_id() {
        let message = Message::new(1, 10);
        assert_eq!(SyncMessage::message_id(&message), 0);
    }
}
