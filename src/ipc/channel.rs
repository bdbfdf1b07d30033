//! The in-process transport: named rendezvous between two endpoints.
//!
//! A channel endpoint is created against a [`ChannelHandle`] in either
//! [`Mode::Server`] or [`Mode::Client`]; the first endpoint to arrive parks
//! in a process-wide registry and the second (of the opposite mode) pairs
//! with it. Messages sent before the pairing queue on the sender and flush
//! in order once the peer arrives.
//!
//! Delivery is asynchronous: a message is posted as a task onto the *peer's*
//! I/O runner, which upholds the channel contract that all receive-side
//! callbacks happen on the receiving channel's I/O thread. The endpoint
//! holds its delegate weakly, so a message in flight to a dying channel is
//! dropped rather than resurrecting it.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, trace};

use crate::ipc::Message;
use crate::task::Closure;
use crate::TaskRunner;

/// Names the rendezvous point a channel pair meets at.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChannelHandle {
    name: String,
}

impl ChannelHandle {
    pub fn new(name: impl Into<String>) -> ChannelHandle {
        ChannelHandle { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<&str> for ChannelHandle {
    fn from(name: &str) -> ChannelHandle {
        ChannelHandle::new(name)
    }
}

/// Which side of the channel an endpoint is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Server,
    Client,
}

/// Receive-side callbacks, invoked on the endpoint's I/O runner.
pub(crate) trait ChannelDelegate: Send + Sync {
    fn on_message_received(&self, message: Message);
    fn on_channel_connected(&self, peer_id: i32);
    fn on_channel_error(&self);
}

struct EndpointState {
    peer: Option<Weak<Endpoint>>,
    /// Sends that happened before the peer arrived.
    pending_out: Vec<Message>,
    closed: bool,
}

struct Endpoint {
    id: i32,
    name: String,
    mode: Mode,
    io_runner: Arc<dyn TaskRunner>,
    delegate: Weak<dyn ChannelDelegate>,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    /// Queues `message` for this endpoint's delegate, on its I/O runner.
    fn deliver(&self, message: Message) -> bool {
        let delegate = self.delegate.clone();
        self.io_runner.post_task(Closure::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                delegate.on_message_received(message);
            } else {
                trace!("dropping message for a closed channel");
            }
        }))
    }

    fn notify_connected(&self, peer_id: i32) {
        let delegate = self.delegate.clone();
        self.io_runner.post_task(Closure::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                delegate.on_channel_connected(peer_id);
            }
        }));
    }

    fn notify_error(&self) {
        let delegate = self.delegate.clone();
        self.io_runner.post_task(Closure::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                delegate.on_channel_error();
            }
        }));
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Endpoint>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Endpoint>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_ENDPOINT_ID: AtomicI32 = AtomicI32::new(1);

/// One end of an in-process channel. Clonable, thread-safe sender handle.
#[derive(Clone)]
pub struct Channel {
    endpoint: Arc<Endpoint>,
}

impl Channel {
    /// Creates an endpoint and connects it to its peer if the peer already
    /// arrived. Fails if the rendezvous already has an endpoint of the same
    /// mode parked.
    pub(crate) fn create(
        handle: &ChannelHandle,
        mode: Mode,
        delegate: Weak<dyn ChannelDelegate>,
        io_runner: Arc<dyn TaskRunner>,
    ) -> io::Result<Channel> {
        let endpoint = Arc::new(Endpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            name: handle.name().to_owned(),
            mode,
            io_runner,
            delegate,
            state: Mutex::new(EndpointState {
                peer: None,
                pending_out: Vec::new(),
                closed: false,
            }),
        });

        let mut registry = registry().lock().unwrap();
        match registry.remove(handle.name()) {
            None => {
                registry.insert(handle.name().to_owned(), endpoint.clone());
                debug!("channel '{}' ({:?}) waiting for peer", handle.name(), mode);
            }
            Some(parked) if parked.mode == mode => {
                // Put it back; this create is the mistake.
                registry.insert(handle.name().to_owned(), parked);
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("channel '{}' already has a {:?} endpoint", handle.name(), mode),
                ));
            }
            Some(parked) => {
                drop(registry);
                link(&endpoint, &parked);
                debug!("channel '{}' connected", handle.name());
            }
        }

        Ok(Channel { endpoint })
    }

    /// Sends a message to the peer. Messages sent before the peer connects
    /// are queued. Returns false once the channel is closed.
    pub fn send(&self, message: Message) -> bool {
        debug_assert!(
            message.deserializer.is_none(),
            "deserializer must be detached before a message reaches the transport"
        );
        let peer = {
            let mut state = self.endpoint.state.lock().unwrap();
            if state.closed {
                return false;
            }
            match &state.peer {
                Some(peer) => peer.clone(),
                None => {
                    state.pending_out.push(message);
                    return true;
                }
            }
        };
        match peer.upgrade() {
            Some(peer) => peer.deliver(message),
            None => false,
        }
    }

    /// The id the peer sees us as.
    pub fn endpoint_id(&self) -> i32 {
        self.endpoint.id
    }

    /// Closes this end: unparks from the rendezvous and reports an error to
    /// the peer, which is how the peer learns the conversation is over.
    pub(crate) fn close(&self) {
        let peer = {
            let mut state = self.endpoint.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.peer.take()
        };
        match peer {
            Some(peer) => {
                if let Some(peer) = peer.upgrade() {
                    let mut peer_state = peer.state.lock().unwrap();
                    peer_state.peer = None;
                    drop(peer_state);
                    peer.notify_error();
                }
            }
            None => {
                let mut registry = registry().lock().unwrap();
                if let Some(parked) = registry.get(&self.endpoint.name) {
                    if Arc::ptr_eq(parked, &self.endpoint) {
                        registry.remove(&self.endpoint.name);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.endpoint.name)
            .field("mode", &self.endpoint.mode)
            .field("id", &self.endpoint.id)
            .finish()
    }
}

/// Pairs two endpoints: cross-link, flush queued sends in order, notify both
/// delegates.
fn link(a: &Arc<Endpoint>, b: &Arc<Endpoint>) {
    let (a_pending, b_pending) = {
        let mut a_state = a.state.lock().unwrap();
        let mut b_state = b.state.lock().unwrap();
        a_state.peer = Some(Arc::downgrade(b));
        b_state.peer = Some(Arc::downgrade(a));
        (
            std::mem::take(&mut a_state.pending_out),
            std::mem::take(&mut b_state.pending_out),
        )
    };

    a.notify_connected(b.id);
    b.notify_connected(a.id);
    for message in a_pending {
        b.deliver(message);
    }
    for message in b_pending {
        a.deliver(message);
    }
}
