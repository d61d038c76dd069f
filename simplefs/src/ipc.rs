//! The message channel between clients and the file server.
//!
//! A request carries an opcode and optionally transfers one page; the reply
//! carries a value and optionally a page back. `ChannelTransport` provides the
//! channel in-process, one thread per party.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use thiserror::Error;

use crate::protocol::{Page, Perm};

pub type ClientId = u32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IpcError {
    #[error("peer has gone away")]
    Disconnected,
    #[error("timed out waiting for reply")]
    Timeout,
}

#[derive(Debug)]
pub struct Message {
    pub from: ClientId,
    pub opcode: u32,
    pub page: Option<Box<Page>>,
    pub perm: Perm,
}

#[derive(Debug)]
pub struct Reply {
    /// Negative values are `-ErrorCode`.
    pub value: i32,
    pub page: Option<Box<Page>>,
    pub perm: Perm,
}

impl Reply {
    pub fn new(value: i32, page: Option<Box<Page>>, perm: Perm) -> Self {
        Reply { value, page, perm }
    }

    pub fn is_err(&self) -> bool {
        self.value < 0
    }
}

/// The server's end of the channel.
pub trait Transport {
    /// Blocks for the next request. `None` once every client is gone.
    fn receive(&mut self) -> Option<Message>;

    fn send(&mut self, to: ClientId, reply: Reply) -> Result<(), IpcError>;
}

struct Envelope {
    msg: Message,
    reply_to: SyncSender<Reply>,
}

/// Creates an in-process channel, returning the server end and a handle for
/// connecting clients.
pub fn mailbox() -> (ChannelTransport, Connector) {
    // Rendezvous: a client's send completes only once the server takes it.
    let (tx, rx) = mpsc::sync_channel(0);
    let transport = ChannelTransport {
        requests: rx,
        pending: HashMap::new(),
    };
    let connector = Connector {
        requests: tx,
        next_id: Arc::new(AtomicU32::new(1)),
    };
    (transport, connector)
}

pub struct ChannelTransport {
    requests: Receiver<Envelope>,
    /// Clients waiting for a reply.
    pending: HashMap<ClientId, SyncSender<Reply>>,
}

impl Transport for ChannelTransport {
    fn receive(&mut self) -> Option<Message> {
        let Envelope { msg, reply_to } = self.requests.recv().ok()?;
        trace!("received opcode {} from {}", msg.opcode, msg.from);
        self.pending.insert(msg.from, reply_to);
        Some(msg)
    }

    fn send(&mut self, to: ClientId, reply: Reply) -> Result<(), IpcError> {
        let reply_to = self.pending.remove(&to).ok_or(IpcError::Disconnected)?;
        reply_to.try_send(reply).map_err(|_| IpcError::Disconnected)
    }
}

/// Hands out clients of one server. Cheap to clone across threads.
#[derive(Clone)]
pub struct Connector {
    requests: SyncSender<Envelope>,
    next_id: Arc<AtomicU32>,
}

impl Connector {
    pub fn connect(&self) -> Client {
        Client {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            requests: self.requests.clone(),
        }
    }
}

pub struct Client {
    id: ClientId,
    requests: SyncSender<Envelope>,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Sends one request and blocks for its reply.
    pub fn call(&self, opcode: impl Into<u32>, page: Option<Box<Page>>, perm: Perm) -> Result<Reply, IpcError> {
        let replies = self.post(opcode.into(), page, perm)?;
        replies.recv().map_err(|_| IpcError::Disconnected)
    }

    /// Like `call`, giving up on the reply after `timeout`.
    pub fn call_timeout(
        &self,
        opcode: impl Into<u32>,
        page: Option<Box<Page>>,
        perm: Perm,
        timeout: Duration,
    ) -> Result<Reply, IpcError> {
        let replies = self.post(opcode.into(), page, perm)?;
        replies.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => IpcError::Timeout,
            RecvTimeoutError::Disconnected => IpcError::Disconnected,
        })
    }

    /// Each request gets its own reply slot, so a reply that shows up after a
    /// timeout is simply dropped.
    fn post(&self, opcode: u32, page: Option<Box<Page>>, perm: Perm) -> Result<Receiver<Reply>, IpcError> {
        let (reply_to, replies) = mpsc::sync_channel(1);
        let msg = Message {
            from: self.id,
            opcode,
            page,
            perm,
        };
        self.requests
            .send(Envelope { msg, reply_to })
            .map_err(|_| IpcError::Disconnected)?;
        Ok(replies)
    }
}
