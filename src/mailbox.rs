//! Per (sender, key) FIFO queues of undelivered messages.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{
        Mutex as AsyncMutex,
        mpsc::{self, error::TrySendError},
    },
    time::timeout,
};
use tracing::trace;

use crate::message::{Ack, Key, Message, PartyId, RejectReason};

type Address = (PartyId, Option<Key>);

#[derive(Debug)]
struct Mailbox {
    tx: mpsc::Sender<Message>,
    rx: AsyncMutex<mpsc::Receiver<Message>>,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// The set of mailboxes held by one receiving endpoint.
///
/// Mailboxes are created lazily on the first delivery or receive for an address and are kept until
/// [`Mailboxes::reset`]. Every mailbox is synchronized on its own, so conversations with different peers or keys
/// never wait on each other.
#[derive(Debug)]
pub struct Mailboxes {
    owner: PartyId,
    capacity: usize,
    known: Option<BTreeSet<PartyId>>,
    boxes: Mutex<HashMap<Address, Arc<Mailbox>>>,
}

impl Mailboxes {
    /// Creates an empty mailbox set for `owner` that accepts messages from any sender.
    pub fn new(owner: PartyId, capacity: usize) -> Self {
        Self {
            owner,
            capacity: capacity.max(1),
            known: None,
            boxes: Mutex::new(HashMap::new()),
        }
    }

    /// Restricts accepted deliveries to the given senders.
    pub fn recognize(mut self, senders: impl IntoIterator<Item = PartyId>) -> Self {
        self.known = Some(senders.into_iter().collect());
        self
    }

    /// The party owning these mailboxes.
    pub fn owner(&self) -> PartyId {
        self.owner
    }

    fn mailbox(&self, addr: Address) -> Arc<Mailbox> {
        let mut boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        boxes
            .entry(addr)
            .or_insert_with(|| Arc::new(Mailbox::new(self.capacity)))
            .clone()
    }

    /// Appends an incoming message to the mailbox of its sender and key.
    pub fn accept(&self, msg: Message) -> Ack {
        if let Some(known) = &self.known {
            if !known.contains(&msg.sender) {
                trace!(owner = self.owner, sender = msg.sender, "rejecting unknown sender");
                return Ack::Rejected(RejectReason::UnrecognizedSender);
            }
        }
        let mailbox = self.mailbox((msg.sender, msg.key));
        match mailbox.tx.try_send(msg) {
            Ok(()) => Ack::Ok,
            Err(TrySendError::Full(msg)) => {
                trace!(
                    owner = self.owner,
                    sender = msg.sender,
                    key = ?msg.key,
                    "mailbox full"
                );
                Ack::Rejected(RejectReason::BufferOccupied)
            }
            // the receiver lives as long as the mailbox
            Err(TrySendError::Closed(_)) => Ack::Rejected(RejectReason::ConnectionFailed),
        }
    }

    /// Pops the oldest message from `from` under `key`, waiting at most `wait`.
    ///
    /// Returns `None` if no message arrived in time.
    pub async fn pop(&self, from: PartyId, key: Option<Key>, wait: Duration) -> Option<Message> {
        let mailbox = self.mailbox((from, key));
        let next = async {
            let mut rx = mailbox.rx.lock().await;
            rx.recv().await
        };
        timeout(wait, next).await.ok().flatten()
    }

    /// The number of messages waiting in all mailboxes.
    pub fn pending(&self) -> usize {
        let boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        boxes.values().map(|b| b.pending()).sum()
    }

    /// Drops all mailboxes together with their undelivered messages.
    pub fn reset(&self) {
        let mut boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = std::mem::take(&mut *boxes);
        trace!(owner = self.owner, mailboxes = dropped.len(), "reset");
    }
}
