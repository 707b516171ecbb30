//! Keyed, deadline-bounded message delivery between parties.
//!
//! An [`Endpoint`] combines the local [`Mailboxes`] with a [`Transport`] that delivers messages into the mailboxes
//! of remote parties. [`LocalNetwork`] is a transport for parties living in the same process.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::trace;

use crate::{
    config::ChannelOptions,
    mailbox::Mailboxes,
    message::{Ack, Key, Message, MessageError, MessageKind, PartyId},
};

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The receiver did not accept the message before the deadline.
    #[error("sending {kind:?} to party {peer} timed out after {timeout:?}")]
    SendTimeout {
        /// The receiving party.
        peer: PartyId,
        /// The kind of the undelivered message.
        kind: MessageKind,
        /// The deadline that elapsed.
        timeout: Duration,
    },
    /// No message arrived before the deadline.
    #[error("no message from party {peer} under key {key:?} within {timeout:?}")]
    RecvTimeout {
        /// The expected sender.
        peer: PartyId,
        /// The conversation key.
        key: Option<Key>,
        /// The deadline that elapsed.
        timeout: Duration,
    },
    /// The transport could not reach the receiver.
    #[error("could not deliver to party {peer}")]
    TransportFailure {
        /// The receiving party.
        peer: PartyId,
        /// The error raised by the transport.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A message of an unexpected kind arrived.
    #[error("expected {expected:?} from party {peer}, got {actual:?}")]
    ProtocolViolation {
        /// The sending party.
        peer: PartyId,
        /// The kind required by the current step.
        expected: MessageKind,
        /// The kind that was received.
        actual: MessageKind,
    },
    /// A payload could not be (de-)serialized.
    #[error(transparent)]
    Codec(#[from] MessageError),
}

impl Error {
    /// Returns true if the peer was merely too slow, as opposed to broken.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::SendTimeout { .. } | Error::RecvTimeout { .. })
    }
}

/// Delivers messages into the mailboxes of remote parties.
pub trait Transport: Send + Sync {
    /// The error raised when a party cannot be reached.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Performs a single delivery attempt and returns the receiver's acknowledgement.
    fn deliver(
        &self,
        to: PartyId,
        msg: Message,
    ) -> impl Future<Output = Result<Ack, Self::Error>> + Send;
}

/// One party's view of the network.
#[derive(Debug)]
pub struct Endpoint<T> {
    id: PartyId,
    mailboxes: Arc<Mailboxes>,
    transport: T,
    retry_interval: Duration,
}

impl<T: Transport> Endpoint<T> {
    /// Creates an endpoint receiving into `mailboxes` and sending through `transport`.
    pub fn new(id: PartyId, mailboxes: Arc<Mailboxes>, transport: T, options: &ChannelOptions) -> Self {
        Self {
            id,
            mailboxes,
            transport,
            retry_interval: options.retry_interval,
        }
    }

    /// The id of the owning party.
    pub fn id(&self) -> PartyId {
        self.id
    }

    /// The mailboxes incoming messages are delivered to.
    pub fn mailboxes(&self) -> &Arc<Mailboxes> {
        &self.mailboxes
    }

    /// Sends `msg` to `to`, retrying rejected deliveries until the receiver accepts it or `timeout` elapses.
    pub async fn send(&self, to: PartyId, mut msg: Message, timeout: Duration) -> Result<(), Error> {
        msg.sender = self.id;
        let kind = msg.kind;
        let deadline = Instant::now() + timeout;
        let attempts = async {
            loop {
                match self.transport.deliver(to, msg.clone()).await {
                    Ok(Ack::Ok) => return Ok(()),
                    Ok(Ack::Rejected(reason)) => {
                        trace!(from = self.id, to, ?kind, ?reason, "delivery rejected, retrying");
                        sleep(self.retry_interval).await;
                    }
                    Err(e) => {
                        return Err(Error::TransportFailure {
                            peer: to,
                            source: Box::new(e),
                        });
                    }
                }
            }
        };
        match timeout_at(deadline, attempts).await {
            Ok(result) => result,
            Err(_) => Err(Error::SendTimeout {
                peer: to,
                kind,
                timeout,
            }),
        }
    }

    /// Receives the oldest message from `from` under `key`, waiting at most `timeout`.
    pub async fn receive(
        &self,
        from: PartyId,
        key: Option<Key>,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.mailboxes
            .pop(from, key, timeout)
            .await
            .ok_or(Error::RecvTimeout {
                peer: from,
                key,
                timeout,
            })
    }

    /// Receives messages from `from` under `key` until `accept` yields a value.
    ///
    /// Messages for which `accept` returns `None` are discarded. `timeout` bounds the whole wait, not each message.
    pub async fn receive_filtered<V>(
        &self,
        from: PartyId,
        key: Option<Key>,
        timeout: Duration,
        mut accept: impl FnMut(Message) -> Result<Option<V>, Error>,
    ) -> Result<V, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let msg = self
                .mailboxes
                .pop(from, key, wait)
                .await
                .ok_or(Error::RecvTimeout {
                    peer: from,
                    key,
                    timeout,
                })?;
            if let Some(value) = accept(msg)? {
                return Ok(value);
            }
        }
    }

    /// Serializes `value` and sends it as a message of the given kind and key.
    pub async fn send_value<V: Serialize + ?Sized>(
        &self,
        to: PartyId,
        kind: MessageKind,
        key: Option<Key>,
        value: &V,
        timeout: Duration,
    ) -> Result<(), Error> {
        let msg = Message::encode(kind, value)?.with_key(key);
        self.send(to, msg, timeout).await
    }

    /// Receives a message that must be of the given kind and deserializes its payload.
    pub async fn recv_value<V: DeserializeOwned>(
        &self,
        from: PartyId,
        kind: MessageKind,
        key: Option<Key>,
        timeout: Duration,
    ) -> Result<V, Error> {
        let msg = self.receive(from, key, timeout).await?;
        if msg.kind != kind {
            return Err(Error::ProtocolViolation {
                peer: from,
                expected: kind,
                actual: msg.kind,
            });
        }
        Ok(msg.decode()?)
    }

    /// Clears all local mailboxes.
    pub fn reset(&self) {
        self.mailboxes.reset();
    }
}

/// The reasons an in-process delivery can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocalError {
    /// No endpoint was created for the party.
    #[error("party {0} is not part of the network")]
    UnknownParty(PartyId),
    /// The party was marked as down.
    #[error("party {0} is unreachable")]
    Unreachable(PartyId),
}

#[derive(Debug, Default)]
struct Registry {
    parties: RwLock<HashMap<PartyId, Arc<Mailboxes>>>,
    down: RwLock<HashSet<PartyId>>,
}

/// A registry of parties running in the same process.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Registry>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers party `id` with default options and returns its endpoint.
    pub fn endpoint(&self, id: PartyId) -> Endpoint<LocalTransport> {
        self.endpoint_with_options(id, &ChannelOptions::default())
    }

    /// Registers party `id` and returns its endpoint.
    ///
    /// Registering an id twice replaces the mailboxes of the earlier endpoint.
    pub fn endpoint_with_options(
        &self,
        id: PartyId,
        options: &ChannelOptions,
    ) -> Endpoint<LocalTransport> {
        let mailboxes = Arc::new(Mailboxes::new(id, options.mailbox_capacity));
        self.registry
            .parties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, mailboxes.clone());
        let transport = LocalTransport {
            network: self.clone(),
        };
        Endpoint::new(id, mailboxes, transport, options)
    }

    /// Marks a party as down (or back up); deliveries to a down party fail.
    pub fn set_down(&self, id: PartyId, down: bool) {
        let mut set = self
            .registry
            .down
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if down {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    fn lookup(&self, id: PartyId) -> Result<Arc<Mailboxes>, LocalError> {
        if self
            .registry
            .down
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
        {
            return Err(LocalError::Unreachable(id));
        }
        self.registry
            .parties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(LocalError::UnknownParty(id))
    }
}

/// The [`Transport`] of an endpoint created by a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    type Error = LocalError;

    async fn deliver(&self, to: PartyId, msg: Message) -> Result<Ack, LocalError> {
        Ok(self.network.lookup(to)?.accept(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_stamps_sender() -> Result<(), Error> {
        let net = LocalNetwork::new();
        let a = net.endpoint(1);
        let b = net.endpoint(2);
        let t = Duration::from_secs(1);
        a.send_value(2, MessageKind::MulDataShare, None, &7u32, t)
            .await?;
        let msg = b.receive(1, None, t).await?;
        assert_eq!(msg.sender, 1);
        assert_eq!(msg.decode::<u32>()?, 7);
        Ok(())
    }

    #[tokio::test]
    async fn unexpected_kind_is_a_protocol_violation() -> Result<(), Error> {
        let net = LocalNetwork::new();
        let a = net.endpoint(1);
        let b = net.endpoint(2);
        let t = Duration::from_secs(1);
        a.send_value(2, MessageKind::MulOwnValShare, None, &1u8, t)
            .await?;
        let err = b
            .recv_value::<u8>(1, MessageKind::MulOtherValShare, None, t)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                peer: 1,
                expected: MessageKind::MulOtherValShare,
                actual: MessageKind::MulOwnValShare,
            }
        ));
        assert!(!err.is_timeout());
        Ok(())
    }

    #[tokio::test]
    async fn filtered_receive_skips_rejected_messages() -> Result<(), Error> {
        let net = LocalNetwork::new();
        let a = net.endpoint(1);
        let b = net.endpoint(2);
        let t = Duration::from_secs(1);
        for n in [1u32, 2, 3] {
            a.send_value(2, MessageKind::MulDataShare, None, &n, t)
                .await?;
        }
        let even = b
            .receive_filtered(1, None, t, |msg| {
                let n: u32 = msg.decode()?;
                Ok((n % 2 == 0).then_some(n))
            })
            .await?;
        assert_eq!(even, 2);
        assert_eq!(b.mailboxes().pending(), 1);

        let err = b
            .receive_filtered(1, None, Duration::from_millis(50), |_| Ok(None::<()>))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RecvTimeout { peer: 1, timeout, .. } if timeout == Duration::from_millis(50)
        ));
        assert_eq!(b.mailboxes().pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_party_fails_fast() {
        let net = LocalNetwork::new();
        let a = net.endpoint(1);
        let err = a
            .send_value(9, MessageKind::MulDataShare, None, &(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportFailure { peer: 9, .. }));
    }
}
