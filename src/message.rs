//! Wire messages exchanged between parties.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};

/// The integer id of a party, unique within a run.
pub type PartyId = usize;

/// An opaque token that separates concurrent conversations between the same pair of parties.
///
/// Messages without a key (`Option<Key>::None`) form their own conversation, distinct from every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub u64);

impl Key {
    /// The key under which a coordinator asks the triple producer to stop.
    pub const STOP: Key = Key(u64::MAX);

    /// The key used for triples meant for a multiplication with `peer`.
    pub const fn peer(peer: PartyId) -> Key {
        Key(peer as u64)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The semantic type of a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A triple proposal sent to the producer.
    SetTriplet = 11,
    /// A party's share of a Beaver triple, sent by the producer.
    TripleArray = 12,
    /// Asks the producer to stop serving proposals.
    TrainingStop = 19,
    /// A share of a party's own operand.
    MulDataShare = 20,
    /// Own operand share minus own triple mask.
    MulOwnValShare = 21,
    /// Share of the peer's operand minus the peer operand's triple mask.
    MulOtherValShare = 22,
    /// Layer output shares reported to the coordinator.
    MulOutShare = 24,
    /// Negative acknowledgement.
    ReceivedErr = 98,
    /// Positive acknowledgement.
    ReceivedOk = 99,
}

impl TryFrom<u8> for MessageKind {
    type Error = MessageError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            11 => MessageKind::SetTriplet,
            12 => MessageKind::TripleArray,
            19 => MessageKind::TrainingStop,
            20 => MessageKind::MulDataShare,
            21 => MessageKind::MulOwnValShare,
            22 => MessageKind::MulOtherValShare,
            24 => MessageKind::MulOutShare,
            98 => MessageKind::ReceivedErr,
            99 => MessageKind::ReceivedOk,
            _ => return Err(MessageError::UnknownKind(tag)),
        })
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = u8::deserialize(deserializer)?;
        MessageKind::try_from(tag).map_err(serde::de::Error::custom)
    }
}

/// Why a receiving endpoint refused to accept a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The mailbox for this conversation is full.
    BufferOccupied = 1,
    /// The sender is not part of the receiver's directory.
    UnrecognizedSender = 2,
    /// The receiver could not be reached.
    ConnectionFailed = 3,
}

/// Errors raised while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The kind tag is not known.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    /// The payload or message could not be (de-)serialized.
    #[error("could not (de-)serialize message: {0}")]
    Serde(#[from] bincode::Error),
    /// A message expected to be an acknowledgement was something else.
    #[error("expected an acknowledgement, found {0:?}")]
    NotAnAck(MessageKind),
}

/// A single message between two parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The semantic type of the payload.
    pub kind: MessageKind,
    /// The bincode-serialized payload.
    pub payload: Vec<u8>,
    /// The conversation this message belongs to.
    pub key: Option<Key>,
    /// The sending party, stamped by the sending endpoint.
    pub sender: PartyId,
}

impl Message {
    /// Serializes `value` into a new message without a key.
    pub fn encode<T: Serialize + ?Sized>(kind: MessageKind, value: &T) -> Result<Self, MessageError> {
        Ok(Message {
            kind,
            payload: bincode::serialize(value)?,
            key: None,
            sender: 0,
        })
    }

    /// Sets the conversation key.
    pub fn with_key(mut self, key: impl Into<Option<Key>>) -> Self {
        self.key = key.into();
        self
    }

    /// Deserializes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serializes the whole message for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a whole message from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// The answer of a receiving endpoint to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The message was appended to the receiver's mailbox.
    Ok,
    /// The message was refused and may be retried.
    Rejected(RejectReason),
}

impl Ack {
    /// Encodes the acknowledgement as a `RECEIVED_OK` / `RECEIVED_ERR` message from `sender`.
    pub fn into_message(self, sender: PartyId) -> Message {
        let (kind, payload) = match self {
            Ack::Ok => (MessageKind::ReceivedOk, vec![]),
            Ack::Rejected(reason) => (MessageKind::ReceivedErr, vec![reason as u8]),
        };
        Message {
            kind,
            payload,
            key: None,
            sender,
        }
    }

    /// Decodes an acknowledgement message.
    pub fn from_message(msg: &Message) -> Result<Self, MessageError> {
        match msg.kind {
            MessageKind::ReceivedOk => Ok(Ack::Ok),
            MessageKind::ReceivedErr => {
                let reason = match msg.payload.first() {
                    Some(1) => RejectReason::BufferOccupied,
                    Some(2) => RejectReason::UnrecognizedSender,
                    _ => RejectReason::ConnectionFailed,
                };
                Ok(Ack::Rejected(reason))
            }
            kind => Err(MessageError::NotAnAck(kind)),
        }
    }
}
