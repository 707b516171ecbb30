//! Two-party multiplication of secret matrices using one Beaver triple.
//!
//! The holder of the left operand `A` and the holder of the right operand `B` each end up with an additive share of
//! `A·B`. Per product, the protocol consists of the following steps, each of which sends a message before waiting
//! for the peer's message, so that both sides can run them in lockstep:
//!
//! 1. Both parties propose the product to the triple producer and receive their share of `(U, V, W = U·V)`.
//! 2. Both parties split their operand and hand one share to the peer.
//! 3. Both parties reveal their own operand share minus their own mask, which lets the peer compute the masked
//!    value of this party's operand (`A − U` or `B − V`).
//! 4. Both parties reveal their share of the peer's operand minus the peer's mask, which lets the peer compute the
//!    masked value of its own operand.
//!
//! With `E = A − U` and `F = B − V`, the left party then holds `−E·F + A₀·F + E·B₀ + W₀` and the right party
//! `A₁·F + E·B₁ + W₁`, which sum to `A·B`.
//!
//! Every proposal carries a fresh nonce that the producer echoes in the triple share, and every matrix sent to the
//! peer is tagged with the session id of the triple. Messages left over from an aborted multiplication therefore
//! never leak into a later one between the same parties: they are discarded when read.

use std::{collections::BTreeMap, fmt};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, error, instrument};

use crate::{
    channel::{self, Endpoint, Transport},
    config::Timeouts,
    matrix::{Matrix, Shape, ShapeError},
    message::{Key, Message, MessageKind, PartyId},
    triple::{OperandPosition, Proposal, TripleShare},
};

/// A step of the multiplication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Sending the proposal to the producer.
    RequestTriple,
    /// Waiting for the triple share.
    ReceiveTriple,
    /// Exchanging shares of the operands.
    ExchangeShares,
    /// Exchanging own operand shares minus own masks.
    ExchangeOwnValues,
    /// Exchanging shares of the peer's operand minus the peer's masks.
    ExchangeOtherValues,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::RequestTriple => "triple request",
            Step::ReceiveTriple => "triple receipt",
            Step::ExchangeShares => "operand share exchange",
            Step::ExchangeOwnValues => "own value exchange",
            Step::ExchangeOtherValues => "other value exchange",
        })
    }
}

/// Errors that abort a multiplication.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A message could not be sent or received.
    #[error("{step} failed: {source}")]
    Channel {
        /// The step during which the error occurred.
        step: Step,
        /// The channel error.
        source: channel::Error,
    },
    /// The operand and the declared shape of the peer's operand cannot be multiplied.
    #[error("cannot multiply as {position:?} operand: own shape {own}, peer shape {peer}")]
    IncompatibleOperands {
        /// The position of the local operand.
        position: OperandPosition,
        /// The shape of the local operand.
        own: Shape,
        /// The declared shape of the peer's operand.
        peer: Shape,
    },
    /// The peer sent a matrix of the wrong shape.
    #[error("{step}: expected a {expected} matrix, got {actual}")]
    UnexpectedShape {
        /// The step during which the matrix was received.
        step: Step,
        /// The expected shape.
        expected: Shape,
        /// The received shape.
        actual: Shape,
    },
    /// The triple received from the producer does not fit this product.
    #[error("triple for a product with party {peer} does not fit the operands")]
    WrongTriple {
        /// The peer named by the triple.
        peer: PartyId,
    },
    /// A party tried to multiply with itself.
    #[error("party {0} cannot multiply with itself")]
    InvalidPeer(PartyId),
    /// Local matrix arithmetic failed.
    #[error(transparent)]
    Arithmetic(#[from] ShapeError),
}

impl Error {
    /// The step during which the error occurred, if it occurred while communicating.
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Channel { step, .. } | Error::UnexpectedShape { step, .. } => Some(*step),
            Error::WrongTriple { .. } => Some(Step::ReceiveTriple),
            _ => None,
        }
    }

    /// Returns true if the peer or producer was merely too slow.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Channel { source, .. } if source.is_timeout())
    }
}

fn at(step: Step) -> impl FnOnce(channel::Error) -> Error {
    move |source| Error::Channel { step, source }
}

fn expect_kind(msg: &Message, expected: MessageKind) -> Result<(), channel::Error> {
    if msg.kind == expected {
        Ok(())
    } else {
        Err(channel::Error::ProtocolViolation {
            peer: msg.sender,
            expected,
            actual: msg.kind,
        })
    }
}

/// A matrix sent to the peer, tagged with the session it belongs to.
#[derive(Debug, Serialize, Deserialize)]
struct Tagged<M> {
    session: u64,
    value: M,
}

/// The order in which two parties run their two products with each other.
///
/// The party with the smaller id multiplies as holder of the first operand before multiplying as holder of the
/// second operand, its peer runs the opposite order, so both sides always work on the same product.
pub fn session_order(own: PartyId, peer: PartyId) -> [OperandPosition; 2] {
    if own < peer {
        [OperandPosition::First, OperandPosition::Second]
    } else {
        [OperandPosition::Second, OperandPosition::First]
    }
}

/// This party's shares of the two products computed with one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossProduct {
    /// Share of `own_left · peer_right`.
    pub as_left: Matrix,
    /// Share of `peer_left · own_right`.
    pub as_right: Matrix,
}

/// The operands of one [`SecureMultiplier::cross_multiply`] call.
#[derive(Debug, Clone, Copy)]
pub struct CrossOperands<'m> {
    /// The peer holding the other operands.
    pub peer: PartyId,
    /// The local left operand.
    pub own_left: &'m Matrix,
    /// The shape of the peer's right operand.
    pub peer_right_shape: Shape,
    /// The local right operand.
    pub own_right: &'m Matrix,
    /// The shape of the peer's left operand.
    pub peer_left_shape: Shape,
}

/// Runs the multiplication protocol for one party.
#[derive(Debug)]
pub struct SecureMultiplier<'a, T> {
    endpoint: &'a Endpoint<T>,
    producer: PartyId,
    timeouts: Timeouts,
}

impl<'a, T: Transport> SecureMultiplier<'a, T> {
    /// Creates a multiplier obtaining its triples from `producer`.
    pub fn new(endpoint: &'a Endpoint<T>, producer: PartyId, timeouts: Timeouts) -> Self {
        Self {
            endpoint,
            producer,
            timeouts,
        }
    }

    /// The id of the multiplying party.
    pub fn id(&self) -> PartyId {
        self.endpoint.id()
    }

    /// Computes a share of `a · B`, where `B` is held by `peer`.
    pub async fn multiply_as_left(&self, peer: PartyId, peer_shape: Shape, a: &Matrix) -> Result<Matrix, Error> {
        self.multiply(OperandPosition::First, peer, peer_shape, a).await
    }

    /// Computes a share of `A · b`, where `A` is held by `peer`.
    pub async fn multiply_as_right(&self, peer: PartyId, peer_shape: Shape, b: &Matrix) -> Result<Matrix, Error> {
        self.multiply(OperandPosition::Second, peer, peer_shape, b).await
    }

    /// Computes a share of the product of `operand` and the operand of `peer`.
    #[instrument(level = Level::DEBUG, skip_all, fields(own = self.endpoint.id(), peer = peer, position = ?position))]
    pub async fn multiply(
        &self,
        position: OperandPosition,
        peer: PartyId,
        peer_shape: Shape,
        operand: &Matrix,
    ) -> Result<Matrix, Error> {
        let session = Session {
            endpoint: self.endpoint,
            timeouts: &self.timeouts,
            position,
            peer,
            own_shape: operand.shape(),
            peer_shape,
        };
        let result = session.run(self.producer, operand).await;
        if let Err(e) = &result {
            match e.step() {
                Some(step) => error!(peer, %step, "multiplication aborted: {e}"),
                None => error!(peer, "multiplication aborted: {e}"),
            }
        }
        result
    }

    /// Computes shares of `own_left · B` and `A · own_right` with `peer`, where `A` and `B` are the peer's left
    /// and right operand.
    ///
    /// Both parties must call this with each other; the products run in the order given by [`session_order`].
    pub async fn cross_multiply(
        &self,
        peer: PartyId,
        own_left: &Matrix,
        peer_right_shape: Shape,
        own_right: &Matrix,
        peer_left_shape: Shape,
    ) -> Result<CrossProduct, Error> {
        let [first, _] = session_order(self.endpoint.id(), peer);
        let (as_left, as_right) = match first {
            OperandPosition::First => {
                let as_left = self.multiply_as_left(peer, peer_right_shape, own_left).await?;
                let as_right = self.multiply_as_right(peer, peer_left_shape, own_right).await?;
                (as_left, as_right)
            }
            OperandPosition::Second => {
                let as_right = self.multiply_as_right(peer, peer_left_shape, own_right).await?;
                let as_left = self.multiply_as_left(peer, peer_right_shape, own_left).await?;
                (as_left, as_right)
            }
        };
        Ok(CrossProduct { as_left, as_right })
    }

    /// Runs [`SecureMultiplier::cross_multiply`] with every peer concurrently.
    ///
    /// The first failure is returned and the remaining products are abandoned.
    pub async fn cross_multiply_all(
        &self,
        operands: impl IntoIterator<Item = CrossOperands<'_>>,
    ) -> Result<BTreeMap<PartyId, CrossProduct>, Error> {
        let products = try_join_all(operands.into_iter().map(async |op| {
            let product = self
                .cross_multiply(
                    op.peer,
                    op.own_left,
                    op.peer_right_shape,
                    op.own_right,
                    op.peer_left_shape,
                )
                .await?;
            Ok::<_, Error>((op.peer, product))
        }))
        .await?;
        Ok(products.into_iter().collect())
    }
}

/// The state of one multiplication, dropped when it returns.
struct Session<'s, T> {
    endpoint: &'s Endpoint<T>,
    timeouts: &'s Timeouts,
    position: OperandPosition,
    peer: PartyId,
    own_shape: Shape,
    peer_shape: Shape,
}

impl<T: Transport> Session<'_, T> {
    async fn run(&self, producer: PartyId, operand: &Matrix) -> Result<Matrix, Error> {
        if self.peer == self.endpoint.id() {
            return Err(Error::InvalidPeer(self.peer));
        }
        let chained = match self.position {
            OperandPosition::First => self.own_shape.chains_with(&self.peer_shape),
            OperandPosition::Second => self.peer_shape.chains_with(&self.own_shape),
        };
        if !chained {
            return Err(Error::IncompatibleOperands {
                position: self.position,
                own: self.own_shape,
                peer: self.peer_shape,
            });
        }

        let triple = self.request_triple(producer).await?;
        let (own_mask, other_mask) = triple.masks(self.position);

        let session = triple.session;
        let (own_share, share_for_peer) = operand.split_additive();
        let held_other = self
            .exchange(
                session,
                Step::ExchangeShares,
                MessageKind::MulDataShare,
                &share_for_peer,
                self.peer_shape,
            )
            .await?;
        debug!("exchanged operand shares");

        let peer_own_value = self
            .exchange(
                session,
                Step::ExchangeOwnValues,
                MessageKind::MulOwnValShare,
                &own_share.checked_sub(own_mask)?,
                self.peer_shape,
            )
            .await?;
        let other_masked = held_other
            .checked_sub(other_mask)?
            .checked_add(&peer_own_value)?;

        let peer_other_value = self
            .exchange(
                session,
                Step::ExchangeOtherValues,
                MessageKind::MulOtherValShare,
                &held_other.checked_sub(other_mask)?,
                self.own_shape,
            )
            .await?;
        let own_masked = own_share
            .checked_sub(own_mask)?
            .checked_add(&peer_other_value)?;
        debug!("exchanged masked values");

        let (e, f, a_share, b_share) = match self.position {
            OperandPosition::First => (&own_masked, &other_masked, &own_share, &held_other),
            OperandPosition::Second => (&other_masked, &own_masked, &held_other, &own_share),
        };
        let product = a_share
            .matmul(f)?
            .checked_add(&e.matmul(b_share)?)?
            .checked_add(&triple.w)?;
        match self.position {
            OperandPosition::First => Ok(product.checked_sub(&e.matmul(f)?)?),
            OperandPosition::Second => Ok(product),
        }
    }

    async fn request_triple(&self, producer: PartyId) -> Result<TripleShare, Error> {
        let nonce = rand::random();
        let proposal = Proposal {
            position: self.position,
            peer: self.peer,
            own_shape: self.own_shape,
            peer_shape: self.peer_shape,
            nonce,
        };
        self.endpoint
            .send_value(
                producer,
                MessageKind::SetTriplet,
                None,
                &proposal,
                self.timeouts.send,
            )
            .await
            .map_err(at(Step::RequestTriple))?;
        let triple = self
            .endpoint
            .receive_filtered(
                producer,
                Some(Key::peer(self.peer)),
                self.timeouts.triple,
                |msg| {
                    expect_kind(&msg, MessageKind::TripleArray)?;
                    let share: TripleShare = msg.decode()?;
                    if share.nonce != nonce {
                        debug!(session = share.session, "discarding triple of an earlier request");
                        return Ok(None);
                    }
                    Ok(Some(share))
                },
            )
            .await
            .map_err(at(Step::ReceiveTriple))?;
        let (own_mask, other_mask) = triple.masks(self.position);
        let fits = triple.peer == self.peer
            && own_mask.shape() == self.own_shape
            && other_mask.shape() == self.peer_shape;
        if !fits {
            return Err(Error::WrongTriple { peer: triple.peer });
        }
        debug!(session = triple.session, "received triple");
        Ok(triple)
    }

    /// Sends `value` to the peer and receives the peer's matrix of the same kind and session.
    async fn exchange(
        &self,
        session: u64,
        step: Step,
        kind: MessageKind,
        value: &Matrix,
        expected: Shape,
    ) -> Result<Matrix, Error> {
        self.endpoint
            .send_value(
                self.peer,
                kind,
                None,
                &Tagged { session, value },
                self.timeouts.send,
            )
            .await
            .map_err(at(step))?;
        let received = self
            .endpoint
            .receive_filtered(self.peer, None, self.timeouts.receive, |msg| {
                let tagged: Tagged<Matrix> = match msg.decode() {
                    Ok(tagged) => tagged,
                    Err(e) => {
                        expect_kind(&msg, kind)?;
                        return Err(e.into());
                    }
                };
                if tagged.session != session {
                    debug!(stale = tagged.session, kind = ?msg.kind, "discarding message of another session");
                    return Ok(None);
                }
                expect_kind(&msg, kind)?;
                Ok(Some(tagged.value))
            })
            .await
            .map_err(at(step))?;
        if received.shape() != expected {
            return Err(Error::UnexpectedShape {
                step,
                expected,
                actual: received.shape(),
            });
        }
        Ok(received)
    }
}
