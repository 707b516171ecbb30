//! Beaver triples and the proposals that request them.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    matrix::{Matrix, Shape, ShapeError},
    message::PartyId,
};

/// Which operand of a product a party holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandPosition {
    /// The left operand `A` of `A·B`.
    First,
    /// The right operand `B` of `A·B`.
    Second,
}

impl OperandPosition {
    /// The position held by the peer.
    pub fn complement(self) -> Self {
        match self {
            OperandPosition::First => OperandPosition::Second,
            OperandPosition::Second => OperandPosition::First,
        }
    }
}

/// A request for a triple, sent by a party to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// The operand held by the sender.
    pub position: OperandPosition,
    /// The party holding the other operand.
    pub peer: PartyId,
    /// Shape of the sender's operand.
    pub own_shape: Shape,
    /// Expected shape of the peer's operand.
    pub peer_shape: Shape,
    /// Drawn fresh for every multiplication and echoed in the triple share answering it.
    pub nonce: u64,
}

impl Proposal {
    /// Returns true if `other` is the peer's side of the same product.
    ///
    /// Nonces are not compared; they only tie a triple share to the request it answers.
    pub fn complements(&self, other: &Proposal) -> bool {
        self.position.complement() == other.position
            && self.own_shape == other.peer_shape
            && self.peer_shape == other.own_shape
    }

    /// The (first, second) operand shapes, ordered so that their product is defined.
    ///
    /// If the shapes declared for the two positions do not chain they are swapped; `None` means neither order
    /// chains. A [`SecureMultiplier`](crate::mul::SecureMultiplier) never proposes unchained shapes, and it rejects
    /// a swapped triple as not fitting its operands, so the swap only serves other clients of the producer.
    pub fn operand_shapes(&self) -> Option<(Shape, Shape)> {
        let (first, second) = match self.position {
            OperandPosition::First => (self.own_shape, self.peer_shape),
            OperandPosition::Second => (self.peer_shape, self.own_shape),
        };
        if first.chains_with(&second) {
            Some((first, second))
        } else if second.chains_with(&first) {
            Some((second, first))
        } else {
            None
        }
    }
}

/// Correlated randomness `(U, V, W = U·V)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaverTriple {
    /// Mask of the first operand.
    pub u: Matrix,
    /// Mask of the second operand.
    pub v: Matrix,
    /// The product `U·V`.
    pub w: Matrix,
}

impl BeaverTriple {
    /// Draws `U` and `V` uniformly from `[-1, 1]` and computes `W = U·V`.
    pub fn generate(first: Shape, second: Shape, rng: &mut impl Rng) -> Result<Self, ShapeError> {
        let u = Matrix::random_uniform(first, -1.0, 1.0, rng);
        let v = Matrix::random_uniform(second, -1.0, 1.0, rng);
        let w = u.matmul(&v)?;
        Ok(Self { u, v, w })
    }

    /// Splits the triple additively for the holders of the first and the second operand.
    ///
    /// Each share carries `session` and the nonce of the proposal it answers.
    pub fn split(
        &self,
        session: u64,
        first: Requester,
        second: Requester,
        rng: &mut impl Rng,
    ) -> (TripleShare, TripleShare) {
        let (u0, u1) = self.u.split_additive_with(rng);
        let (v0, v1) = self.v.split_additive_with(rng);
        let (w0, w1) = self.w.split_additive_with(rng);
        (
            TripleShare {
                peer: second.party,
                session,
                nonce: first.nonce,
                u: u0,
                v: v0,
                w: w0,
            },
            TripleShare {
                peer: first.party,
                session,
                nonce: second.nonce,
                u: u1,
                v: v1,
                w: w1,
            },
        )
    }
}

/// A party whose proposal was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    /// The proposing party.
    pub party: PartyId,
    /// The nonce of its proposal.
    pub nonce: u64,
}

/// One party's share of a [`BeaverTriple`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleShare {
    /// The party holding the other share.
    pub peer: PartyId,
    /// Identifies the multiplication on both sides; tags every message exchanged with the peer.
    pub session: u64,
    /// The nonce of the proposal this share answers.
    pub nonce: u64,
    /// Share of `U`.
    pub u: Matrix,
    /// Share of `V`.
    pub v: Matrix,
    /// Share of `W`.
    pub w: Matrix,
}

impl TripleShare {
    /// The masks of the operand held at `position` and of the peer's operand.
    pub fn masks(&self, position: OperandPosition) -> (&Matrix, &Matrix) {
        match position {
            OperandPosition::First => (&self.u, &self.v),
            OperandPosition::Second => (&self.v, &self.u),
        }
    }
}
