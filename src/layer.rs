//! The first layer of a vertically partitioned model.
//!
//! Every party `p` holds the features `X_p` of the same batch of records, plus one additive share `Θ_q@p` of the
//! weights `Θ_q` belonging to the features of every party `q`. Evaluating the layer leaves each party with shares
//! that together sum to `Σ_q X_q · Θ_q`: party `p` computes `X_p · Θ_p@p` locally and, with every other party `q`,
//! securely multiplies `X_p · Θ_p@q` and `X_q · Θ_q@p`.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::{
    channel::{self, Endpoint, Transport},
    fanout::gather,
    matrix::{Matrix, Shape, ShapeError},
    message::{MessageKind, PartyId},
    mul::{self, CrossOperands, SecureMultiplier},
};

/// Errors raised while evaluating or reporting a layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A multiplication with a peer failed.
    #[error(transparent)]
    Mul(#[from] mul::Error),
    /// Reporting or collecting the output shares failed.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// Local matrix arithmetic failed.
    #[error(transparent)]
    Shape(#[from] ShapeError),
    /// The layer does not list the features of a party.
    #[error("party {0} holds no features in this layer")]
    UnknownParty(PartyId),
    /// The model has no parameter share for a party.
    #[error("no parameter share for the features of party {0}")]
    MissingParameters(PartyId),
    /// A matrix supplied by the model has the wrong shape.
    #[error("expected {what} of shape {expected}, got {actual}")]
    WrongShape {
        /// Which matrix was wrong.
        what: &'static str,
        /// Shape implied by the layer.
        expected: Shape,
        /// Shape supplied by the model.
        actual: Shape,
    },
}

/// The data and parameters one party contributes to the layer.
pub trait FeatureModel {
    /// The party's features for the current batch, `batch_size × feature_dim`.
    fn batch(&self) -> &Matrix;

    /// The party's share of the weights applied to the features of `party`.
    fn parameters(&self, party: PartyId) -> Option<&Matrix>;

    /// Receives the party's output shares once the layer has been evaluated.
    fn consume(&mut self, shares: &LayerShares);
}

/// The dimensions of the layer, known to all parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerShapes {
    /// Number of records per batch.
    pub batch_size: usize,
    /// Number of outputs.
    pub out_dim: usize,
    /// Number of features held by each party.
    pub feature_dims: BTreeMap<PartyId, usize>,
}

impl LayerShapes {
    fn feature_dim(&self, party: PartyId) -> Result<usize, Error> {
        self.feature_dims
            .get(&party)
            .copied()
            .ok_or(Error::UnknownParty(party))
    }

    /// The shape of the batch held by `party`.
    pub fn batch_shape(&self, party: PartyId) -> Option<Shape> {
        let dim = self.feature_dims.get(&party)?;
        Some(Shape::new(self.batch_size, *dim))
    }

    /// The shape of the weights applied to the features of `party`.
    pub fn parameter_shape(&self, party: PartyId) -> Option<Shape> {
        let dim = self.feature_dims.get(&party)?;
        Some(Shape::new(*dim, self.out_dim))
    }
}

/// One party's shares of the layer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerShares {
    /// `X_self · Θ_self@self`.
    pub local: Matrix,
    /// Shares of `X_self · Θ_self@peer`, by peer.
    pub as_left: BTreeMap<PartyId, Matrix>,
    /// Shares of `X_peer · Θ_peer@self`, by peer.
    pub as_right: BTreeMap<PartyId, Matrix>,
}

impl LayerShares {
    /// The sum of all shares held by this party.
    pub fn total(&self) -> Result<Matrix, ShapeError> {
        self.as_left
            .values()
            .chain(self.as_right.values())
            .try_fold(self.local.clone(), |acc, m| acc.checked_add(m))
    }
}

fn expect_shape(what: &'static str, expected: Shape, m: &Matrix) -> Result<(), Error> {
    if m.shape() == expected {
        Ok(())
    } else {
        Err(Error::WrongShape {
            what,
            expected,
            actual: m.shape(),
        })
    }
}

/// Evaluates the layer with every other party and hands the resulting shares to `model`.
#[instrument(level = Level::DEBUG, skip_all, fields(party = multiplier.id()), err)]
pub async fn forward<T: Transport, M: FeatureModel>(
    multiplier: &SecureMultiplier<'_, T>,
    shapes: &LayerShapes,
    model: &mut M,
) -> Result<LayerShares, Error> {
    let own = multiplier.id();
    let own_dim = shapes.feature_dim(own)?;
    let x = model.batch();
    expect_shape("batch", Shape::new(shapes.batch_size, own_dim), x)?;
    let own_right_shape = Shape::new(own_dim, shapes.out_dim);
    let theta = model.parameters(own).ok_or(Error::MissingParameters(own))?;
    expect_shape("own parameters", own_right_shape, theta)?;
    let local = x.matmul(theta)?;

    let mut operands = vec![];
    for (&peer, &dim) in shapes.feature_dims.iter().filter(|(p, _)| **p != own) {
        let own_right = model
            .parameters(peer)
            .ok_or(Error::MissingParameters(peer))?;
        expect_shape("peer parameters", Shape::new(dim, shapes.out_dim), own_right)?;
        operands.push(CrossOperands {
            peer,
            own_left: x,
            peer_right_shape: own_right_shape,
            own_right,
            peer_left_shape: Shape::new(shapes.batch_size, dim),
        });
    }
    debug!(peers = operands.len(), "evaluating layer");
    let products = multiplier.cross_multiply_all(operands).await?;

    let mut shares = LayerShares {
        local,
        as_left: BTreeMap::new(),
        as_right: BTreeMap::new(),
    };
    for (peer, product) in products {
        shares.as_left.insert(peer, product.as_left);
        shares.as_right.insert(peer, product.as_right);
    }
    model.consume(&shares);
    Ok(shares)
}

/// Sends the output shares to the coordinator.
pub async fn report<T: Transport>(
    endpoint: &Endpoint<T>,
    coordinator: PartyId,
    shares: &LayerShares,
    timeout: Duration,
) -> Result<(), Error> {
    endpoint
        .send_value(coordinator, MessageKind::MulOutShare, None, shares, timeout)
        .await?;
    Ok(())
}

/// Collects the reports of all `parties` and sums them into the layer output.
pub async fn collect<T: Transport>(
    endpoint: &Endpoint<T>,
    parties: impl IntoIterator<Item = PartyId>,
    timeout: Duration,
) -> Result<Matrix, Error> {
    let reports: BTreeMap<PartyId, LayerShares> =
        gather(endpoint, parties, MessageKind::MulOutShare, None, timeout).await?;
    let mut totals = reports.values().map(LayerShares::total);
    let Some(first) = totals.next() else {
        return Ok(Matrix::zeros((0, 0)));
    };
    let mut output = first?;
    for total in totals {
        output = output.checked_add(&total?)?;
    }
    Ok(output)
}
