//! The triple producer, a semi-honest third party handing out Beaver triples.
//!
//! Multiplying parties send a [`Proposal`] naming their peer. Once both sides of a product have proposed with
//! consistent shapes the producer generates one [`BeaverTriple`] and sends each side its [`TripleShare`], keyed by
//! the id of the other side. The producer only ever sees shapes, never the operands.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::{sync::watch, task::JoinSet};
use tracing::{Level, debug, error, info, instrument, warn};

use crate::{
    channel::{self, Endpoint, Transport},
    config::Timeouts,
    message::{Key, Message, MessageKind, PartyId},
    triple::{BeaverTriple, OperandPosition, Proposal, Requester, TripleShare},
};

/// Errors that can stop the producer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error occurred while communicating over the channel.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// The stop signal was dropped while the producer was still running.
    #[error("stop signal dropped before the producer was stopped")]
    StopSignalLost,
    /// A listener task panicked or was cancelled.
    #[error("listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The result of registering a proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The proposal is waiting for its peer.
    Pending,
    /// Both sides proposed; a fresh triple was generated.
    Matched {
        /// The holder of the first operand and its share.
        first: (PartyId, TripleShare),
        /// The holder of the second operand and its share.
        second: (PartyId, TripleShare),
    },
    /// The proposal contradicts the stored one and was dropped.
    Mismatch,
}

/// Matches proposals and produces triples.
#[derive(Debug)]
pub struct TripleProducer<T> {
    endpoint: Endpoint<T>,
    timeouts: Timeouts,
    proposals: Mutex<HashMap<(PartyId, PartyId), Proposal>>,
    rng: Mutex<ChaCha20Rng>,
    generated: AtomicUsize,
}

impl<T: Transport> TripleProducer<T> {
    /// Creates a producer sending triples through `endpoint`.
    pub fn new(endpoint: Endpoint<T>, timeouts: Timeouts) -> Self {
        Self::with_rng(endpoint, timeouts, ChaCha20Rng::from_rng(&mut rand::rng()))
    }

    /// Creates a producer drawing its triples from `rng`.
    pub fn with_rng(endpoint: Endpoint<T>, timeouts: Timeouts, rng: ChaCha20Rng) -> Self {
        Self {
            endpoint,
            timeouts,
            proposals: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            generated: AtomicUsize::new(0),
        }
    }

    /// The producer's endpoint.
    pub fn endpoint(&self) -> &Endpoint<T> {
        &self.endpoint
    }

    /// The number of proposals still waiting for their peer.
    pub fn pending_count(&self) -> usize {
        self.proposals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The number of triples generated so far.
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    /// Stores the proposal of `sender`, or matches it against the stored proposal of its peer.
    pub fn register(&self, sender: PartyId, proposal: Proposal) -> MatchOutcome {
        let peer = proposal.peer;
        if peer == sender {
            warn!(sender, "proposal names the sender as its own peer");
            return MatchOutcome::Mismatch;
        }
        let mut proposals = self
            .proposals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = proposals.get(&(peer, sender)).copied() else {
            if proposals.insert((sender, peer), proposal).is_some() {
                debug!(sender, peer, "replaced unresolved proposal");
            }
            return MatchOutcome::Pending;
        };
        let shapes = if existing.complements(&proposal) {
            proposal.operand_shapes()
        } else {
            None
        };
        let Some((first_shape, second_shape)) = shapes else {
            warn!(
                sender,
                peer,
                stored = ?existing,
                received = ?proposal,
                "triple proposals do not match, dropping the newer one"
            );
            return MatchOutcome::Mismatch;
        };
        proposals.remove(&(peer, sender));
        drop(proposals);

        let own = Requester {
            party: sender,
            nonce: proposal.nonce,
        };
        let other = Requester {
            party: peer,
            nonce: existing.nonce,
        };
        let (first, second) = match proposal.position {
            OperandPosition::First => (own, other),
            OperandPosition::Second => (other, own),
        };
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let triple = match BeaverTriple::generate(first_shape, second_shape, &mut *rng) {
            Ok(triple) => triple,
            Err(e) => {
                warn!(sender, peer, "could not generate triple: {e}");
                return MatchOutcome::Mismatch;
            }
        };
        let session = rng.random();
        let (first_share, second_share) = triple.split(session, first, second, &mut *rng);
        drop(rng);
        self.generated.fetch_add(1, Ordering::Relaxed);
        debug!(
            first = first.party,
            second = second.party,
            session,
            %first_shape,
            %second_shape,
            "generated triple"
        );
        MatchOutcome::Matched {
            first: (first.party, first_share),
            second: (second.party, second_share),
        }
    }

    /// Handles one message received from a multiplying party.
    #[instrument(level = Level::DEBUG, skip_all, fields(sender = msg.sender), err)]
    pub async fn handle_message(&self, msg: Message) -> Result<(), Error> {
        if msg.kind != MessageKind::SetTriplet {
            warn!(kind = ?msg.kind, "ignoring unexpected message");
            return Ok(());
        }
        let proposal: Proposal = msg.decode().map_err(channel::Error::from)?;
        if let MatchOutcome::Matched { first, second } = self.register(msg.sender, proposal) {
            tokio::join!(self.deliver(first), self.deliver(second));
        }
        Ok(())
    }

    async fn deliver(&self, (party, share): (PartyId, TripleShare)) {
        let key = Key::peer(share.peer);
        let sent = self
            .endpoint
            .send_value(party, MessageKind::TripleArray, Some(key), &share, self.timeouts.send)
            .await;
        if let Err(e) = sent {
            error!(peer = party, step = "triple delivery", "{e}");
        }
    }

    /// Serves the proposals of `peer` until `stop` is set.
    pub async fn listen(&self, peer: PartyId, mut stop: watch::Receiver<bool>) -> Result<(), Error> {
        debug!(peer, "listening for proposals");
        loop {
            tokio::select! {
                stopped = wait_for_stop(&mut stop) => return stopped,
                received = self.endpoint.receive(peer, None, self.timeouts.receive) => match received {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg).await {
                            warn!(peer, "dropping proposal: {e}");
                        }
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Waits for a `TRAINING_STOP` message from `coordinator` and then sets `stop`.
    ///
    /// Returns early if `stop` is set by someone else.
    pub async fn stop_on_message(&self, coordinator: PartyId, stop: &watch::Sender<bool>) -> Result<(), Error> {
        let mut stopped = stop.subscribe();
        loop {
            tokio::select! {
                done = wait_for_stop(&mut stopped) => return done,
                received = self.endpoint.recv_value::<()>(
                    coordinator,
                    MessageKind::TrainingStop,
                    Some(Key::STOP),
                    self.timeouts.receive,
                ) => match received {
                    Ok(()) => {
                        info!(coordinator, "received stop message");
                        stop.send_replace(true);
                        return Ok(());
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }
}

impl<T: Transport + 'static> TripleProducer<T> {
    /// Runs one listener per peer until `stop` is set and returns the number of triples generated.
    ///
    /// The first failing listener stops all others.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub async fn run(
        self: Arc<Self>,
        peers: impl IntoIterator<Item = PartyId>,
        stop: watch::Receiver<bool>,
    ) -> Result<usize, Error> {
        let mut listeners = JoinSet::new();
        for peer in peers {
            let producer = Arc::clone(&self);
            let stop = stop.clone();
            listeners.spawn(async move { producer.listen(peer, stop).await });
        }
        info!(listeners = listeners.len(), "triple producer running");
        while let Some(listener) = listeners.join_next().await {
            listener??;
        }
        let generated = self.generated();
        info!(generated, pending = self.pending_count(), "triple producer stopped");
        Ok(generated)
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) -> Result<(), Error> {
    match stop.wait_for(|stopped| *stopped).await {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::StopSignalLost),
    }
}
