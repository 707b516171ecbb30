//! Secret-shared matrix multiplication with Beaver triples, as used for vertical federated learning.
//!
//! Two parties, each holding one operand of a matrix product, obtain additive shares of the product without
//! revealing their operands to each other. A third, semi-honest party (the triple producer) supplies the correlated
//! randomness for every product; it only ever learns the shapes of the operands.
//!
//! ## Main Components
//!
//! * [`channel`]: Keyed, deadline-bounded message delivery between parties, with an in-process network.
//! * [`producer`]: The [`producer::TripleProducer`], which matches triple proposals and deals Beaver triples.
//! * [`mul`]: The [`mul::SecureMultiplier`], which runs the two-party multiplication protocol.
//! * [`layer`]: The evaluation of a vertically partitioned linear layer on top of the multiplier.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sharemul::{
//!     channel::LocalNetwork, config::Timeouts, matrix::Matrix, mul::SecureMultiplier,
//!     producer::TripleProducer,
//! };
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let net = LocalNetwork::new();
//! let producer = Arc::new(TripleProducer::new(net.endpoint(0), Timeouts::default()));
//! let (stop, stopped) = watch::channel(false);
//! let running = tokio::spawn(Arc::clone(&producer).run([1, 2], stopped));
//!
//! let (alice, bob) = (net.endpoint(1), net.endpoint(2));
//! let a = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]])?;
//! let b = Matrix::from_rows(vec![vec![0.5], vec![-1.0]])?;
//! let alice = SecureMultiplier::new(&alice, 0, Timeouts::default());
//! let bob = SecureMultiplier::new(&bob, 0, Timeouts::default());
//! let (left, right) = tokio::try_join!(
//!     alice.multiply_as_left(2, b.shape(), &a),
//!     bob.multiply_as_right(1, a.shape(), &b),
//! )?;
//! assert!(left.checked_add(&right)?.approx_eq(&a.matmul(&b)?, 1e-9));
//!
//! stop.send_replace(true);
//! running.await??;
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The protocol is secure against semi-honest parties as long as the producer does not collude with either
//! multiplying party. Shares are real-valued and masked by elementwise scaling with `Uniform[0, 1)`, which hides
//! less than additive sharing over a finite field would.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod config;
pub mod fanout;
pub mod layer;
pub mod mailbox;
pub mod matrix;
pub mod message;
pub mod mul;
pub mod producer;
pub mod triple;
