//! HTTP transport for sharemul parties.
//!
//! Every node runs a [`Server`] that accepts deliveries on `POST /msg` and appends them to the node's
//! [`Mailboxes`](sharemul::mailbox::Mailboxes). Outgoing messages are delivered by the [`HttpTransport`], which
//! posts the bincode-encoded message to the receiver's server and decodes the acknowledgement from the response.
//!
//! # CAUTION: Authentication
//!
//! Deliveries are not authenticated. The sender id of a message is taken at face value, so the server must only be
//! reachable by the parties of the run, e.g. behind a proxy performing mutual TLS.
mod client;
mod config;
mod server;

pub use client::{HttpTransport, HttpTransportError};
pub use config::NodeConfig;
pub use server::{Server, router};
