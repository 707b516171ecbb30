use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::post,
};
use sharemul::{mailbox::Mailboxes, message::Message};
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer, classify::StatusInRangeAsFailures, trace::TraceLayer,
};
use tracing::{info, warn};

/// Receives the deliveries for one party.
pub struct Server {
    addr: SocketAddr,
    mailboxes: Arc<Mailboxes>,
    listener: Option<TcpListener>,
}

impl Server {
    /// Create a new server for the provided address, delivering into `mailboxes`.
    pub fn new(addr: SocketAddr, mailboxes: Arc<Mailboxes>) -> Self {
        Self {
            addr,
            mailboxes,
            listener: None,
        }
    }

    /// Explicitly bind socket so provided address and return bound address.
    ///
    /// This is useful if the [`SocketAddr`] provided to [`Server::new`] had a port
    /// of `0`. The return address of this function will include the randomly chosen
    /// port by the OS.
    pub async fn bind_socket(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .context("unable to bind to socket")?;
        let addr = listener
            .local_addr()
            .context("unable to get local addr of socket")?;
        self.addr = addr;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Start the server.
    pub async fn start(self) -> anyhow::Result<()> {
        self.start_with_shutdown(std::future::pending()).await
    }

    /// Start the server and stop accepting deliveries once `shutdown` completes.
    pub async fn start_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        info!(
            "starting server for party {} on {}",
            self.mailboxes.owner(),
            self.addr
        );
        let listener = match self.listener {
            Some(listener) => listener,
            None => TcpListener::bind(&self.addr)
                .await
                .context("unable to bind to socket")?,
        };
        axum::serve(listener, router(self.mailboxes))
            .with_graceful_shutdown(shutdown)
            .await
            .context("axum server error")?;
        Ok(())
    }
}

/// The routes of a party's server.
pub fn router(mailboxes: Arc<Mailboxes>) -> Router {
    // 400..=599 status response codes will be logged as errors
    let classifier = StatusInRangeAsFailures::new(400..=599).into_make_classifier();
    Router::new()
        .route("/msg", post(msg))
        .with_state(mailboxes)
        // panics will result in 500 status code responses instead of bringing down the server
        .layer(CatchPanicLayer::new())
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new(classifier))
}

async fn msg(State(mailboxes): State<Arc<Mailboxes>>, body: Bytes) -> Result<Vec<u8>, StatusCode> {
    let msg = Message::from_bytes(&body).map_err(|e| {
        warn!("could not decode delivery: {e}");
        StatusCode::BAD_REQUEST
    })?;
    let ack = mailboxes.accept(msg);
    ack.into_message(mailboxes.owner())
        .to_bytes()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
