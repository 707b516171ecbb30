use std::{collections::BTreeMap, time::Duration};

use reqwest::StatusCode;
use sharemul::{
    channel::Transport,
    message::{Ack, Message, MessageError, PartyId},
};
use url::Url;

/// Errors of a single HTTP delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum HttpTransportError {
    /// The party has no entry in the address table.
    #[error("party {0} is not in the address table")]
    UnknownParty(PartyId),
    /// The delivery URL could not be built from the party's base URL.
    #[error("invalid address for party {party}")]
    Url {
        /// The receiving party.
        party: PartyId,
        /// The parse error.
        #[source]
        source: url::ParseError,
    },
    /// The request failed, e.g. because the connection was refused.
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    /// The receiver answered with an error status.
    #[error("unexpected status code {0}")]
    Status(StatusCode),
    /// The acknowledgement could not be decoded.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Delivers messages by posting them to the receiver's `/msg` route.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    peers: BTreeMap<PartyId, Url>,
}

impl HttpTransport {
    /// Creates a transport for the given address table.
    pub fn new(peers: BTreeMap<PartyId, Url>) -> Result<Self, HttpTransportError> {
        #[allow(unused_mut)]
        let mut builder = reqwest::ClientBuilder::new();

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        {
            builder = builder.tcp_user_timeout(Duration::from_secs(10 * 60));
        }

        let client = builder.build()?;
        Ok(Self { client, peers })
    }

    fn msg_url(&self, party: PartyId) -> Result<Url, HttpTransportError> {
        let base = self
            .peers
            .get(&party)
            .ok_or(HttpTransportError::UnknownParty(party))?;
        base.join("msg")
            .map_err(|source| HttpTransportError::Url { party, source })
    }
}

impl Transport for HttpTransport {
    type Error = HttpTransportError;

    async fn deliver(&self, to: PartyId, msg: Message) -> Result<Ack, HttpTransportError> {
        let url = self.msg_url(to)?;
        let resp = self.client.post(url).body(msg.to_bytes()?).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpTransportError::Status(status));
        }
        let body = resp.bytes().await?;
        Ok(Ack::from_message(&Message::from_bytes(&body)?)?)
    }
}
