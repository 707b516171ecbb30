use std::{collections::BTreeMap, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use sharemul::{
    channel::Endpoint,
    config::{ChannelOptions, Timeouts},
    mailbox::Mailboxes,
    message::PartyId,
};
use url::Url;

use crate::client::HttpTransport;

/// The static configuration of one node, loaded from a JSON file.
///
/// ```json
/// {
///   "party": 1,
///   "listen": "127.0.0.1:8001",
///   "producer": 0,
///   "peers": {
///     "0": "http://127.0.0.1:8000/",
///     "1": "http://127.0.0.1:8001/",
///     "2": "http://127.0.0.1:8002/"
///   },
///   "timeouts": { "send": 10000, "receive": 60000, "triple": 120000 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// The id of this node.
    pub party: PartyId,
    /// The socket address the node's server binds to.
    pub listen: SocketAddr,
    /// The id of the triple producer.
    pub producer: PartyId,
    /// The id of the coordinator allowed to stop the producer.
    #[serde(default)]
    pub coordinator: Option<PartyId>,
    /// The base URL of every party of the run; deliveries from other senders are rejected.
    pub peers: BTreeMap<PartyId, Url>,
    /// Deadlines of the protocol steps, in milliseconds.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Mailbox capacity and retry interval.
    #[serde(default)]
    pub channel: ChannelOptions,
}

impl NodeConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&json)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the parties named by the configuration are part of the address table.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.peers.contains_key(&self.producer) {
            bail!("producer {} has no address", self.producer);
        }
        if let Some(coordinator) = self.coordinator {
            if !self.peers.contains_key(&coordinator) {
                bail!("coordinator {coordinator} has no address");
            }
        }
        Ok(())
    }

    /// The multiplying parties, i.e. every peer except the producer and the coordinator.
    pub fn clients(&self) -> impl Iterator<Item = PartyId> + '_ {
        self.peers
            .keys()
            .copied()
            .filter(|p| *p != self.producer && Some(*p) != self.coordinator)
    }

    /// Empty mailboxes for this node, accepting deliveries from the configured peers only.
    pub fn mailboxes(&self) -> Mailboxes {
        Mailboxes::new(self.party, self.channel.mailbox_capacity).recognize(self.peers.keys().copied())
    }

    /// The endpoint of this node, receiving into `mailboxes`.
    pub fn endpoint(&self, mailboxes: Arc<Mailboxes>) -> anyhow::Result<Endpoint<HttpTransport>> {
        let transport =
            HttpTransport::new(self.peers.clone()).context("unable to build HTTP client")?;
        Ok(Endpoint::new(self.party, mailboxes, transport, &self.channel))
    }
}
