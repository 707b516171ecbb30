//! Deadlines and channel tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadlines applied to the individual steps of a protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long a send keeps retrying before giving up.
    #[serde(with = "millis")]
    pub send: Duration,
    /// How long a receive waits for a message.
    #[serde(with = "millis")]
    pub receive: Duration,
    /// How long a multiplying party waits for its triple.
    #[serde(with = "millis")]
    pub triple: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            send: Duration::from_secs(10),
            receive: Duration::from_secs(60),
            triple: Duration::from_secs(120),
        }
    }
}

impl Timeouts {
    /// Uses the same deadline for every step.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            send: timeout,
            receive: timeout,
            triple: timeout,
        }
    }
}

/// Options of a channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Capacity of every (sender, key) mailbox.
    pub mailbox_capacity: usize,
    /// Pause between two delivery attempts of a rejected message.
    #[serde(with = "millis")]
    pub retry_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            retry_interval: Duration::from_millis(10),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
