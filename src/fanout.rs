//! Sending to and receiving from many peers at once.
//!
//! Each helper drives one future per peer concurrently. The first error is returned and the remaining operations are
//! dropped, so no delivery or receive outlives the call.

use std::{collections::BTreeMap, time::Duration};

use futures::future::try_join_all;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    channel::{Endpoint, Error, Transport},
    message::{Key, MessageKind, PartyId},
};

/// Sends the same value to every peer.
pub async fn broadcast<T: Transport, V: Serialize + ?Sized>(
    endpoint: &Endpoint<T>,
    peers: impl IntoIterator<Item = PartyId>,
    kind: MessageKind,
    key: Option<Key>,
    value: &V,
    timeout: Duration,
) -> Result<(), Error> {
    try_join_all(
        peers
            .into_iter()
            .map(async |p| endpoint.send_value(p, kind, key, value, timeout).await),
    )
    .await?;
    Ok(())
}

/// Sends a separate value to each peer.
pub async fn scatter<T: Transport, V: Serialize>(
    endpoint: &Endpoint<T>,
    values: impl IntoIterator<Item = (PartyId, V)>,
    kind: MessageKind,
    key: Option<Key>,
    timeout: Duration,
) -> Result<(), Error> {
    try_join_all(
        values
            .into_iter()
            .map(async |(p, v)| endpoint.send_value(p, kind, key, &v, timeout).await),
    )
    .await?;
    Ok(())
}

/// Receives one value of the given kind from every peer.
pub async fn gather<T: Transport, V: DeserializeOwned>(
    endpoint: &Endpoint<T>,
    peers: impl IntoIterator<Item = PartyId>,
    kind: MessageKind,
    key: Option<Key>,
    timeout: Duration,
) -> Result<BTreeMap<PartyId, V>, Error> {
    let values = try_join_all(peers.into_iter().map(async |p| {
        let value = endpoint.recv_value(p, kind, key, timeout).await?;
        Ok::<_, Error>((p, value))
    }))
    .await?;
    Ok(values.into_iter().collect())
}
