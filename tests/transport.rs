use std::time::{Duration, Instant};

use sharemul::{
    channel::{Error, LocalNetwork},
    config::ChannelOptions,
    message::{Key, Message, MessageKind},
};

const T: Duration = Duration::from_secs(1);

fn numbered(n: u32) -> Message {
    Message::encode(MessageKind::MulDataShare, &n).unwrap()
}

#[tokio::test]
async fn fifo_per_key_with_interleaved_keys() -> Result<(), Error> {
    let net = LocalNetwork::new();
    let a = net.endpoint(1);
    let b = net.endpoint(2);
    for n in 1..=3 {
        a.send(2, numbered(n), T).await?;
        a.send(2, numbered(100 + n).with_key(Key(7)), T).await?;
    }
    for n in 1..=3 {
        let got: u32 = b.receive(1, None, T).await?.decode()?;
        assert_eq!(got, n);
    }
    for n in 1..=3 {
        let got: u32 = b.receive(1, Some(Key(7)), T).await?.decode()?;
        assert_eq!(got, 100 + n);
    }
    Ok(())
}

#[tokio::test]
async fn receive_timeout_is_bounded() {
    let net = LocalNetwork::new();
    let a = net.endpoint(1);
    let wait = Duration::from_millis(100);
    let start = Instant::now();
    let err = a.receive(2, None, wait).await.unwrap_err();
    let elapsed = start.elapsed();
    assert!(err.is_timeout());
    assert!(matches!(err, Error::RecvTimeout { peer: 2, key: None, .. }));
    assert!(elapsed >= wait);
    assert!(elapsed < wait + Duration::from_millis(500));
}

#[tokio::test]
async fn blocked_receive_does_not_block_other_keys() -> Result<(), Error> {
    let net = LocalNetwork::new();
    let a = net.endpoint(1);
    let b = net.endpoint(2);
    let (blocked, delivered) = tokio::join!(
        b.receive(1, Some(Key(1)), Duration::from_millis(200)),
        async {
            a.send(2, numbered(5).with_key(Key(2)), T).await?;
            b.receive(1, Some(Key(2)), T).await
        },
    );
    assert!(blocked.unwrap_err().is_timeout());
    assert_eq!(delivered?.decode::<u32>()?, 5);
    Ok(())
}

#[tokio::test]
async fn full_mailbox_is_retried_until_drained() -> Result<(), Error> {
    let net = LocalNetwork::new();
    let options = ChannelOptions {
        mailbox_capacity: 1,
        retry_interval: Duration::from_millis(5),
    };
    let a = net.endpoint_with_options(1, &options);
    let b = net.endpoint_with_options(2, &options);
    a.send(2, numbered(1), T).await?;
    let (sent, first) = tokio::join!(a.send(2, numbered(2), T), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.receive(1, None, T).await
    });
    sent?;
    assert_eq!(first?.decode::<u32>()?, 1);
    assert_eq!(b.receive(1, None, T).await?.decode::<u32>()?, 2);
    Ok(())
}

#[tokio::test]
async fn full_mailbox_times_out() -> Result<(), Error> {
    let net = LocalNetwork::new();
    let options = ChannelOptions {
        mailbox_capacity: 1,
        retry_interval: Duration::from_millis(5),
    };
    let a = net.endpoint_with_options(1, &options);
    let _b = net.endpoint_with_options(2, &options);
    a.send(2, numbered(1), T).await?;
    let err = a
        .send(2, numbered(2), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SendTimeout {
            peer: 2,
            kind: MessageKind::MulDataShare,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn down_party_is_a_transport_failure() {
    let net = LocalNetwork::new();
    let a = net.endpoint(1);
    let _b = net.endpoint(2);
    net.set_down(2, true);
    let err = a.send(2, numbered(1), T).await.unwrap_err();
    assert!(!err.is_timeout());
    assert!(matches!(err, Error::TransportFailure { peer: 2, .. }));
    net.set_down(2, false);
    assert!(a.send(2, numbered(1), T).await.is_ok());
}

#[tokio::test]
async fn reset_clears_mailboxes() -> Result<(), Error> {
    let net = LocalNetwork::new();
    let a = net.endpoint(1);
    let b = net.endpoint(2);
    a.send(2, numbered(1), T).await?;
    a.send(2, numbered(2).with_key(Key(3)), T).await?;
    assert_eq!(b.mailboxes().pending(), 2);
    b.reset();
    assert_eq!(b.mailboxes().pending(), 0);
    assert!(
        b.receive(1, None, Duration::from_millis(20))
            .await
            .unwrap_err()
            .is_timeout()
    );
    a.send(2, numbered(3), T).await?;
    assert_eq!(b.receive(1, None, T).await?.decode::<u32>()?, 3);
    Ok(())
}
