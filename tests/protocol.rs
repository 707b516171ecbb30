use std::{collections::BTreeMap, sync::Arc, time::Duration};

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sharemul::{
    channel::{self, LocalNetwork, LocalTransport},
    config::Timeouts,
    layer::{self, FeatureModel, LayerShapes, LayerShares},
    matrix::{Matrix, Shape},
    message::{MessageKind, PartyId},
    mul::{self, SecureMultiplier, Step},
    producer::{self, TripleProducer},
    triple::{OperandPosition, Proposal},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

const PRODUCER: PartyId = 0;

fn init_tracing() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

struct RunningProducer {
    producer: Arc<TripleProducer<LocalTransport>>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<usize, producer::Error>>,
}

impl RunningProducer {
    fn start(net: &LocalNetwork, peers: &[PartyId], timeouts: Timeouts) -> Self {
        let producer = Arc::new(TripleProducer::with_rng(
            net.endpoint(PRODUCER),
            timeouts,
            ChaCha20Rng::seed_from_u64(42),
        ));
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&producer).run(peers.to_vec(), stopped));
        Self {
            producer,
            stop,
            handle,
        }
    }

    async fn stop(self) -> usize {
        self.stop.send_replace(true);
        self.handle.await.unwrap().unwrap()
    }
}

fn random(shape: (usize, usize), rng: &mut ChaCha20Rng) -> Matrix {
    Matrix::random_uniform(shape, -1.0, 1.0, rng)
}

#[tokio::test]
async fn shares_sum_to_the_product() -> Result<(), mul::Error> {
    let _g = init_tracing();
    let net = LocalNetwork::new();
    let producer = RunningProducer::start(&net, &[1, 2], Timeouts::default());
    let (alice, bob) = (net.endpoint(1), net.endpoint(2));
    let alice = SecureMultiplier::new(&alice, PRODUCER, Timeouts::default());
    let bob = SecureMultiplier::new(&bob, PRODUCER, Timeouts::default());

    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let shapes = [(1, 1, 1), (4, 3, 2), (2, 7, 5), (16, 8, 1)];
    for &(m, k, n) in &shapes {
        let a = random((m, k), &mut rng);
        let b = random((k, n), &mut rng);
        let (left, right) = tokio::try_join!(
            alice.multiply_as_left(2, b.shape(), &a),
            bob.multiply_as_right(1, a.shape(), &b),
        )?;
        let expected = a.matmul(&b)?;
        assert_eq!(left.shape(), Shape::new(m, n));
        assert!(left.checked_add(&right)?.approx_eq(&expected, 1e-6));
        assert!(!left.approx_eq(&expected, 1e-6));
    }

    assert_eq!(producer.producer.pending_count(), 0);
    assert_eq!(producer.stop().await, shapes.len());
    Ok(())
}

async fn multiply_once(m: usize, k: usize, n: usize, seed: u64) -> Result<(Matrix, Matrix), mul::Error> {
    let net = LocalNetwork::new();
    let producer = RunningProducer::start(&net, &[1, 2], Timeouts::default());
    let (alice, bob) = (net.endpoint(1), net.endpoint(2));
    let alice = SecureMultiplier::new(&alice, PRODUCER, Timeouts::default());
    let bob = SecureMultiplier::new(&bob, PRODUCER, Timeouts::default());

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let a = random((m, k), &mut rng);
    let b = random((k, n), &mut rng);
    let (left, right) = tokio::try_join!(
        alice.multiply_as_left(2, b.shape(), &a),
        bob.multiply_as_right(1, a.shape(), &b),
    )?;
    assert_eq!(producer.stop().await, 1);
    Ok((left.checked_add(&right)?, a.matmul(&b)?))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn any_product_is_shared_correctly(m in 1usize..9, k in 1usize..9, n in 1usize..9, seed in any::<u64>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (sum, expected) = rt.block_on(multiply_once(m, k, n, seed)).unwrap();
        prop_assert_eq!(sum.shape(), Shape::new(m, n));
        prop_assert!(sum.approx_eq(&expected, 1e-6));
    }
}

#[tokio::test]
async fn aborted_session_does_not_disturb_the_next() -> Result<(), mul::Error> {
    let _g = init_tracing();
    let net = LocalNetwork::new();
    let producer = RunningProducer::start(&net, &[1, 2], Timeouts::default());
    let (alice_endpoint, bob_endpoint) = (net.endpoint(1), net.endpoint(2));
    let impatient = Timeouts {
        triple: Duration::from_millis(150),
        receive: Duration::from_millis(150),
        ..Timeouts::default()
    };

    let mut rng = ChaCha20Rng::seed_from_u64(4);
    let a = random((3, 4), &mut rng);
    let b = random((4, 2), &mut rng);

    // alice gives up on her triple before bob even proposes, bob then waits in vain for alice's operand share
    let alice = SecureMultiplier::new(&alice_endpoint, PRODUCER, impatient);
    let bob = SecureMultiplier::new(&bob_endpoint, PRODUCER, impatient);
    let (left, right) = tokio::join!(alice.multiply_as_left(2, b.shape(), &a), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        bob.multiply_as_right(1, a.shape(), &b).await
    });
    let (left, right) = (left.unwrap_err(), right.unwrap_err());
    assert!(left.is_timeout());
    assert_eq!(left.step(), Some(Step::ReceiveTriple));
    assert!(right.is_timeout());
    assert_eq!(right.step(), Some(Step::ExchangeShares));
    // the late triple and bob's operand share are still waiting for alice
    assert_eq!(alice_endpoint.mailboxes().pending(), 2);

    let alice = SecureMultiplier::new(&alice_endpoint, PRODUCER, Timeouts::default());
    let bob = SecureMultiplier::new(&bob_endpoint, PRODUCER, Timeouts::default());
    let (left, right) = tokio::try_join!(
        alice.multiply_as_left(2, b.shape(), &a),
        bob.multiply_as_right(1, a.shape(), &b),
    )?;
    assert!(left.checked_add(&right)?.approx_eq(&a.matmul(&b)?, 1e-6));
    assert_eq!(alice_endpoint.mailboxes().pending(), 0);
    assert_eq!(bob_endpoint.mailboxes().pending(), 0);
    assert_eq!(producer.producer.pending_count(), 0);
    assert_eq!(producer.stop().await, 2);
    Ok(())
}

#[tokio::test]
async fn cross_multiplication_in_both_directions() -> Result<(), mul::Error> {
    let _g = init_tracing();
    let net = LocalNetwork::new();
    let producer = RunningProducer::start(&net, &[3, 8], Timeouts::default());
    let (low, high) = (net.endpoint(3), net.endpoint(8));
    let low = SecureMultiplier::new(&low, PRODUCER, Timeouts::default());
    let high = SecureMultiplier::new(&high, PRODUCER, Timeouts::default());

    let mut rng = ChaCha20Rng::seed_from_u64(2);
    let x_low = random((6, 3), &mut rng);
    let w_low = random((4, 2), &mut rng);
    let x_high = random((6, 4), &mut rng);
    let w_high = random((3, 2), &mut rng);

    let (low_shares, high_shares) = tokio::try_join!(
        low.cross_multiply(8, &x_low, w_high.shape(), &w_low, x_high.shape()),
        high.cross_multiply(3, &x_high, w_low.shape(), &w_high, x_low.shape()),
    )?;
    let low_times_high = low_shares.as_left.checked_add(&high_shares.as_right)?;
    assert!(low_times_high.approx_eq(&x_low.matmul(&w_high)?, 1e-6));
    let high_times_low = high_shares.as_left.checked_add(&low_shares.as_right)?;
    assert!(high_times_low.approx_eq(&x_high.matmul(&w_low)?, 1e-6));

    assert_eq!(producer.stop().await, 2);
    Ok(())
}

#[tokio::test]
async fn lower_id_proposes_first_operand_first() -> Result<(), channel::Error> {
    let _g = init_tracing();
    let net = LocalNetwork::new();
    let inspector = net.endpoint(PRODUCER);
    let (low, high) = (net.endpoint(5), net.endpoint(11));
    let impatient = Timeouts {
        triple: Duration::from_millis(100),
        ..Timeouts::default()
    };
    let low = SecureMultiplier::new(&low, PRODUCER, impatient);
    let high = SecureMultiplier::new(&high, PRODUCER, impatient);
    let x = Matrix::zeros((2, 2));

    let t = Duration::from_secs(1);
    let (low_result, high_result, proposals) = tokio::join!(
        low.cross_multiply(11, &x, x.shape(), &x, x.shape()),
        high.cross_multiply(5, &x, x.shape(), &x, x.shape()),
        async {
            let from_low: Proposal = inspector
                .recv_value(5, MessageKind::SetTriplet, None, t)
                .await?;
            let from_high: Proposal = inspector
                .recv_value(11, MessageKind::SetTriplet, None, t)
                .await?;
            Ok::<_, channel::Error>((from_low, from_high))
        },
    );
    let (from_low, from_high) = proposals?;
    assert_eq!(from_low.position, OperandPosition::First);
    assert_eq!(from_low.peer, 11);
    assert_eq!(from_high.position, OperandPosition::Second);
    assert_eq!(from_high.peer, 5);
    for result in [low_result, high_result] {
        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.step(), Some(Step::ReceiveTriple));
    }
    Ok(())
}

#[tokio::test]
async fn mismatched_proposals_time_out() {
    let _g = init_tracing();
    let net = LocalNetwork::new();
    let timeouts = Timeouts {
        triple: Duration::from_millis(200),
        ..Timeouts::default()
    };
    let producer = RunningProducer::start(&net, &[1, 2], timeouts);
    let (alice, bob) = (net.endpoint(1), net.endpoint(2));
    let alice = SecureMultiplier::new(&alice, PRODUCER, timeouts);
    let bob = SecureMultiplier::new(&bob, PRODUCER, timeouts);

    let a = Matrix::zeros((4, 3));
    let b = Matrix::zeros((3, 5));
    let (left, right) = tokio::join!(
        alice.multiply_as_left(2, Shape::new(3, 2), &a),
        bob.multiply_as_right(1, a.shape(), &b),
    );
    for err in [left.unwrap_err(), right.unwrap_err()] {
        assert!(err.is_timeout());
        assert_eq!(err.step(), Some(Step::ReceiveTriple));
    }
    assert_eq!(producer.producer.pending_count(), 1);
    assert_eq!(producer.stop().await, 0);
}

#[tokio::test]
async fn unreachable_producer_fails_the_session() {
    let _g = init_tracing();
    let net = LocalNetwork::new();
    let _producer = net.endpoint(PRODUCER);
    net.set_down(PRODUCER, true);
    let alice = net.endpoint(1);
    let alice = SecureMultiplier::new(&alice, PRODUCER, Timeouts::default());
    let a = Matrix::zeros((2, 2));
    let err = alice
        .multiply_as_left(2, a.shape(), &a)
        .await
        .unwrap_err();
    assert!(!err.is_timeout());
    assert!(matches!(
        err,
        mul::Error::Channel {
            step: Step::RequestTriple,
            source: channel::Error::TransportFailure { peer: PRODUCER, .. },
        }
    ));
}

struct FixedModel {
    batch: Matrix,
    parameters: BTreeMap<PartyId, Matrix>,
    consumed: Option<LayerShares>,
}

impl FeatureModel for FixedModel {
    fn batch(&self) -> &Matrix {
        &self.batch
    }

    fn parameters(&self, party: PartyId) -> Option<&Matrix> {
        self.parameters.get(&party)
    }

    fn consume(&mut self, shares: &LayerShares) {
        self.consumed = Some(shares.clone());
    }
}

#[tokio::test]
async fn three_party_layer() -> Result<(), layer::Error> {
    let _g = init_tracing();
    const COORDINATOR: PartyId = 9;
    let parties = [1, 2, 3];
    let shapes = LayerShapes {
        batch_size: 5,
        out_dim: 2,
        feature_dims: BTreeMap::from([(1, 3), (2, 1), (3, 4)]),
    };
    let net = LocalNetwork::new();
    let producer = RunningProducer::start(&net, &parties, Timeouts::default());
    let coordinator = net.endpoint(COORDINATOR);

    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let mut models: Vec<FixedModel> = parties
        .iter()
        .map(|&p| FixedModel {
            batch: Matrix::random_uniform(shapes.batch_shape(p).unwrap(), -1.0, 1.0, &mut rng),
            parameters: BTreeMap::new(),
            consumed: None,
        })
        .collect();
    let mut expected = Matrix::zeros((shapes.batch_size, shapes.out_dim));
    for (qi, &q) in parties.iter().enumerate() {
        let theta = Matrix::random_uniform(shapes.parameter_shape(q).unwrap(), -1.0, 1.0, &mut rng);
        expected = expected.checked_add(&models[qi].batch.matmul(&theta)?)?;
        // three additive shares of theta, one per party
        let (first, rest) = theta.split_additive_with(&mut rng);
        let (second, third) = rest.split_additive_with(&mut rng);
        for (model, share) in models.iter_mut().zip([first, second, third]) {
            model.parameters.insert(q, share);
        }
    }

    let endpoints: Vec<_> = parties.iter().map(|&p| net.endpoint(p)).collect();
    let multipliers: Vec<_> = endpoints
        .iter()
        .map(|e| SecureMultiplier::new(e, PRODUCER, Timeouts::default()))
        .collect();
    let [m1, m2, m3] = &mut models[..] else {
        panic!("three models");
    };
    let (s1, s2, s3) = tokio::try_join!(
        layer::forward(&multipliers[0], &shapes, m1),
        layer::forward(&multipliers[1], &shapes, m2),
        layer::forward(&multipliers[2], &shapes, m3),
    )?;
    for (endpoint, shares) in endpoints.iter().zip([&s1, &s2, &s3]) {
        assert_eq!(shares.as_left.len(), 2);
        assert_eq!(shares.as_right.len(), 2);
        layer::report(endpoint, COORDINATOR, shares, Duration::from_secs(1)).await?;
    }
    assert!(models.iter().all(|m| m.consumed.is_some()));

    let output = layer::collect(&coordinator, parties, Duration::from_secs(1)).await?;
    assert!(output.approx_eq(&expected, 1e-6));
    assert_eq!(producer.stop().await, 6);
    Ok(())
}
