mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{envelope, settings, wait_until, ScriptedDeliverer, DEAD_LETTER_QUEUE, TASK_QUEUE};
use courier_core::{AttemptOutcome, PublishOptions, Result, TaskEnvelope, TaskQueue};
use courier_infrastructure::{InMemoryBroker, SettlementRecord};
use courier_worker::{ConsumerSettings, ConsumerStats, ConsumptionLoop};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Harness {
    broker: InMemoryBroker,
    queue: Arc<dyn TaskQueue>,
    stats: Arc<ConsumerStats>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl Harness {
    async fn start(settings: ConsumerSettings, deliverer: Arc<ScriptedDeliverer>) -> Self {
        Self::start_with(settings, deliverer, |queue| queue).await
    }

    async fn start_with(
        settings: ConsumerSettings,
        deliverer: Arc<ScriptedDeliverer>,
        wrap: impl FnOnce(Arc<dyn TaskQueue>) -> Arc<dyn TaskQueue>,
    ) -> Self {
        let broker = InMemoryBroker::with_recording();
        let queue = wrap(Arc::new(broker.connect().unwrap()));
        queue.ensure_queue(&settings.task_queue).await.unwrap();
        if let Some(dead_letter_queue) = &settings.dead_letter_queue {
            queue.ensure_queue(dead_letter_queue).await.unwrap();
        }

        let subscription = queue
            .subscribe(&settings.task_queue, &settings.consumer_tag, settings.prefetch)
            .await
            .unwrap();

        let stats = Arc::new(ConsumerStats::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let consumption_loop =
            ConsumptionLoop::new(Arc::clone(&queue), deliverer, settings, Arc::clone(&stats));
        let handle = tokio::spawn(consumption_loop.run(subscription, shutdown_rx));

        Self {
            broker,
            queue,
            stats,
            shutdown_tx,
            handle,
        }
    }

    async fn publish(&self, envelope: &TaskEnvelope, message_id: &str) {
        self.publish_raw(&envelope.to_bytes().unwrap(), message_id)
            .await;
    }

    async fn publish_raw(&self, payload: &[u8], message_id: &str) {
        self.queue
            .publish(
                TASK_QUEUE,
                payload,
                PublishOptions::default().with_message_id(message_id),
            )
            .await
            .unwrap();
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await.unwrap()
    }
}

#[tokio::test]
async fn test_delivered_message_is_acked_once() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;

    let sent = envelope("a@x.com");
    harness.publish(&sent, "m-1").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().acked == 1 }
    })
    .await;

    let attempts = deliverer.attempts();
    assert_eq!(attempts, vec![sent]);
    assert_eq!(attempts[0].subject(), "S");
    assert_eq!(attempts[0].body(), "B");

    let broker = harness.broker.clone();
    assert_eq!(broker.ready_count(TASK_QUEUE).await, 0);
    assert_eq!(broker.unacked_count().await, 0);
    assert_eq!(broker.delivery_count("m-1").await, 1);
    let settlements = broker.settlements().await;
    assert_eq!(settlements.len(), 1);
    assert!(matches!(settlements[0], SettlementRecord::Ack(_)));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_are_redelivered_until_delivered() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    deliverer.script(
        "a@x.com",
        [
            AttemptOutcome::TransientFailure("421 try later".into()),
            AttemptOutcome::TransientFailure("421 try later".into()),
            AttemptOutcome::Timeout,
            AttemptOutcome::Delivered,
        ],
    );
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;
    harness.publish(&envelope("a@x.com"), "m-1").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().acked == 1 }
    })
    .await;

    let broker = harness.broker.clone();
    assert_eq!(broker.delivery_count("m-1").await, 4);
    assert_eq!(deliverer.attempt_count(), 4);

    let settlements = broker.settlements().await;
    assert_eq!(settlements.len(), 4);
    for record in &settlements[..3] {
        assert!(matches!(record, SettlementRecord::Nack { requeue: true, .. }));
    }
    assert!(matches!(settlements[3], SettlementRecord::Ack(_)));

    let snapshot = harness.stats.snapshot();
    assert_eq!(snapshot.requeued, 3);
    assert_eq!(snapshot.acked, 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_payload_is_dropped_without_delivery() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;

    let bytes = envelope("a@x.com").to_bytes().unwrap();
    harness.publish_raw(&bytes[..bytes.len() / 2], "m-1").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().rejected == 1 }
    })
    .await;

    assert_eq!(deliverer.started(), 0);
    assert_eq!(harness.stats.snapshot().malformed, 1);

    let broker = harness.broker.clone();
    assert_eq!(broker.ready_count(TASK_QUEUE).await, 0);
    let settlements = broker.settlements().await;
    assert_eq!(settlements.len(), 1);
    assert!(matches!(
        settlements[0],
        SettlementRecord::Nack { requeue: false, .. }
    ));

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_is_dropped() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    deliverer.script(
        "gone@x.com",
        [AttemptOutcome::PermanentFailure("550 no such user".into())],
    );
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;
    harness.publish(&envelope("gone@x.com"), "m-1").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().rejected == 1 }
    })
    .await;

    let broker = harness.broker.clone();
    assert_eq!(broker.ready_count(TASK_QUEUE).await, 0);
    assert_eq!(broker.delivery_count("m-1").await, 1);
    assert_eq!(harness.stats.snapshot().malformed, 0);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_redelivery_cap_moves_message_to_dead_letter_queue() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    deliverer.script(
        "poison@x.com",
        std::iter::repeat(AttemptOutcome::TransientFailure("451".into())).take(10),
    );
    let mut settings = settings();
    settings.max_redeliveries = Some(2);
    let harness = Harness::start(settings, Arc::clone(&deliverer)).await;

    let poison = envelope("poison@x.com");
    harness.publish(&poison, "m-poison").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().dead_lettered == 1 }
    })
    .await;

    let broker = harness.broker.clone();
    assert_eq!(broker.delivery_count("m-poison").await, 3);
    assert_eq!(broker.ready_count(TASK_QUEUE).await, 0);
    assert_eq!(
        broker.ready_payloads(DEAD_LETTER_QUEUE).await,
        vec![poison.to_bytes().unwrap()]
    );
    assert!(broker.all_persistent(DEAD_LETTER_QUEUE).await);
    assert_eq!(harness.stats.snapshot().requeued, 2);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_redelivery_cap_without_dead_letter_queue_rejects() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    deliverer.script(
        "poison@x.com",
        std::iter::repeat(AttemptOutcome::Timeout).take(10),
    );
    let mut settings = settings();
    settings.max_redeliveries = Some(1);
    settings.dead_letter_queue = None;
    let harness = Harness::start(settings, Arc::clone(&deliverer)).await;
    harness.publish(&envelope("poison@x.com"), "m-poison").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().rejected == 1 }
    })
    .await;

    assert_eq!(deliverer.attempt_count(), 2);
    assert_eq!(harness.broker.ready_count(TASK_QUEUE).await, 0);
    assert_eq!(harness.stats.snapshot().dead_lettered, 0);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_in_flight_preserves_broker_order() {
    let deliverer = Arc::new(ScriptedDeliverer::with_delay(Duration::from_millis(5)));
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;

    let recipients: Vec<String> = (0..6).map(|i| format!("user{i}@x.com")).collect();
    for (i, recipient) in recipients.iter().enumerate() {
        harness.publish(&envelope(recipient), &format!("m-{i}")).await;
    }

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().acked == 6 }
    })
    .await;

    assert_eq!(deliverer.attempted_recipients(), recipients);
    assert_eq!(deliverer.max_active(), 1);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_max_in_flight_bounds_concurrency() {
    let deliverer = Arc::new(ScriptedDeliverer::with_delay(Duration::from_millis(100)));
    let mut settings = settings();
    settings.max_in_flight = 3;
    let harness = Harness::start(settings, Arc::clone(&deliverer)).await;

    for i in 0..9 {
        harness
            .publish(&envelope(&format!("user{i}@x.com")), &format!("m-{i}"))
            .await;
    }

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move { stats.snapshot().acked == 9 }
    })
    .await;

    assert!(deliverer.max_active() > 1);
    assert!(deliverer.max_active() <= 3);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_every_tag_is_settled_exactly_once() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    deliverer.script("t@x.com", [AttemptOutcome::TransientFailure("421".into())]);
    deliverer.script("p@x.com", [AttemptOutcome::PermanentFailure("550".into())]);
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;

    harness.publish(&envelope("a@x.com"), "m-a").await;
    harness.publish(&envelope("t@x.com"), "m-t").await;
    harness.publish(&envelope("p@x.com"), "m-p").await;
    harness.publish_raw(b"{not json", "m-bad").await;

    let stats = Arc::clone(&harness.stats);
    wait_until(|| {
        let stats = Arc::clone(&stats);
        async move {
            let snapshot = stats.snapshot();
            snapshot.acked == 2 && snapshot.rejected == 2
        }
    })
    .await;

    let settlements = harness.broker.settlements().await;
    // a, t(requeue), p, bad, t(redelivered)
    assert_eq!(settlements.len(), 5);
    let tags: HashSet<_> = settlements.iter().map(SettlementRecord::tag).collect();
    assert_eq!(tags.len(), settlements.len());
    assert_eq!(harness.broker.unacked_count().await, 0);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_returns_buffered() {
    let deliverer = Arc::new(ScriptedDeliverer::with_delay(Duration::from_millis(200)));
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;

    for i in 0..5 {
        harness
            .publish(&envelope(&format!("user{i}@x.com")), &format!("m-{i}"))
            .await;
    }

    let broker = harness.broker.clone();
    let watched = Arc::clone(&deliverer);
    wait_until(|| {
        let broker = broker.clone();
        let watched = Arc::clone(&watched);
        async move { watched.started() == 1 && broker.unacked_count().await == 5 }
    })
    .await;

    let stats = Arc::clone(&harness.stats);
    harness.stop().await.unwrap();

    // 正在处理的那条完成并确认，其余缓冲的消息回到队列
    assert_eq!(stats.snapshot().acked, 1);
    assert_eq!(deliverer.started(), 1);
    assert_eq!(broker.unacked_count().await, 0);
    assert_eq!(broker.ready_count(TASK_QUEUE).await, 4);
}

#[tokio::test]
async fn test_environmental_settle_error_is_contained() {
    let deliverer = Arc::new(ScriptedDeliverer::with_delay(Duration::from_millis(200)));
    let harness = Harness::start(settings(), Arc::clone(&deliverer)).await;
    harness.publish(&envelope("a@x.com"), "m-1").await;

    let watched = Arc::clone(&deliverer);
    wait_until(|| {
        let watched = Arc::clone(&watched);
        async move { watched.started() == 1 }
    })
    .await;
    harness.broker.set_unavailable(true);

    let watched = Arc::clone(&deliverer);
    wait_until(|| {
        let watched = Arc::clone(&watched);
        async move { watched.attempt_count() == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!harness.handle.is_finished());
    assert_eq!(harness.stats.snapshot().acked, 0);

    harness.broker.set_unavailable(false);
    let broker = harness.broker.clone();
    let queue = Arc::clone(&harness.queue);
    harness.stop().await.unwrap();

    // 未结算的消息在连接关闭时回到队列
    queue.close().await.unwrap();
    assert_eq!(broker.ready_count(TASK_QUEUE).await, 1);
}

#[tokio::test]
async fn test_invariant_violation_terminates_loop() {
    let deliverer = Arc::new(ScriptedDeliverer::new());
    let harness = Harness::start_with(settings(), Arc::clone(&deliverer), common::ack_twice).await;
    harness.publish(&envelope("a@x.com"), "m-1").await;
    harness.publish(&envelope("b@x.com"), "m-2").await;

    let handle = harness.handle;
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let err = result.unwrap_err();
    assert!(err.is_invariant_violation());
    assert_eq!(deliverer.attempted_recipients(), vec!["a@x.com".to_string()]);
}
