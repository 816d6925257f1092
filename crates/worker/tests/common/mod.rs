#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    AttemptOutcome, DeliveryTag, MailSession, MailTransport, OutgoingMail, PublishOptions,
    QueueConnector, Result, Subscription, TaskEnvelope, TaskQueue, TransportCredentials,
    TransportError, TransportResult,
};
use courier_worker::{ConsumerSettings, Deliverer};

pub const TASK_QUEUE: &str = "email_queue";
pub const DEAD_LETTER_QUEUE: &str = "email_queue.dead_letter";

pub fn settings() -> ConsumerSettings {
    ConsumerSettings {
        task_queue: TASK_QUEUE.to_string(),
        dead_letter_queue: Some(DEAD_LETTER_QUEUE.to_string()),
        consumer_tag: "test-worker".to_string(),
        prefetch: 10,
        max_in_flight: 1,
        attempt_timeout: Duration::from_secs(5),
        max_redeliveries: Some(10),
    }
}

pub fn envelope(recipient: &str) -> TaskEnvelope {
    TaskEnvelope::new(recipient, "S", "B").unwrap()
}

/// 轮询条件直到成立，最多等待5秒
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// 按收件人预设结果的投递器，未预设的收件人一律投递成功
#[derive(Default)]
pub struct ScriptedDeliverer {
    scripts: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    attempts: Mutex<Vec<TaskEnvelope>>,
    delay: Option<Duration>,
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedDeliverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn script(&self, recipient: &str, outcomes: impl IntoIterator<Item = AttemptOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(recipient.to_string(), outcomes.into_iter().collect());
    }

    pub fn attempts(&self) -> Vec<TaskEnvelope> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempted_recipients(&self) -> Vec<String> {
        self.attempts()
            .iter()
            .map(|envelope| envelope.recipient().to_string())
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn attempt(&self, envelope: &TaskEnvelope, _bounded_timeout: Duration) -> AttemptOutcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(envelope.recipient())
            .and_then(VecDeque::pop_front)
            .unwrap_or(AttemptOutcome::Delivered);

        self.attempts.lock().unwrap().push(envelope.clone());
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// 发送阶段的预设行为
#[derive(Debug, Clone)]
pub enum SendBehavior {
    Accept,
    Fail(TransportError),
    Hang,
}

#[derive(Debug, Default)]
pub struct TransportCounters {
    pub connects: AtomicUsize,
    pub authentications: AtomicUsize,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
    pub live_sessions: AtomicUsize,
}

/// 内存中的邮件传输端点
pub struct FakeTransport {
    pub counters: Arc<TransportCounters>,
    connect_error: Option<TransportError>,
    connect_delay: Option<Duration>,
    send_behavior: SendBehavior,
    hang_on_close: bool,
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
}

impl FakeTransport {
    pub fn new(send_behavior: SendBehavior) -> Self {
        Self {
            counters: Arc::new(TransportCounters::default()),
            connect_error: None,
            connect_delay: None,
            send_behavior,
            hang_on_close: false,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn refusing(error: TransportError) -> Self {
        Self {
            connect_error: Some(error),
            ..Self::new(SendBehavior::Accept)
        }
    }

    /// 建立连接前先等待 `delay`
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn hanging_on_close(mut self) -> Self {
        self.hang_on_close = true;
        self
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn connect(&self) -> TransportResult<Box<dyn MailSession>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.connect_error {
            return Err(error.clone());
        }

        self.counters.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            counters: Arc::clone(&self.counters),
            send_behavior: self.send_behavior.clone(),
            hang_on_close: self.hang_on_close,
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct FakeSession {
    counters: Arc<TransportCounters>,
    send_behavior: SendBehavior,
    hang_on_close: bool,
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
}

#[async_trait]
impl MailSession for FakeSession {
    async fn authenticate(&mut self, _credentials: &TransportCredentials) -> TransportResult<()> {
        self.counters.authentications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, mail: &OutgoingMail) -> TransportResult<()> {
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        match &self.send_behavior {
            SendBehavior::Accept => {
                self.sent.lock().unwrap().push(mail.clone());
                Ok(())
            }
            SendBehavior::Fail(error) => Err(error.clone()),
            SendBehavior::Hang => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.counters.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 每次 ack 都结算两次的队列包装，用来触发不变量错误
pub struct AckTwiceQueue {
    inner: Arc<dyn TaskQueue>,
}

#[async_trait]
impl TaskQueue for AckTwiceQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.inner.ensure_queue(queue).await
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.inner.publish(queue, payload, options).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Subscription> {
        self.inner.subscribe(queue, consumer_tag, prefetch).await
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        self.inner.unsubscribe(consumer_tag).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.inner.ack(tag).await?;
        self.inner.ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.inner.nack(tag, requeue).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

pub fn ack_twice(inner: Arc<dyn TaskQueue>) -> Arc<dyn TaskQueue> {
    Arc::new(AckTwiceQueue { inner })
}

/// 给每个连接套上 `AckTwiceQueue` 的连接器
pub struct AckTwiceConnector<C> {
    pub inner: C,
}

#[async_trait]
impl<C: QueueConnector> QueueConnector for AckTwiceConnector<C> {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>> {
        Ok(ack_twice(self.inner.connect().await?))
    }
}
