use async_trait::async_trait;
use courier_core::{
    Delivery, DeliveryTag, DispatchError, PublishOptions, Result, Subscription, TaskQueue,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 内存 broker
///
/// 模拟持久化队列的语义：具名队列、手动确认、重新入队的消息回到队首并带上
/// `redelivered` 标记、连接关闭时未结算的消息全部重新入队。适用于嵌入式部署和测试。
/// 克隆得到的是同一个 broker。
///
/// 结算日志和投递计数只在 [`InMemoryBroker::with_recording`] 创建的 broker 上记录，
/// 长时间运行的嵌入式 broker 只保存排队中和未结算的消息。
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

#[derive(Debug, Default)]
struct BrokerShared {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_connection_id: AtomicU64,
    unavailable: AtomicBool,
    recording: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    settlements: Vec<SettlementRecord>,
    delivery_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    message_id: Option<String>,
    persistent: bool,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    connection_id: u64,
    consumer_tag: String,
    queue: String,
    message: StoredMessage,
}

/// broker 记录下来的一次结算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementRecord {
    Ack(DeliveryTag),
    Nack { tag: DeliveryTag, requeue: bool },
}

impl SettlementRecord {
    pub fn tag(&self) -> DeliveryTag {
        match self {
            Self::Ack(tag) => *tag,
            Self::Nack { tag, .. } => *tag,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录每次结算和每条消息投递次数的 broker，供测试检查
    pub fn with_recording() -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                recording: true,
                ..BrokerShared::default()
            }),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording
    }

    /// 打开一个新的连接句柄
    pub fn connect(&self) -> Result<InMemoryTaskQueue> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(DispatchError::Connection("内存broker不可用".to_string()));
        }
        let connection_id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!("打开内存broker连接 {}", connection_id);
        Ok(InMemoryTaskQueue {
            broker: self.clone(),
            connection_id,
            closed: Arc::new(AtomicBool::new(false)),
            consumers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// 模拟 broker 不可达
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_unavailable(&self) -> bool {
        self.shared.unavailable.load(Ordering::SeqCst)
    }

    pub async fn queue_count(&self) -> usize {
        self.shared.state.lock().await.queues.len()
    }

    pub async fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub async fn unacked_count(&self) -> usize {
        self.shared.state.lock().await.unacked.len()
    }

    /// 队列中待投递消息的负载（不出队）
    pub async fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// 队列中的消息是否都是持久化消息
    pub async fn all_persistent(&self, queue: &str) -> bool {
        self.shared
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .is_some_and(|messages| messages.iter().all(|m| m.persistent))
    }

    /// 已记录的结算，未开启记录时为空
    pub async fn settlements(&self) -> Vec<SettlementRecord> {
        self.shared.state.lock().await.settlements.clone()
    }

    /// 指定消息被投递给消费者的次数，未开启记录时为 0
    pub async fn delivery_count(&self, message_id: &str) -> u32 {
        self.shared
            .state
            .lock()
            .await
            .delivery_counts
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.is_unavailable() {
            return Err(DispatchError::Connection("内存broker不可用".to_string()));
        }
        Ok(())
    }

    /// 取出队首消息并登记为未结算；该消费者未结算数达到预取上限时不投递
    async fn take_next(
        &self,
        connection_id: u64,
        consumer_tag: &str,
        queue: &str,
        prefetch: usize,
    ) -> Option<Delivery> {
        let mut state = self.shared.state.lock().await;
        let in_flight = state
            .unacked
            .values()
            .filter(|entry| {
                entry.connection_id == connection_id && entry.consumer_tag == consumer_tag
            })
            .count();
        if in_flight >= prefetch {
            return None;
        }
        let message = state.queues.get_mut(queue)?.pop_front()?;

        state.next_tag += 1;
        let tag = state.next_tag;
        if self.shared.recording {
            if let Some(id) = &message.message_id {
                *state.delivery_counts.entry(id.clone()).or_insert(0) += 1;
            }
        }

        let delivery = Delivery {
            tag: DeliveryTag(tag),
            payload: message.payload.clone(),
            message_id: message.message_id.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(
            tag,
            Unacked {
                connection_id,
                consumer_tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                message,
            },
        );
        Some(delivery)
    }

    async fn settle(
        &self,
        connection_id: u64,
        tag: DeliveryTag,
        record: SettlementRecord,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let owned = state
            .unacked
            .get(&tag.0)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if !owned {
            return Err(DispatchError::InvariantViolation(format!(
                "投递标签 {tag} 未签发或已结算"
            )));
        }

        if let Some(entry) = state.unacked.remove(&tag.0) {
            if let SettlementRecord::Nack { requeue: true, .. } = record {
                let mut message = entry.message;
                message.redelivered = true;
                state
                    .queues
                    .entry(entry.queue)
                    .or_default()
                    .push_front(message);
            }
        }
        if self.shared.recording {
            state.settlements.push(record);
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// 连接关闭：该连接上所有未结算的消息重新入队
    async fn release_connection(&self, connection_id: u64) -> usize {
        let mut state = self.shared.state.lock().await;
        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, entry)| entry.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        // 按签发顺序倒序放回队首，保持原有顺序
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in &tags {
            if let Some(entry) = state.unacked.remove(tag) {
                let mut message = entry.message;
                message.redelivered = true;
                state
                    .queues
                    .entry(entry.queue)
                    .or_default()
                    .push_front(message);
            }
        }
        drop(state);

        self.shared.notify.notify_waiters();
        tags.len()
    }
}

/// 内存 broker 上的一个连接句柄
#[derive(Debug, Clone)]
pub struct InMemoryTaskQueue {
    broker: InMemoryBroker,
    connection_id: u64,
    closed: Arc<AtomicBool>,
    consumers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl InMemoryTaskQueue {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Connection("连接已关闭".to_string()));
        }
        self.broker.check_available()
    }

    async fn pump(
        broker: InMemoryBroker,
        connection_id: u64,
        closed: Arc<AtomicBool>,
        queue: String,
        consumer_tag: String,
        prefetch: usize,
        tx: mpsc::Sender<Delivery>,
    ) {
        loop {
            // 先占住通道容量再出队，出队与发送之间没有挂起点
            let permit = match tx.reserve().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            loop {
                let notified = broker.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if closed.load(Ordering::SeqCst) {
                    return;
                }
                if !broker.is_unavailable() {
                    let next = broker
                        .take_next(connection_id, &consumer_tag, &queue, prefetch)
                        .await;
                    if let Some(delivery) = next {
                        permit.send(delivery);
                        break;
                    }
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = tx.closed() => return,
                }
            }
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.shared.state.lock().await;
        if !state.queues.contains_key(queue) {
            state.queues.insert(queue.to_string(), VecDeque::new());
            info!("Created queue '{}' (durable: true)", queue);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.broker.shared.state.lock().await;
            match state.queues.get_mut(queue) {
                Some(messages) => messages.push_back(StoredMessage {
                    payload: payload.to_vec(),
                    message_id: options.message_id,
                    persistent: options.persistent,
                    redelivered: false,
                }),
                None => {
                    // 与默认交换机一致：无法路由的消息被丢弃
                    warn!("队列 '{}' 不存在，消息被丢弃", queue);
                    return Ok(());
                }
            }
        }
        self.broker.shared.notify.notify_waiters();
        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        if !self.broker.shared.state.lock().await.queues.contains_key(queue) {
            return Err(DispatchError::Connection(format!("队列 '{queue}' 不存在")));
        }

        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);
        let handle = tokio::spawn(Self::pump(
            self.broker.clone(),
            self.connection_id,
            Arc::clone(&self.closed),
            queue.to_string(),
            consumer_tag.to_string(),
            prefetch,
            tx,
        ));

        if let Some(previous) = self
            .consumers
            .lock()
            .await
            .insert(consumer_tag.to_string(), handle)
        {
            previous.abort();
        }

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);
        Ok(Subscription::new(consumer_tag, rx))
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        if let Some(handle) = self.consumers.lock().await.remove(consumer_tag) {
            handle.abort();
            debug!("消费者 {} 已取消", consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .settle(self.connection_id, tag, SettlementRecord::Ack(tag))
            .await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .settle(
                self.connection_id,
                tag,
                SettlementRecord::Nack { tag, requeue },
            )
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (_, handle) in self.consumers.lock().await.drain() {
            handle.abort();
        }

        let released = self.broker.release_connection(self.connection_id).await;
        if released > 0 {
            info!("连接关闭，{} 条未结算消息重新入队", released);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.broker.is_unavailable()
    }
}
