use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    AppConfig, AttemptOutcome, Delivery, DeliveryTag, DispatchError, PublishOptions, Result,
    Subscription, TaskEnvelope, TaskQueue,
};
use metrics::counter;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::Deliverer;

/// 一条消息的结算动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Settlement {
    /// 确认，消息从队列移除
    Ack,
    /// nack(requeue=true)，稍后重投
    Requeue,
    /// nack(requeue=false)，消息被丢弃
    Reject,
    /// 转存到死信队列后确认原消息
    DeadLetter,
}

impl Settlement {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Reject => "reject",
            Self::DeadLetter => "dead_letter",
        }
    }
}

/// 投递结果到结算动作的映射
pub fn decide_settlement(outcome: &AttemptOutcome) -> Settlement {
    match outcome {
        AttemptOutcome::Delivered => Settlement::Ack,
        AttemptOutcome::PermanentFailure(_) => Settlement::Reject,
        AttemptOutcome::TransientFailure(_) | AttemptOutcome::Timeout => Settlement::Requeue,
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub task_queue: String,
    pub dead_letter_queue: Option<String>,
    pub consumer_tag: String,
    pub prefetch: u16,
    pub max_in_flight: usize,
    pub attempt_timeout: Duration,
    pub max_redeliveries: Option<u32>,
}

impl ConsumerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            task_queue: config.message_queue.task_queue.clone(),
            dead_letter_queue: config.message_queue.dead_letter_queue.clone(),
            consumer_tag: config.worker.consumer_tag.clone(),
            prefetch: config.message_queue.prefetch_count,
            max_in_flight: config.worker.max_in_flight.max(1),
            attempt_timeout: config.smtp.attempt_timeout(),
            max_redeliveries: config.worker.max_redeliveries,
        }
    }
}

/// 消费计数器
///
/// `malformed` 是 `rejected` 的子集。
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, settlement: Settlement) {
        let counter = match settlement {
            Settlement::Ack => &self.acked,
            Settlement::Requeue => &self.requeued,
            Settlement::Reject => &self.rejected,
            Settlement::DeadLetter => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
}

/// 同时跟踪的 message_id 数上限
pub const DEFAULT_TRACKED_MESSAGES: usize = 10_000;

/// 按 message_id 统计重新入队次数
///
/// 只记录本消费者看到的重新入队。被其他消费者确认的消息不会在这里清除，
/// 所以跟踪数达到上限时淘汰最早登记的条目，被淘汰的消息重新从 0 计数。
#[derive(Debug)]
pub struct RedeliveryTracker {
    max_redeliveries: Option<u32>,
    capacity: usize,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// message_id -> (重新入队次数, 登记序号)
    counts: HashMap<String, (u32, u64)>,
    /// 按登记先后排列，序号不匹配的是已清除条目的残留
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl TrackerState {
    fn evict_oldest(&mut self) {
        while let Some((seq, message_id)) = self.order.pop_front() {
            if self.counts.get(&message_id).is_some_and(|(_, s)| *s == seq) {
                self.counts.remove(&message_id);
                return;
            }
        }
    }

    fn compact(&mut self) {
        let counts = &self.counts;
        self.order
            .retain(|(seq, id)| counts.get(id).is_some_and(|(_, s)| s == seq));
    }
}

impl RedeliveryTracker {
    pub fn new(max_redeliveries: Option<u32>) -> Self {
        Self::with_capacity(max_redeliveries, DEFAULT_TRACKED_MESSAGES)
    }

    pub fn with_capacity(max_redeliveries: Option<u32>, capacity: usize) -> Self {
        Self {
            max_redeliveries,
            capacity: capacity.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// 记录一次重新入队；超过上限时返回 false
    ///
    /// 没有 message_id 的消息无法跟踪，总是允许重新入队。
    pub async fn allow_requeue(&self, message_id: Option<&str>) -> bool {
        let (Some(max), Some(message_id)) = (self.max_redeliveries, message_id) else {
            return true;
        };

        let mut state = self.state.lock().await;
        if let Some((count, _)) = state.counts.get_mut(message_id) {
            if *count >= max {
                return false;
            }
            *count += 1;
            return true;
        }

        if max == 0 {
            return false;
        }
        if state.counts.len() >= self.capacity {
            state.evict_oldest();
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.counts.insert(message_id.to_string(), (1, seq));
        state.order.push_back((seq, message_id.to_string()));
        true
    }

    pub async fn requeue_count(&self, message_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .counts
            .get(message_id)
            .map_or(0, |(count, _)| *count)
    }

    pub async fn tracked(&self) -> usize {
        self.state.lock().await.counts.len()
    }

    pub async fn clear(&self, message_id: Option<&str>) {
        let Some(message_id) = message_id else {
            return;
        };
        let mut state = self.state.lock().await;
        state.counts.remove(message_id);
        if state.order.len() > self.capacity.saturating_mul(2) {
            state.compact();
        }
    }
}

/// 单条消息处理所需的共享上下文
struct Handler {
    queue: Arc<dyn TaskQueue>,
    deliverer: Arc<dyn Deliverer>,
    settings: ConsumerSettings,
    stats: Arc<ConsumerStats>,
    redeliveries: RedeliveryTracker,
}

impl Handler {
    #[instrument(skip_all, fields(tag = %delivery.tag, message_id = ?delivery.message_id))]
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        let envelope = match TaskEnvelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("无法解析消息 {}，直接丢弃: {}", delivery.tag, e);
                self.stats.record_malformed();
                counter!("courier_deliveries_total", "outcome" => "malformed").increment(1);
                return self.settle(&delivery, Settlement::Reject).await;
            }
        };

        if delivery.redelivered {
            debug!("重投的消息: {}", delivery.tag);
        }

        let outcome = self
            .deliverer
            .attempt(&envelope, self.settings.attempt_timeout)
            .await;
        counter!("courier_deliveries_total", "outcome" => outcome.label()).increment(1);

        let mut settlement = decide_settlement(&outcome);
        if settlement == Settlement::Requeue
            && !self
                .redeliveries
                .allow_requeue(delivery.message_id.as_deref())
                .await
        {
            warn!(
                "消息 {:?} 重投次数超过上限 {:?}",
                delivery.message_id, self.settings.max_redeliveries
            );
            settlement = if self.settings.dead_letter_queue.is_some() {
                Settlement::DeadLetter
            } else {
                Settlement::Reject
            };
        }

        self.settle(&delivery, settlement).await
    }

    /// 执行一次结算，环境类错误在此吸收，不变量错误向上返回
    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<()> {
        let tag = delivery.tag;
        let result = match settlement {
            Settlement::Ack => self.queue.ack(tag).await,
            Settlement::Requeue => self.queue.nack(tag, true).await,
            Settlement::Reject => self.queue.nack(tag, false).await,
            Settlement::DeadLetter => match self.dead_letter(delivery).await {
                Ok(()) => self.queue.ack(tag).await,
                Err(e) if e.is_invariant_violation() => Err(e),
                Err(e) => {
                    // 转存失败，保留计数让下次投递直接进入死信
                    error!("转存死信失败，消息重新入队: {}", e);
                    return self.settle_fallback(tag).await;
                }
            },
        };

        match result {
            Ok(()) => {
                self.stats.record(settlement);
                counter!("courier_settlements_total", "action" => settlement.label())
                    .increment(1);
                if settlement != Settlement::Requeue {
                    self.redeliveries
                        .clear(delivery.message_id.as_deref())
                        .await;
                }
                debug!("消息 {} 结算完成: {}", tag, settlement.label());
                Ok(())
            }
            Err(e) if e.is_invariant_violation() => {
                error!("消息 {} 结算违反不变量: {}", tag, e);
                Err(e)
            }
            Err(e) => {
                warn!("消息 {} 结算失败，等待broker重投: {}", tag, e);
                Ok(())
            }
        }
    }

    async fn settle_fallback(&self, tag: DeliveryTag) -> Result<()> {
        match self.queue.nack(tag, true).await {
            Ok(()) => {
                self.stats.record(Settlement::Requeue);
                counter!("courier_settlements_total", "action" => Settlement::Requeue.label())
                    .increment(1);
                Ok(())
            }
            Err(e) if e.is_invariant_violation() => Err(e),
            Err(e) => {
                warn!("消息 {} 结算失败，等待broker重投: {}", tag, e);
                Ok(())
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<()> {
        let Some(dead_letter_queue) = &self.settings.dead_letter_queue else {
            return Err(DispatchError::Configuration("未配置死信队列".to_string()));
        };

        let options = PublishOptions {
            persistent: true,
            message_id: delivery.message_id.clone(),
        };
        self.queue
            .publish(dead_letter_queue, &delivery.payload, options)
            .await?;

        info!("消息 {:?} 已转存到死信队列 {}", delivery.message_id, dead_letter_queue);
        Ok(())
    }
}

/// 一个订阅上的消费循环
///
/// 每条消息恰好结算一次。`max_in_flight` 为 1 时严格按投递顺序处理。
pub struct ConsumptionLoop {
    handler: Arc<Handler>,
}

impl ConsumptionLoop {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        deliverer: Arc<dyn Deliverer>,
        settings: ConsumerSettings,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        let redeliveries = RedeliveryTracker::new(settings.max_redeliveries);
        Self {
            handler: Arc::new(Handler {
                queue,
                deliverer,
                settings,
                stats,
                redeliveries,
            }),
        }
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.handler.stats.snapshot()
    }

    /// 运行直到收到关闭信号、订阅结束或出现不变量错误
    pub async fn run(
        self,
        mut subscription: Subscription,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let max_in_flight = self.handler.settings.max_in_flight.max(1);
        let mut in_flight: JoinSet<Result<()>> = JoinSet::new();
        let mut failure: Option<DispatchError> = None;

        info!(
            "消费者 {} 开始处理队列 {}",
            subscription.consumer_tag, self.handler.settings.task_queue
        );

        while failure.is_none() {
            if in_flight.len() >= max_in_flight {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    Some(joined) = in_flight.join_next() => {
                        failure = Self::check_handler(joined);
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    failure = Self::check_handler(joined);
                }
                received = subscription.receiver.recv() => match received {
                    Some(delivery) => {
                        let handler = Arc::clone(&self.handler);
                        in_flight.spawn(async move { handler.handle(delivery).await });
                    }
                    None => {
                        warn!("消费者 {} 的订阅已结束", subscription.consumer_tag);
                        break;
                    }
                },
            }
        }

        info!("消费者 {} 停止接收新消息", subscription.consumer_tag);

        while let Some(joined) = in_flight.join_next().await {
            if let Some(e) = Self::check_handler(joined) {
                failure.get_or_insert(e);
            }
        }

        self.release(subscription).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 取消订阅并把已缓冲但未处理的消息还给 broker
    async fn release(&self, mut subscription: Subscription) {
        let queue = &self.handler.queue;
        if let Err(e) = queue.unsubscribe(&subscription.consumer_tag).await {
            warn!("取消消费者 {} 失败: {}", subscription.consumer_tag, e);
        }

        subscription.receiver.close();
        let mut returned = 0usize;
        while let Some(delivery) = subscription.receiver.recv().await {
            match queue.nack(delivery.tag, true).await {
                Ok(()) => returned += 1,
                Err(e) => warn!("归还消息 {} 失败: {}", delivery.tag, e),
            }
        }

        if returned > 0 {
            info!("已归还 {} 条未处理的消息", returned);
        }
    }

    fn check_handler(joined: std::result::Result<Result<()>, JoinError>) -> Option<DispatchError> {
        match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => {
                // 消息保持未结算，由连接关闭时的重新入队兜底
                error!("消息处理任务异常退出: {}", e);
                None
            }
        }
    }
}
