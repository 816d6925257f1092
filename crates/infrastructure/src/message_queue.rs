use async_trait::async_trait;
use courier_core::{
    config::MessageQueueConfig, Delivery, DeliveryTag, DispatchError, PublishOptions, Result,
    Subscription, TaskQueue,
};
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    Consumer, Queue,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// 通道及其已签发、未结算的投递标签
///
/// 二者放在同一把锁后面：publish/ack/nack 全部串行化。
struct ChannelState {
    channel: Channel,
    outstanding: HashSet<u64>,
}

/// RabbitMQ持久化队列实现
pub struct RabbitMQTaskQueue {
    connection: Connection,
    state: Arc<Mutex<ChannelState>>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    config: MessageQueueConfig,
    closed: AtomicBool,
}

impl RabbitMQTaskQueue {
    /// 创建新的RabbitMQ队列实例
    pub async fn new(config: MessageQueueConfig) -> Result<Self> {
        let connect_timeout = Duration::from_secs(config.connection_timeout_seconds);
        let connection = tokio::time::timeout(
            connect_timeout,
            Connection::connect(&config.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            DispatchError::Connection(format!(
                "连接RabbitMQ超时({}s): {}",
                config.connection_timeout_seconds,
                redact_url(&config.url)
            ))
        })?
        .map_err(|e| DispatchError::Connection(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DispatchError::Connection(format!("创建通道失败: {e}")))?;

        if config.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| DispatchError::Connection(format!("开启发布确认失败: {e}")))?;
        }

        info!("成功连接到RabbitMQ: {}", redact_url(&config.url));

        Ok(Self {
            connection,
            state: Arc::new(Mutex::new(ChannelState {
                channel,
                outstanding: HashSet::new(),
            })),
            consumers: Mutex::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// 声明队列
    async fn declare_queue(&self, channel: &Channel, queue_name: &str) -> Result<Queue> {
        let queue = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::Connection(format!("声明队列 {queue_name} 失败: {e}")))?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(queue)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Connection("RabbitMQ连接已关闭".to_string()));
        }
        Ok(())
    }

    /// 把 lapin 消费者流转发到有界通道
    async fn pump(
        mut consumer: Consumer,
        tx: mpsc::Sender<Delivery>,
        state: Arc<Mutex<ChannelState>>,
        consumer_tag: String,
    ) {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!("消费者 {} 的接收端已关闭", consumer_tag);
                    break;
                }
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let tag = delivery.delivery_tag;
                    state.lock().await.outstanding.insert(tag);

                    let message = Delivery {
                        tag: DeliveryTag(tag),
                        payload: delivery.data,
                        message_id: delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string()),
                        redelivered: delivery.redelivered,
                    };

                    if tx.send(message).await.is_err() {
                        // 接收端已经不在了，把消息还给broker
                        let mut state = state.lock().await;
                        if state.outstanding.remove(&tag) {
                            let requeue = BasicNackOptions {
                                requeue: true,
                                ..Default::default()
                            };
                            if let Err(e) = state.channel.basic_nack(tag, requeue).await {
                                warn!("归还消息 {} 失败: {}", tag, e);
                            }
                        }
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("消费者 {} 接收消息失败: {}", consumer_tag, e);
                    break;
                }
                None => {
                    info!("消费者 {} 的消息流已结束", consumer_tag);
                    break;
                }
            }
        }
    }

    async fn settle(&self, tag: DeliveryTag, action: Settle) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;

        if !state.outstanding.remove(&tag.0) {
            return Err(DispatchError::InvariantViolation(format!(
                "投递标签 {tag} 未签发或已结算"
            )));
        }

        let result = match action {
            Settle::Ack => {
                state
                    .channel
                    .basic_ack(tag.0, BasicAckOptions::default())
                    .await
            }
            Settle::Nack { requeue } => {
                state
                    .channel
                    .basic_nack(
                        tag.0,
                        BasicNackOptions {
                            requeue,
                            ..Default::default()
                        },
                    )
                    .await
            }
        };

        result.map_err(|e| DispatchError::Connection(format!("结算消息 {tag} 失败: {e}")))
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Nack { requeue: bool },
}

#[async_trait]
impl TaskQueue for RabbitMQTaskQueue {
    #[instrument(skip(self))]
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        self.declare_queue(&state.channel, queue).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.ensure_open()?;

        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if options.persistent {
            properties = properties.with_delivery_mode(2); // 2 = persistent
        }
        if let Some(message_id) = options.message_id {
            properties = properties.with_message_id(message_id.into());
        }

        let confirm = {
            let state = self.state.lock().await;
            state
                .channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
                .map_err(|e| {
                    DispatchError::Connection(format!("发布消息到队列 {queue} 失败: {e}"))
                })?
        };

        // 未开启确认模式时立即返回 NotRequested
        let confirmation = confirm
            .await
            .map_err(|e| DispatchError::Connection(format!("消息发布确认失败: {e}")))?;
        if confirmation.is_nack() {
            return Err(DispatchError::Connection(format!(
                "broker拒绝了发往队列 {queue} 的消息"
            )));
        }

        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let consumer = {
            let state = self.state.lock().await;
            state
                .channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| DispatchError::Connection(format!("设置预取数量失败: {e}")))?;

            state
                .channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions {
                        no_ack: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| DispatchError::Connection(format!("创建消费者失败: {e}")))?
        };

        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        let handle = tokio::spawn(Self::pump(
            consumer,
            tx,
            Arc::clone(&self.state),
            consumer_tag.to_string(),
        ));

        if let Some(previous) = self
            .consumers
            .lock()
            .await
            .insert(consumer_tag.to_string(), handle)
        {
            previous.abort();
        }

        info!("为队列 {} 创建消费者: {}", queue, consumer_tag);
        Ok(Subscription::new(consumer_tag, rx))
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        if self.consumers.lock().await.remove(consumer_tag).is_none() {
            return Ok(());
        }
        self.ensure_open()?;

        let state = self.state.lock().await;
        state
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| DispatchError::Connection(format!("取消消费者 {consumer_tag} 失败: {e}")))?;

        info!("消费者 {} 已取消", consumer_tag);
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.settle(tag, Settle::Ack).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.settle(tag, Settle::Nack { requeue }).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (_, handle) in self.consumers.lock().await.drain() {
            handle.abort();
        }

        // 通道关闭失败也要继续关闭连接，避免泄漏底层socket
        let channel_result = {
            let mut state = self.state.lock().await;
            state.outstanding.clear();
            state.channel.close(200, "正常关闭").await
        };
        if let Err(e) = &channel_result {
            warn!("关闭RabbitMQ通道失败: {}", e);
        }

        let connection_result = self.connection.close(200, "正常关闭").await;

        channel_result.map_err(|e| DispatchError::Connection(format!("关闭通道失败: {e}")))?;
        connection_result.map_err(|e| DispatchError::Connection(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.status().connected()
    }
}

/// 去掉URL中的用户名和密码，用于日志输出
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***@{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
