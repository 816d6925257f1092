use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    models::{DeliveryTag, PublishOptions, Subscription},
    Result,
};

/// 持久化队列适配器抽象接口
///
/// 同一个句柄上的 publish/ack/nack 由实现方串行化（单写者）。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 幂等地声明一个持久化、非独占、不自动删除的队列
    async fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// 发布一条字节消息
    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()>;

    /// 以手动确认模式订阅队列
    async fn subscribe(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<Subscription>;

    /// 取消订阅，可重复调用
    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()>;

    /// 确认消息处理完成
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// 拒绝消息，`requeue` 决定是否重新入队
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// 先关闭通道再关闭连接，可重复调用
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// 建立到 broker 的连接并返回队列句柄
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>>;
}
