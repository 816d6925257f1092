use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use courier_core::{
    config::{MessageQueueConfig, MessageQueueType},
    DispatchError, QueueConnector, Result, TaskQueue,
};

use crate::{InMemoryBroker, RabbitMQTaskQueue};

/// 按配置创建队列句柄
///
/// `in_memory` 类型下所有连接共享同一个进程内 broker。
pub struct QueueFactory {
    config: MessageQueueConfig,
    in_memory: Option<InMemoryBroker>,
}

impl QueueFactory {
    pub fn new(config: MessageQueueConfig) -> Self {
        let in_memory = match config.r#type {
            MessageQueueType::InMemory => Some(InMemoryBroker::new()),
            MessageQueueType::Rabbitmq => None,
        };
        Self { config, in_memory }
    }

    /// 使用已有的内存 broker
    pub fn with_broker(config: MessageQueueConfig, broker: InMemoryBroker) -> Self {
        Self {
            config: MessageQueueConfig {
                r#type: MessageQueueType::InMemory,
                ..config
            },
            in_memory: Some(broker),
        }
    }

    pub fn config(&self) -> &MessageQueueConfig {
        &self.config
    }

    pub fn in_memory_broker(&self) -> Option<&InMemoryBroker> {
        self.in_memory.as_ref()
    }

    pub async fn create(&self) -> Result<Arc<dyn TaskQueue>> {
        debug!("Creating message queue with type: {:?}", self.config.r#type);

        match (&self.config.r#type, &self.in_memory) {
            (MessageQueueType::Rabbitmq, _) => {
                info!("Initializing RabbitMQ message queue");
                let rabbitmq = RabbitMQTaskQueue::new(self.config.clone()).await?;
                Ok(Arc::new(rabbitmq))
            }
            (MessageQueueType::InMemory, Some(broker)) => {
                info!("Initializing in-memory message queue");
                Ok(Arc::new(broker.connect()?))
            }
            (MessageQueueType::InMemory, None) => Err(DispatchError::Configuration(
                "内存队列缺少broker实例".to_string(),
            )),
        }
    }
}

#[async_trait]
impl QueueConnector for QueueFactory {
    async fn connect(&self) -> Result<Arc<dyn TaskQueue>> {
        self.create().await
    }
}
