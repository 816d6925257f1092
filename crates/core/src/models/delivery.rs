use std::fmt;

use tokio::sync::mpsc;

/// 消息队列适配器签发的投递标签，用于结算（ack/nack）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 从队列收到的一条原始消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
}

/// 发布选项
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// 持久化消息（broker 重启后仍然存在）
    pub persistent: bool,
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            message_id: None,
        }
    }
}

impl PublishOptions {
    /// 持久化并附带新生成的消息ID
    pub fn persistent_with_new_id() -> Self {
        Self {
            persistent: true,
            message_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// 一个队列订阅：显式的接收通道
#[derive(Debug)]
pub struct Subscription {
    pub consumer_tag: String,
    pub receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(consumer_tag: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            receiver,
        }
    }
}
