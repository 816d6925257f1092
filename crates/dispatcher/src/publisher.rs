use std::sync::Arc;

use courier_core::{PublishOptions, Result, TaskEnvelope, TaskQueue};
use metrics::counter;
use tracing::{debug, instrument};

/// 发布路径：把邮件任务写入持久化队列
#[derive(Clone)]
pub struct TaskPublisher {
    queue: Arc<dyn TaskQueue>,
    task_queue: String,
}

impl TaskPublisher {
    pub fn new(queue: Arc<dyn TaskQueue>, task_queue: impl Into<String>) -> Self {
        Self {
            queue,
            task_queue: task_queue.into(),
        }
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// 序列化并以持久化方式发布，每条消息带新的 message_id
    ///
    /// 同步可见的失败（连接已关闭、序列化失败）直接返回给调用方。
    #[instrument(skip_all, fields(recipient = %envelope.recipient()))]
    pub async fn publish_task(&self, envelope: &TaskEnvelope) -> Result<()> {
        let payload = envelope.to_bytes()?;
        let options = PublishOptions::persistent_with_new_id();
        let message_id = options.message_id.clone().unwrap_or_default();

        self.queue
            .publish(&self.task_queue, &payload, options)
            .await?;

        counter!("courier_published_total").increment(1);
        debug!("邮件任务 {} 已发布到队列 {}", message_id, self.task_queue);
        Ok(())
    }
}
