use serde::{Deserialize, Serialize};

/// 消费端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub consumer_tag: String,
    /// 同一订阅上同时处理的消息数，1 表示严格按投递顺序逐条处理
    pub max_in_flight: usize,
    /// 暂时性失败的最大重投次数，None 表示不设上限
    pub max_redeliveries: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_tag: "courier-worker".to_string(),
            max_in_flight: 1,
            max_redeliveries: Some(10),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.consumer_tag.is_empty() {
            return Err(anyhow::anyhow!("消费者标签不能为空"));
        }

        if self.max_in_flight == 0 {
            return Err(anyhow::anyhow!("并发处理数必须大于0"));
        }

        Ok(())
    }
}
