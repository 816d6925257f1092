use std::sync::Arc;

use courier_core::{DispatchError, QueueConnector, Result, TaskQueue};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ConsumerSettings, ConsumerStats, ConsumerStatsSnapshot, ConsumptionLoop, Deliverer};

struct Running {
    queue: Arc<dyn TaskQueue>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

/// 分发核心的生命周期：连接、声明队列、订阅并运行消费循环
pub struct DispatchLifecycle {
    connector: Arc<dyn QueueConnector>,
    deliverer: Arc<dyn Deliverer>,
    settings: ConsumerSettings,
    stats: Arc<ConsumerStats>,
    running: Mutex<Option<Running>>,
}

impl DispatchLifecycle {
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        deliverer: Arc<dyn Deliverer>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            connector,
            deliverer,
            settings,
            stats: Arc::new(ConsumerStats::default()),
            running: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DispatchError::InvariantViolation(
                "分发服务已在运行".to_string(),
            ));
        }

        info!("启动分发服务，消费者: {}", self.settings.consumer_tag);
        let queue = self.connector.connect().await?;

        let subscription = match self.prepare(&queue).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("启动分发服务失败: {}", e);
                if let Err(close_err) = queue.close().await {
                    warn!("关闭队列连接失败: {}", close_err);
                }
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let consumption_loop = ConsumptionLoop::new(
            Arc::clone(&queue),
            Arc::clone(&self.deliverer),
            self.settings.clone(),
            Arc::clone(&self.stats),
        );
        let handle = tokio::spawn(consumption_loop.run(subscription, shutdown_rx));

        *running = Some(Running {
            queue,
            shutdown_tx,
            handle,
        });
        info!("分发服务 {} 启动成功", self.settings.consumer_tag);
        Ok(())
    }

    async fn prepare(&self, queue: &Arc<dyn TaskQueue>) -> Result<courier_core::Subscription> {
        queue.ensure_queue(&self.settings.task_queue).await?;
        if let Some(dead_letter_queue) = &self.settings.dead_letter_queue {
            queue.ensure_queue(dead_letter_queue).await?;
        }

        queue
            .subscribe(
                &self.settings.task_queue,
                &self.settings.consumer_tag,
                self.settings.prefetch,
            )
            .await
    }

    /// 停止消费并关闭连接
    ///
    /// 未启动或已停止时直接返回。消费循环因不变量错误退出时返回该错误。
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("停止分发服务: {}", self.settings.consumer_tag);
        let _ = running.shutdown_tx.send(());

        let loop_result = match running.handle.await {
            Ok(result) => result,
            Err(e) => Err(DispatchError::Internal(format!("消费循环异常退出: {e}"))),
        };
        if let Err(e) = &loop_result {
            error!("消费循环以错误结束: {}", e);
        }

        let close_result = running.queue.close().await;
        if let Err(e) = &close_result {
            warn!("关闭队列连接失败: {}", e);
        }

        info!("分发服务 {} 已停止", self.settings.consumer_tag);
        loop_result.and(close_result)
    }

    /// 当前运行中的队列句柄，供发布路径使用
    pub async fn queue_handle(&self) -> Option<Arc<dyn TaskQueue>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.queue))
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }
}
