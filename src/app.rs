use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::{AppConfig, Contact, ContactSource, QueueConnector, TaskQueue};
use courier_dispatcher::{FanoutReport, ReminderFanout, TaskPublisher};
use courier_infrastructure::{QueueFactory, SmtpTransport, StaticContactSource};
use courier_worker::{ConsumerSettings, DeliveryExecutor, DispatchLifecycle};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// 主应用程序：按配置装配队列、传输与联系人来源
pub struct Application {
    config: AppConfig,
    queue_factory: Arc<QueueFactory>,
    contacts: Arc<dyn ContactSource>,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        let queue_factory = Arc::new(QueueFactory::new(config.message_queue.clone()));
        let contacts = Arc::new(StaticContactSource::new(config.contacts.clone()));

        Self {
            config,
            queue_factory,
            contacts,
        }
    }

    fn lifecycle(&self) -> DispatchLifecycle {
        let transport = Arc::new(SmtpTransport::new(self.config.smtp.clone()));
        let executor = Arc::new(DeliveryExecutor::new(transport, &self.config.smtp));

        DispatchLifecycle::new(
            Arc::clone(&self.queue_factory) as Arc<dyn QueueConnector>,
            executor,
            ConsumerSettings::from_config(&self.config),
        )
    }

    /// 运行消费端直到收到关闭信号或消费循环退出
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let lifecycle = self.lifecycle();
        lifecycle.start().await.context("启动分发服务失败")?;

        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止分发服务");
                    break;
                }
                _ = liveness.tick() => {
                    if !lifecycle.is_running().await {
                        error!("消费循环意外退出");
                        break;
                    }
                }
            }
        }

        let stats = lifecycle.stats();
        let result = lifecycle.stop().await;
        info!(
            acked = stats.acked,
            requeued = stats.requeued,
            rejected = stats.rejected,
            dead_lettered = stats.dead_lettered,
            malformed = stats.malformed,
            "分发服务统计"
        );

        result.context("分发服务以错误结束")
    }

    pub async fn send_test(&self, email: &str) -> Result<FanoutReport> {
        self.with_fanout(|fanout| async move { fanout.send_test(email).await })
            .await
            .with_context(|| format!("发送测试提醒到 {email} 失败"))
    }

    pub async fn send_monthly(&self) -> Result<FanoutReport> {
        self.with_fanout(|fanout| async move { fanout.send_monthly().await })
            .await
            .context("发布月度提醒失败")
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        self.contacts
            .list_active_contacts()
            .await
            .context("读取联系人失败")
    }

    /// 打开一个发布连接，执行批量发布后关闭
    async fn with_fanout<F, Fut>(&self, publish: F) -> courier_core::Result<FanoutReport>
    where
        F: FnOnce(ReminderFanout) -> Fut,
        Fut: std::future::Future<Output = courier_core::Result<FanoutReport>>,
    {
        if !self.config.message_queue.is_rabbitmq() {
            warn!("内存队列只在本进程内可见，发布的消息不会被其他进程消费");
        }

        let queue: Arc<dyn TaskQueue> = self.queue_factory.create().await?;
        let task_queue = &self.config.message_queue.task_queue;
        let result = match queue.ensure_queue(task_queue).await {
            Ok(()) => {
                let fanout = ReminderFanout::new(
                    TaskPublisher::new(Arc::clone(&queue), task_queue.clone()),
                    Arc::clone(&self.contacts),
                    self.config.smtp.from_name.clone(),
                );
                publish(fanout).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = queue.close().await {
            warn!("关闭发布连接失败: {}", e);
        }
        result
    }
}
