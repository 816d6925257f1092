use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_core::{AppConfig, ObservabilityConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "基于持久化队列的邮件任务分发系统")]
struct Cli {
    /// 配置文件路径，不指定时按默认路径搜索
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件中的设置
    #[arg(short, long, value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    #[arg(long, value_name = "FORMAT", value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 运行消费端，持续投递队列中的邮件任务
    Run,
    /// 发布一封测试提醒
    SendTest {
        #[arg(long)]
        email: String,
    },
    /// 给所有活跃联系人发布月度提醒
    Remind,
    /// 列出活跃联系人
    Contacts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    let log_format = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::SendTest { email } => {
            let app = Application::new(config);
            let report = app.send_test(&email).await?;
            info!(queued = report.queued, "测试提醒已入队: {email}");
            Ok(())
        }
        Commands::Remind => {
            let app = Application::new(config);
            let report = app.send_monthly().await?;
            info!(
                queued = report.queued,
                failed = report.failed,
                "月度提醒发布完成"
            );
            Ok(())
        }
        Commands::Contacts => {
            let app = Application::new(config);
            for contact in app.contacts().await? {
                println!("{}\t{}", contact.name, contact.email);
            }
            Ok(())
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("启动邮件分发服务");
    info!(
        "任务队列: {}，并发处理数: {}",
        config.message_queue.task_queue, config.worker.max_in_flight
    );

    if config.observability.metrics_enabled {
        install_metrics_exporter(&config.observability)?;
    }

    let app = Arc::new(Application::new(config));
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            // 服务在收到信号前自行退出
            return match result {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::anyhow!("分发服务任务异常退出: {e}")),
            };
        }
    }

    shutdown_manager.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("邮件分发服务已优雅关闭");
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            error!("分发服务关闭时发生错误: {e:#}");
            Err(e)
        }
        Ok(Err(e)) => Err(anyhow::anyhow!("分发服务任务异常退出: {e}")),
        Err(_) => {
            warn!("关闭超时，强制退出");
            Ok(())
        }
    }
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 启动 Prometheus 指标导出端点
fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;

    info!("指标端点监听于 http://{addr}/metrics");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
