use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taskgate::{AppCommand, Application, ShutdownManager};
use taskgate_core::AppConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 关闭时等待运行中任务的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "taskgate")]
#[command(version)]
#[command(about = "带资源组调度、熔断和重试的本地任务队列")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别, RUST_LOG 优先
    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: AppCommand,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())
        .with_context(|| format!("加载配置失败: {}", cli.config.as_deref().unwrap_or("<默认>")))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_logging(&config.logging.level, &config.logging.format)?;
    info!("数据库: {}", config.database.url);

    let app = Application::new(config).await?;

    let shutdown_manager = ShutdownManager::new();
    let mut shutdown_rx = shutdown_manager.subscribe().await;
    let signal_listener = shutdown_manager.listen_for_signals();

    let result = tokio::select! {
        result = app.execute(&cli.command) => result,
        _ = shutdown_rx.recv() => {
            warn!("命令被中断");
            Err(anyhow::anyhow!("命令被中断"))
        }
    };
    signal_listener.abort();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app.shutdown()).await {
        Ok(Ok(())) => info!("队列已关闭"),
        Ok(Err(e)) => error!("关闭队列时发生错误: {e:#}"),
        Err(_) => warn!("关闭队列超时, 强制退出"),
    }

    let output = result?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// 初始化日志系统
///
/// 日志写到 stderr, stdout 只留给命令输出。
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}
