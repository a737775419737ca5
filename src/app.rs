use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use taskgate_core::{AppConfig, Clock, QueueRepositories, SystemClock};
use taskgate_dispatcher::QueueEngine;
use taskgate_infrastructure::{CleanupService, DatabaseManager};
use taskgate_worker::{HttpNetwork, TokioFileSystem, TransparentAdapter};
use tracing::info;

/// 命令行子命令
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum AppCommand {
    /// 读取文件内容
    Read {
        path: PathBuf,
    },
    /// 写入文件
    Write {
        path: PathBuf,
        content: String,
    },
    /// 列出目录
    Ls {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// 按通配符搜索文件 (支持 * 和 ?)
    Find {
        root: PathBuf,
        pattern: String,
    },
    /// 发送GET请求并输出响应
    Fetch {
        url: String,
    },
    /// 下载到本地文件
    Download {
        url: String,
        dest: PathBuf,
    },
    /// 队列状态和熔断器状态
    Status,
    /// 最近的会话
    Sessions {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// 会话指标
    Metrics {
        /// 会话ID, 缺省为当前会话
        #[arg(short, long)]
        session: Option<String>,
    },
    /// 各资源组的历史表现
    Groups,
    /// 执行一次数据保留清理
    Purge,
}

/// 命令行应用: 数据库、队列引擎和透明适配器
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    engine: QueueEngine,
    adapter: TransparentAdapter,
    clock: Arc<dyn Clock>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = DatabaseManager::connect(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let engine = QueueEngine::start(config.clone(), database.repositories(), clock.clone())
            .await
            .context("启动队列引擎失败")?;

        let network = HttpNetwork::new().context("创建HTTP客户端失败")?;
        let adapter = TransparentAdapter::new(
            Arc::new(engine.clone()),
            Arc::new(TokioFileSystem::new()),
            Arc::new(network),
        )
        .with_default_priority(config.queue.default_priority);

        info!("应用初始化完成, 会话 {}", engine.session_id());
        Ok(Self {
            config,
            database,
            engine,
            adapter,
            clock,
        })
    }

    pub fn engine(&self) -> &QueueEngine {
        &self.engine
    }

    pub fn adapter(&self) -> &TransparentAdapter {
        &self.adapter
    }

    fn repositories(&self) -> &QueueRepositories {
        self.engine.repositories()
    }

    /// 执行一条命令，返回要输出的文本
    pub async fn execute(&self, command: &AppCommand) -> Result<String> {
        let mut out = String::new();
        match command {
            AppCommand::Read { path } => {
                let contents = self.adapter.read_file(path).await?;
                out.push_str(&String::from_utf8_lossy(&contents));
            }
            AppCommand::Write { path, content } => {
                let written = self.adapter.write_file(path, content.as_bytes()).await?;
                writeln!(out, "已写入 {} 字节到 {}", written, path.display())?;
            }
            AppCommand::Ls { dir } => {
                for entry in self.adapter.list_directory(dir).await? {
                    let kind = if entry.is_dir { "d" } else { "-" };
                    writeln!(out, "{} {:>10} {}", kind, entry.size, entry.path.display())?;
                }
            }
            AppCommand::Find { root, pattern } => {
                for path in self.adapter.find_files(root, pattern).await? {
                    writeln!(out, "{}", path.display())?;
                }
            }
            AppCommand::Fetch { url } => {
                let response = self.adapter.fetch(url).await?;
                writeln!(out, "HTTP {}", response.status)?;
                out.push_str(&response.text());
            }
            AppCommand::Download { url, dest } => {
                let written = self.adapter.download(url, dest).await?;
                writeln!(out, "已下载 {} 字节到 {}", written, dest.display())?;
            }
            AppCommand::Status => self.render_status(&mut out)?,
            AppCommand::Sessions { limit } => self.render_sessions(&mut out, *limit).await?,
            AppCommand::Metrics { session } => {
                let session_id = session.as_deref().unwrap_or(self.engine.session_id());
                let metrics = self.engine.get_metrics(session_id).await?;
                out.push_str(&serde_json::to_string_pretty(&metrics)?);
                out.push('\n');
            }
            AppCommand::Groups => {
                writeln!(
                    out,
                    "{:<18} {:>8} {:>8} {:>8} {:>8} {:>12}",
                    "资源组", "总数", "完成", "失败", "成功率", "平均耗时(ms)"
                )?;
                for perf in self.repositories().metrics.resource_group_performance().await? {
                    writeln!(
                        out,
                        "{:<18} {:>8} {:>8} {:>8} {:>7.1}% {:>12.1}",
                        perf.resource_group.as_str(),
                        perf.total_tasks,
                        perf.completed_tasks,
                        perf.failed_tasks,
                        perf.success_rate * 100.0,
                        perf.average_duration_ms
                    )?;
                }
            }
            AppCommand::Purge => {
                let cleanup = CleanupService::new(
                    self.repositories().clone(),
                    self.config.cleanup.clone(),
                    self.clock.clone(),
                );
                let stats = cleanup.cleanup_once().await?;
                writeln!(
                    out,
                    "清理完成: 任务 {}, 心跳 {}, 指标 {}, 会话 {}, 耗时 {:?}",
                    stats.tasks_cleaned,
                    stats.heartbeats_cleaned,
                    stats.metrics_cleaned,
                    stats.sessions_cleaned,
                    stats.duration
                )?;
            }
        }
        Ok(out)
    }

    fn render_status(&self, out: &mut String) -> Result<()> {
        let status = self.engine.get_status();
        writeln!(out, "会话: {}", status.session_id)?;
        writeln!(
            out,
            "运行中: {}, 活跃资源组: {}, 接收新任务: {}",
            status.running_count, status.active_workers, status.accepting
        )?;
        writeln!(
            out,
            "{:<18} {:>6} {:>6} {:>6} {:>6}  熔断器",
            "资源组", "排队", "重试", "运行", "上限"
        )?;
        for group in &status.groups {
            writeln!(
                out,
                "{:<18} {:>6} {:>6} {:>6} {:>6}  {}",
                group.resource_group.as_str(),
                group.queued,
                group.delayed,
                group.running,
                group.max_concurrency,
                group.circuit_state
            )?;
        }
        Ok(())
    }

    async fn render_sessions(&self, out: &mut String, limit: usize) -> Result<()> {
        let sessions = self.repositories().sessions.list_recent(limit).await?;
        writeln!(
            out,
            "{:<36} {:>8} {:<10} {:>6} {:>6} {:>6}  开始时间",
            "会话ID", "PID", "状态", "总数", "完成", "失败"
        )?;
        for session in &sessions {
            writeln!(
                out,
                "{:<36} {:>8} {:<10} {:>6} {:>6} {:>6}  {}",
                session.session_id,
                session.process_id,
                session.status.as_str(),
                session.total_tasks,
                session.completed_tasks,
                session.failed_tasks,
                session.started_at.format("%Y-%m-%d %H:%M:%S")
            )?;
        }

        let summaries = self.repositories().sessions.current_summaries().await?;
        if !summaries.is_empty() {
            writeln!(out, "\n活跃会话:")?;
            for summary in summaries {
                writeln!(
                    out,
                    "  {} 待执行 {} 运行 {} 完成 {} 失败 {} 取消 {} 成功率 {:.1}%",
                    summary.session_id,
                    summary.pending_tasks,
                    summary.running_tasks,
                    summary.completed_tasks,
                    summary.failed_tasks,
                    summary.cancelled_tasks,
                    summary.success_rate * 100.0
                )?;
            }
        }
        Ok(())
    }

    /// 关闭引擎并释放数据库连接
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown().await.context("关闭队列引擎失败")?;
        self.database.close().await;
        Ok(())
    }
}
