use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tuna::app::Application;
use tuna::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use tuna_core::config::AppConfig;
use tuna_core::init_logging;
use tuna_core::models::{JobState, NewMachine, NewSession, ResetFilter, ResetTarget};
use tuna_records::GoldenRequest;

/// 等待后台任务收尾的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "tuna")]
#[command(version = "1.0.0")]
#[command(about = "分布式调优任务编排系统")]
#[command(long_about = "管理调优会话、机器和作业，运行派发端与worker，并生成Golden版本")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径，未指定时按默认位置查找
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别，覆盖配置
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式，覆盖配置
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 创建调优会话
    AddSession {
        /// 目标架构，例如 gfx90a
        #[arg(long)]
        arch: String,
        /// 计算单元数
        #[arg(long)]
        num_cu: i32,
        /// 工具链版本
        #[arg(long)]
        toolchain: String,
        /// 会话标签
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// 列出会话
    Sessions,
    /// 登记机器
    AddMachine {
        #[arg(long)]
        hostname: String,
        /// 远程执行地址
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 22)]
        ssh_port: i32,
        #[arg(long, default_value = "tuna")]
        ssh_user: String,
        #[arg(long)]
        arch: String,
        #[arg(long)]
        num_cu: i32,
        /// 机器上的GPU数
        #[arg(long)]
        gpus: i32,
        /// 带外电源控制地址
        #[arg(long)]
        power_address: Option<String>,
    },
    /// 列出机器
    Machines,
    /// 手动上线或下线机器
    Machine {
        #[arg(long)]
        hostname: String,
        /// 上线并清除失败计数
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// 下线
        #[arg(long)]
        disable: bool,
    },
    /// 从作业清单装载作业
    LoadJobs {
        #[arg(short, long)]
        session: i64,
        /// 每行一个配置引用
        file: PathBuf,
        #[arg(long, default_value = "")]
        reason: String,
        /// 求解器提示
        #[arg(long)]
        solver: Option<String>,
    },
    /// 运行派发端：派发、回收陈旧领取和收集结果
    Dispatch {
        /// 参与派发的会话
        #[arg(short, long, required = true, num_args = 1..)]
        session: Vec<i64>,
        /// 只执行一轮
        #[arg(long)]
        once: bool,
    },
    /// 运行本机worker
    Worker {
        #[arg(short, long)]
        session: i64,
        /// 本机登记的主机名，默认取系统主机名
        #[arg(long)]
        hostname: Option<String>,
    },
    /// 将运行过久的领取放回可领取状态
    RequeueStale {
        /// 陈旧阈值（秒），默认取配置
        #[arg(long)]
        older_than: Option<u64>,
    },
    /// 批量重置作业
    Reset {
        #[arg(short, long)]
        session: i64,
        /// 目标状态: new 或 compiled
        #[arg(long, default_value = "new")]
        to: ResetTarget,
        #[arg(long)]
        reason: Option<String>,
        /// 只重置处于这些状态的作业
        #[arg(long = "state", num_args = 1..)]
        states: Vec<JobState>,
    },
    /// 会话作业状态统计
    Status {
        #[arg(short, long)]
        session: i64,
    },
    /// 导入合并输出为会话的合并记录
    ImportMerged {
        #[arg(short, long)]
        session: i64,
        file: PathBuf,
    },
    /// 生成Golden版本
    Golden {
        #[arg(short, long)]
        session: i64,
        #[arg(long)]
        version: i64,
        /// 基础版本
        #[arg(long)]
        base: Option<i64>,
        /// 覆盖已存在的版本
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging)?;

    let app = Application::new(config).await?;
    run_command(&app, cli.command).await
}

async fn run_command(app: &Application, command: Commands) -> Result<()> {
    match command {
        Commands::AddSession {
            arch,
            num_cu,
            toolchain,
            reason,
        } => {
            let session = app
                .add_session(NewSession {
                    arch,
                    num_cu,
                    toolchain_version: toolchain,
                    reason,
                })
                .await?;
            println!("{}", session.id);
        }
        Commands::Sessions => {
            for s in app.list_sessions().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    s.id, s.arch, s.num_cu, s.toolchain_version, s.reason
                );
            }
        }
        Commands::AddMachine {
            hostname,
            address,
            ssh_port,
            ssh_user,
            arch,
            num_cu,
            gpus,
            power_address,
        } => {
            let machine = app
                .add_machine(NewMachine {
                    hostname,
                    address,
                    ssh_port,
                    ssh_user,
                    arch,
                    num_cu,
                    gpu_count: gpus,
                    power_address,
                })
                .await?;
            println!("{}", machine.id);
        }
        Commands::Machines => {
            for m in app.list_machines().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}\tavailable={}\tunreachable={}\tfailures={}",
                    m.id,
                    m.hostname,
                    m.arch,
                    m.num_cu,
                    m.gpu_count,
                    m.available,
                    m.unreachable,
                    m.host_failures
                );
            }
        }
        Commands::Machine {
            hostname,
            enable,
            disable,
        } => {
            if enable == disable {
                anyhow::bail!("需要指定 --enable 或 --disable");
            }
            app.set_machine_available(&hostname, enable).await?;
        }
        Commands::LoadJobs {
            session,
            file,
            reason,
            solver,
        } => {
            let ids = app
                .load_jobs(session, &file, &reason, solver.as_deref())
                .await?;
            println!("loaded {} jobs", ids.len());
        }
        Commands::Dispatch { session, once } => {
            if once {
                for round in app.dispatch_once(&session).await? {
                    println!(
                        "session {}: applied {} ignored {} staged {} compile {} evaluate {}",
                        round.session_id,
                        round.collected.applied,
                        round.collected.ignored,
                        round.collected.records_staged,
                        round.dispatched.compile,
                        round.dispatched.evaluate
                    );
                }
            } else {
                let shutdown = ShutdownManager::new();
                let run = app.run_dispatcher(session, &shutdown);
                run_until_signal(run, &shutdown).await?;
            }
        }
        Commands::Worker { session, hostname } => {
            let hostname = match hostname {
                Some(h) => h,
                None => hostname::get()
                    .context("获取主机名失败")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let shutdown = ShutdownManager::new();
            let run = app.run_worker(session, &hostname, &shutdown);
            let stopped = run_until_signal(run, &shutdown).await?;
            info!("机器 {} 的worker已全部退出: {:?}", hostname, stopped);
        }
        Commands::RequeueStale { older_than } => {
            let seconds = older_than.unwrap_or(app.config().dispatcher.stale_after_seconds);
            let ids = app.requeue_stale(Duration::from_secs(seconds)).await?;
            println!("requeued {} jobs", ids.len());
        }
        Commands::Reset {
            session,
            to,
            reason,
            states,
        } => {
            let mut filter = ResetFilter::session(session).with_states(states);
            if let Some(reason) = reason {
                filter = filter.with_reason(reason);
            }
            let count = app.reset(&filter, to).await?;
            println!("reset {count} jobs to {}", to.state());
        }
        Commands::Status { session } => {
            let counts = app.status(session).await?;
            let total: i64 = counts.iter().map(|(_, n)| n).sum();
            for (state, count) in counts {
                println!("{state}\t{count}");
            }
            println!("total\t{total}");
        }
        Commands::ImportMerged { session, file } => {
            let written = app.import_merged(session, &file).await?;
            println!("imported {written} records");
        }
        Commands::Golden {
            session,
            version,
            base,
            overwrite,
        } => {
            let golden = app
                .update_golden(&GoldenRequest {
                    session_id: session,
                    version,
                    base_version: base,
                    overwrite,
                })
                .await?;
            println!(
                "golden version {} committed with {} session records",
                golden.version, golden.record_count
            );
        }
    }
    Ok(())
}

/// 运行长驻任务，收到信号后触发关闭并等待任务收尾
async fn run_until_signal<T>(
    run: impl std::future::Future<Output = Result<T>>,
    shutdown: &ShutdownManager,
) -> Result<Option<T>> {
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result.map(Some),
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
    }

    shutdown.shutdown().await;
    match tokio::time::timeout(SHUTDOWN_GRACE, run).await {
        Ok(result) => {
            info!("已优雅关闭");
            result.map(Some)
        }
        Err(_) => {
            warn!("关闭超时，强制退出");
            Ok(None)
        }
    }
}
