use clap::{Parser, Subcommand, ValueEnum};
use failure::format_err;
use slog::{o, Logger};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskscope::logging::terminal_logger;
use taskscope::{
    fatal, JoinMode, JoinResult, Outcome, RetryPolicy, RunnerConfig, Scope, Task, ThreadPool,
    WorkerPool,
};

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        author = env!("CARGO_PKG_AUTHORS"),
        about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON 配置文件
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 输出日志到标准错误
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 并发执行一组定时任务
    Fanout {
        /// 工作线程数量，覆盖配置文件
        #[arg(long)]
        workers: Option<usize>,

        /// 任务数量
        #[arg(long, default_value_t = 3)]
        tasks: usize,

        /// 每个任务的耗时
        #[arg(long, default_value_t = 50)]
        sleep_ms: u64,

        /// 每隔 K 个任务让一个任务失败
        #[arg(long)]
        fail_every: Option<usize>,

        /// 汇总方式
        #[arg(long, value_enum, default_value_t = Mode::JoinAll)]
        mode: Mode,

        /// join 的截止时间
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// 为每个用户并发获取用户数据与订单数据
    Requests {
        /// 用户数量
        #[arg(long, default_value_t = 5)]
        users: usize,

        /// 每次获取前几次尝试失败
        #[arg(long, default_value_t = 0)]
        flaky: u32,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum Mode {
    /// 等待所有任务
    JoinAll,
    /// 首个失败时取消其余任务
    ShutdownOnFailure,
}

impl From<Mode> for JoinMode {
    fn from(mode: Mode) -> JoinMode {
        match mode {
            Mode::JoinAll => JoinMode::JoinAll,
            Mode::ShutdownOnFailure => JoinMode::ShutdownOnFailure,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> taskscope::Result<()> {
    let config = match &cli.config {
        Some(path) => RunnerConfig::from_path(path)?,
        None => RunnerConfig::default(),
    };
    let logger = if cli.verbose {
        terminal_logger()
    } else {
        taskscope::logging::discard_logger()
    };

    match cli.command {
        Commands::Fanout {
            workers,
            tasks,
            sleep_ms,
            fail_every,
            mode,
            deadline_ms,
        } => {
            let mut pool_config = config.pool.clone();
            if let Some(workers) = workers {
                pool_config.workers = workers;
            }
            let pool = Arc::new(WorkerPool::with_config(&pool_config, &logger)?);
            let result = fanout(
                &pool,
                &config,
                &logger,
                tasks,
                Duration::from_millis(sleep_ms),
                fail_every,
                mode.into(),
                deadline_ms.map(Duration::from_millis),
            );
            pool.shutdown(true);
            result
        }
        Commands::Requests { users, flaky } => {
            let pool = Arc::new(WorkerPool::with_config(&config.pool, &logger)?);
            // 未指定配置文件时默认重试三次
            let retry = if cli.config.is_some() {
                config.retry.to_policy()
            } else {
                RetryPolicy::new(3, Duration::from_millis(100))
            };
            let mut result = Ok(());
            for i in 0..users {
                result = process_request(&pool, &retry, &logger, &format!("user{}", i), flaky);
                if result.is_err() {
                    break;
                }
            }
            pool.shutdown(true);
            result
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fanout(
    pool: &Arc<WorkerPool>,
    config: &RunnerConfig,
    logger: &Logger,
    tasks: usize,
    sleep: Duration,
    fail_every: Option<usize>,
    mode: JoinMode,
    deadline: Option<Duration>,
) -> taskscope::Result<()> {
    let mut scope = Scope::new(pool.clone(), mode)
        .with_retry(config.retry.to_policy())
        .with_logger(logger);

    let start = Instant::now();
    for i in 0..tasks {
        let fails = fail_every.map_or(false, |k| k > 0 && (i + 1) % k == 0);
        scope.fork(Task::new(format!("sleep-{}", i), move |ctx| {
            ctx.sleep(sleep)?;
            if fails {
                return Err(fatal(format_err!("task {} failed", i)));
            }
            Ok(i)
        }))?;
    }

    match scope.join(deadline.and_then(|d| start.checked_add(d)))? {
        JoinResult::Completed(outcomes) => {
            let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
            for (i, outcome) in outcomes.iter().enumerate() {
                match outcome {
                    Outcome::Succeeded(v) => println!("task {}: succeeded ({})", i, v),
                    Outcome::Failed(e) => println!("task {}: failed ({})", i, e),
                    Outcome::Cancelled => println!("task {}: cancelled", i),
                }
            }
            println!(
                "completed {}/{} in {} ms",
                succeeded,
                outcomes.len(),
                start.elapsed().as_millis()
            );
        }
        JoinResult::Failed(e) => println!("failed: {}", e),
        JoinResult::TimedOut => println!("timed out after {} ms", start.elapsed().as_millis()),
    }
    Ok(())
}

#[derive(Clone, Debug)]
enum Fetched {
    User { user_id: String, name: String },
    Order { order_id: String, amount: f64 },
}

fn process_request(
    pool: &Arc<WorkerPool>,
    retry: &RetryPolicy,
    logger: &Logger,
    user_id: &str,
    flaky: u32,
) -> taskscope::Result<()> {
    let trace_id = format!("{:08x}", rand::random::<u32>());
    let request_logger = logger.new(o!("trace" => trace_id.clone(), "user" => user_id.to_string()));
    let mut scope = Scope::new(pool.clone(), JoinMode::ShutdownOnFailure)
        .with_retry(retry.clone())
        .with_logger(&request_logger);

    let user = user_id.to_string();
    let user_task = scope.fork(Task::new("fetch-user", move |ctx| {
        if ctx.attempt() <= flaky {
            return Err(format_err!("user service unavailable"));
        }
        ctx.sleep(Duration::from_millis(100))?;
        Ok(Fetched::User {
            user_id: user.clone(),
            name: "John Doe".to_string(),
        })
    }))?;

    let user = user_id.to_string();
    let order_task = scope.fork(Task::new("fetch-order", move |ctx| {
        if ctx.attempt() <= flaky {
            return Err(format_err!("order service unavailable"));
        }
        ctx.sleep(Duration::from_millis(150))?;
        Ok(Fetched::Order {
            order_id: format!("order_{}", user),
            amount: 99.99,
        })
    }))?;

    match scope.join_timeout(Duration::from_secs(5))? {
        JoinResult::Completed(_) => {
            let user = scope.result(&user_task)?;
            let order = scope.result(&order_task)?;
            if let (
                Fetched::User { user_id, name },
                Fetched::Order { order_id, amount },
            ) = (user, order)
            {
                println!(
                    "[trace: {}] {}: {}, {} {:.2} (attempts {}/{})",
                    trace_id,
                    user_id,
                    name,
                    order_id,
                    amount,
                    user_task.attempts(),
                    order_task.attempts()
                );
            }
        }
        JoinResult::Failed(e) => println!("[trace: {}] {}: error: {}", trace_id, user_id, e),
        JoinResult::TimedOut => println!("[trace: {}] {}: request timed out", trace_id, user_id),
    }
    Ok(())
}
