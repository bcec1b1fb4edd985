//! 日志构造

use slog::{Drain, Logger};

/// 输出到标准错误的异步终端日志
pub fn terminal_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

/// 丢弃所有记录的日志，未指定日志时使用
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
