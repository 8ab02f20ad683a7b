use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt};

/// 初始化日志系统
///
/// 日志写入 stderr,stdout 留给 RPC 通道
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();
}
