//! 全局日志初始化。过滤级别来源优先级：RUST_LOG 环境变量 >
//! 配置文件的 logLevel（[`crate::core::config::model::AppConfig`]）> info。

use tracing_subscriber::{fmt, EnvFilter};

/// 安装全局 tracing 订阅器；重复调用幂等（保留首次安装的配置）。
/// default_level 解析失败时回退 info，初始化自身从不失败。
pub fn init_logging(default_level: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
    tracing::info!(target = "optimizer", default_level, "logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::model::AppConfig;

    #[test]
    fn init_tolerates_bad_levels_and_repeat_calls() {
        init_logging("definitely*not)a(filter");
        init_logging(&AppConfig::default().log_level);
        // 已有订阅器时再次初始化不会 panic，事件可正常发出
        tracing::info!(target = "optimizer", "logging smoke event");
    }
}
