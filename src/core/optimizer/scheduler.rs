use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::Notify;

use super::prober::Prober;
use super::resolver::DomainResolver;
use super::store::{current_epoch_ms, ConfigStore, DomainConfigPatch, OptimizedDomainConfig};

/// 进程内只允许一个自动测速服务实例。
static STARTED: AtomicBool = AtomicBool::new(false);

/// 自动测速一次扫描所需的依赖集合。
pub struct AutoTestContext {
    pub store: Arc<ConfigStore>,
    pub prober: Arc<Prober>,
    pub resolver: Arc<DomainResolver>,
    pub test_count: u32,
    pub timeout_ms: u64,
}

/// 某个域名本轮是否到期：启用 + 开启自动测速 + 距上次测速
/// 已超过配置间隔。从未测速的启用域名视为到期。
pub fn is_due(cfg: &OptimizedDomainConfig, now_ms: i64) -> bool {
    if !cfg.enabled || !cfg.auto_test_enabled {
        return false;
    }
    match cfg.last_auto_test_at {
        None => true,
        Some(last) => {
            let interval_ms = (cfg.auto_test_interval_minutes as i64).saturating_mul(60_000);
            now_ms >= last.saturating_add(interval_ms)
        }
    }
}

/// 扫描全部域名配置并串行测速到期者，返回本轮测速的域名数。
/// 无论探测结果如何，last_auto_test_at 都推进到本轮时间，避免
/// 失败域名在每轮扫描中被反复重测。仓库错误只记日志不中断扫描。
pub async fn sweep_once(ctx: &AutoTestContext, now_ms: i64) -> usize {
    let configs = match ctx.store.get_optimized_domain_configs(false) {
        Ok(configs) => configs,
        Err(err) => {
            tracing::warn!(target = "optimizer", error = %err, "auto-test sweep failed to load configs");
            return 0;
        }
    };

    let mut tested = 0usize;
    for cfg in configs.iter().filter(|c| is_due(c, now_ms)) {
        let results = ctx
            .prober
            .probe_domain(&cfg.domain, ctx.test_count, ctx.timeout_ms)
            .await;
        let mut patch = DomainConfigPatch {
            last_auto_test_at: Some(now_ms),
            ..Default::default()
        };
        if results.is_empty() {
            tracing::info!(
                target = "optimizer",
                domain = cfg.domain.as_str(),
                "auto-test produced no viable endpoints; keeping previous candidates"
            );
        } else {
            patch.candidate_ips = Some(results.iter().map(|r| r.ip.clone()).collect());
            tracing::info!(
                target = "optimizer",
                domain = cfg.domain.as_str(),
                candidates = results.len(),
                best_latency_ms = results[0].avg_latency_ms,
                "auto-test refreshed candidates"
            );
        }
        // 每个域名落库后立刻刷新快照，后续域名在长扫描里也能用上新结果
        match ctx.store.update_optimized_domain_config(cfg.id, patch) {
            Ok(()) => ctx.resolver.refresh(),
            Err(err) => {
                tracing::warn!(
                    target = "optimizer",
                    domain = cfg.domain.as_str(),
                    error = %err,
                    "auto-test failed to persist results"
                );
            }
        }
        tested += 1;
    }
    tested
}

/// 后台自动测速服务：独立线程承载专用 runtime，预热期结束后按固定
/// 间隔扫描。stop() 或 Drop 时通过标志位加 Notify 唤醒并退出循环。
pub struct AutoTestService {
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl AutoTestService {
    /// 启动后台服务。进程内已有实例时返回 None（幂等启动）。
    pub fn spawn(
        ctx: AutoTestContext,
        warmup: Duration,
        sweep_interval: Duration,
    ) -> Option<AutoTestService> {
        if STARTED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(
                target = "optimizer",
                "auto-test service already running; ignoring duplicate spawn"
            );
            return None;
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let thread_stop = stop_flag.clone();
        let thread_notify = notify.clone();

        let handle = std::thread::Builder::new()
            .name("optimizer-auto-test".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!(target = "optimizer", error = %err, "auto-test runtime build failed");
                        return;
                    }
                };
                rt.block_on(run_loop(ctx, warmup, sweep_interval, thread_stop, thread_notify));
            });

        match handle {
            Ok(handle) => {
                tracing::info!(
                    target = "optimizer",
                    warmup_secs = warmup.as_secs(),
                    sweep_interval_secs = sweep_interval.as_secs(),
                    "auto-test service started"
                );
                Some(AutoTestService {
                    stop_flag,
                    notify,
                    handle: Some(handle),
                })
            }
            Err(err) => {
                STARTED.store(false, Ordering::SeqCst);
                tracing::error!(target = "optimizer", error = %err, "auto-test thread spawn failed");
                None
            }
        }
    }

    pub fn stop(&mut self) {
        // 只有首次 stop 负责收尾；之后的 stop/Drop 不得重置全局启动标志
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop_flag.store(true, Ordering::SeqCst);
        // notify_one 会留存一个许可，线程尚未进入等待时也不会丢失唤醒
        self.notify.notify_one();
        if handle.join().is_err() {
            tracing::warn!(target = "optimizer", "auto-test thread exited abnormally");
        }
        STARTED.store(false, Ordering::SeqCst);
    }
}

impl Drop for AutoTestService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    ctx: AutoTestContext,
    warmup: Duration,
    sweep_interval: Duration,
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    // 预热期：等启动期的网络抖动过去再开始首轮扫描
    tokio::select! {
        _ = tokio::time::sleep(warmup) => {}
        _ = notify.notified() => {}
    }

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let tested = sweep_once(&ctx, current_epoch_ms()).await;
        tracing::debug!(target = "optimizer", tested, "auto-test sweep complete");
        tokio::select! {
            _ = tokio::time::sleep(sweep_interval) => {}
            _ = notify.notified() => {}
        }
    }
    tracing::info!(target = "optimizer", "auto-test service stopped");
}
