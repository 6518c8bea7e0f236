use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::core::config::model::OptimizerCfg;

use super::connector::ConnectorFactory;
use super::prober::Prober;
use super::registry::{FailureCountPolicy, HealthRegistry};
use super::resolver::DomainResolver;
use super::scheduler::{AutoTestContext, AutoTestService};
use super::sources::CandidateSources;
use super::store::ConfigStore;

/// 优化器装配体：按配置把仓库、解析器、探测器与拨号器工厂接成
/// 一个整体，宿主只与它交互。
pub struct OptimizerRuntime {
    cfg: OptimizerCfg,
    store: Arc<ConfigStore>,
    resolver: Arc<DomainResolver>,
    prober: Arc<Prober>,
    factory: ConnectorFactory,
}

impl OptimizerRuntime {
    /// 从配置与基目录装配。store_path 配置项可覆盖持久化文件位置。
    pub fn build(cfg: &OptimizerCfg, base_dir: &Path) -> Result<Self> {
        let store = match &cfg.store_path {
            Some(path) => Arc::new(ConfigStore::load_or_init_from_file(Path::new(path))?),
            None => Arc::new(ConfigStore::load_or_init_at(base_dir)?),
        };
        Ok(Self::assemble(cfg.clone(), store))
    }

    /// 纯内存装配，不落盘；测试与一次性工具用。
    pub fn build_in_memory(cfg: &OptimizerCfg) -> Self {
        Self::assemble(cfg.clone(), Arc::new(ConfigStore::in_memory()))
    }

    fn assemble(cfg: OptimizerCfg, store: Arc<ConfigStore>) -> Self {
        let policy = Arc::new(FailureCountPolicy::new(
            store.clone(),
            cfg.blacklist_threshold,
        ));
        let resolver = Arc::new(DomainResolver::new(
            store.clone(),
            policy,
            Duration::from_secs(cfg.cache_ttl_secs),
        ));
        let registry = Arc::new(HealthRegistry::new(store.clone(), cfg.blacklist_threshold));
        let prober = Arc::new(Prober::new(
            Arc::new(CandidateSources::new(&cfg)),
            registry,
            cfg.probe_batch_size,
        ));
        let factory = ConnectorFactory::new(resolver.clone());
        Self {
            cfg,
            store,
            resolver,
            prober,
            factory,
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<DomainResolver> {
        &self.resolver
    }

    pub fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    pub fn connector_factory(&self) -> &ConnectorFactory {
        &self.factory
    }

    /// 手动触发一次测速（管理操作），使用配置的次数与超时。
    pub async fn probe_domain(&self, domain: &str) -> Vec<super::prober::ProbeResult> {
        self.prober
            .probe_domain(domain, self.cfg.auto_test_count, self.cfg.probe_timeout_ms)
            .await
    }

    /// 启动后台自动测速；进程内已有实例时返回 None。
    pub fn start_auto_test(&self) -> Option<AutoTestService> {
        AutoTestService::spawn(
            AutoTestContext {
                store: self.store.clone(),
                prober: self.prober.clone(),
                resolver: self.resolver.clone(),
                test_count: self.cfg.auto_test_count,
                timeout_ms: self.cfg.probe_timeout_ms,
            },
            Duration::from_secs(self.cfg.warmup_secs),
            Duration::from_secs(self.cfg.sweep_interval_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::optimizer::store::OptimizedDomainConfig;
    use tokio::runtime::Builder;
    use uuid::Uuid;

    #[test]
    fn build_uses_store_path_override() {
        let path = std::env::temp_dir().join(format!("optimizer-mgr-{}.json", Uuid::new_v4()));
        let cfg = OptimizerCfg {
            store_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let runtime = OptimizerRuntime::build(&cfg, Path::new("/nonexistent-base")).unwrap();
        runtime
            .store()
            .insert_optimized_domain_config(OptimizedDomainConfig::new("api.example.com"))
            .unwrap();
        assert!(path.exists());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn in_memory_runtime_resolves_end_to_end() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let runtime = OptimizerRuntime::build_in_memory(&OptimizerCfg::default());
        let mut cfg = OptimizedDomainConfig::new("api.example.com");
        cfg.candidate_ips = vec!["104.16.1.1".into()];
        runtime.store().insert_optimized_domain_config(cfg).unwrap();
        runtime.resolver().refresh();
        let conn = rt
            .block_on(runtime.connector_factory().build("https://api.example.com/v1"))
            .expect("configured domain");
        assert_eq!(conn.ip, "104.16.1.1".parse::<std::net::Ipv4Addr>().unwrap());
    }
}
