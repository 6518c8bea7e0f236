use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::Serialize;

use super::registry::ExclusionPolicy;
use super::store::{ConfigStore, OptimizedDomainConfig};

/// 一次解析的产物：命中的配置域名与本次随机选中的候选 IP。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// 命中的配置条目域名（可能是请求主机名的父域）。
    pub config_domain: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStats {
    pub domains: usize,
    pub enabled: bool,
    /// 距上次成功加载的毫秒数；从未加载时为 None。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u64>,
}

struct Snapshot {
    domains: Vec<OptimizedDomainConfig>,
    enabled: bool,
    loaded_at: Option<Instant>,
}

/// 域名解析器：带 TTL 的仓库快照缓存 + 每次调用独立的均匀随机选取。
/// 加载失败时继续使用旧快照（宁可陈旧也不中断拨号热路径）。
pub struct DomainResolver {
    store: Arc<ConfigStore>,
    exclusion: Arc<dyn ExclusionPolicy>,
    ttl: Duration,
    state: RwLock<Snapshot>,
}

impl DomainResolver {
    pub fn new(
        store: Arc<ConfigStore>,
        exclusion: Arc<dyn ExclusionPolicy>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            exclusion,
            ttl,
            state: RwLock::new(Snapshot {
                domains: Vec::new(),
                enabled: true,
                loaded_at: None,
            }),
        }
    }

    /// 查找主机名对应的优化目标。未配置、总开关关闭、候选全部被排除
    /// 时返回 None，调用方回落到普通拨号。
    pub async fn resolve(&self, hostname: &str) -> Option<ResolvedTarget> {
        self.ensure_fresh();
        let host = hostname.to_ascii_lowercase();
        let (config_domain, candidates) = {
            let guard = self.state.read().ok()?;
            if !guard.enabled {
                return None;
            }
            let cfg = match_domain(&guard.domains, &host)?;
            if !cfg.enabled || cfg.candidate_ips.is_empty() {
                return None;
            }
            (cfg.domain.clone(), cfg.candidate_ips.clone())
        };

        // 黑名单过滤在快照锁外执行，避免持锁访问仓库
        let viable: Vec<Ipv4Addr> = candidates
            .iter()
            .filter(|ip| !self.exclusion.is_excluded(&config_domain, ip))
            .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
            .collect();
        if viable.is_empty() {
            tracing::debug!(
                target = "optimizer",
                hostname = host.as_str(),
                config_domain = config_domain.as_str(),
                "all candidates excluded; falling back to normal dialing"
            );
            return None;
        }

        let ip = *viable.choose(&mut rand::thread_rng())?;
        tracing::debug!(
            target = "optimizer",
            hostname = host.as_str(),
            config_domain = config_domain.as_str(),
            ip = %ip,
            viable = viable.len(),
            "resolved optimized endpoint"
        );
        Some(ResolvedTarget { config_domain, ip })
    }

    /// 立即重新加载快照，绕过 TTL；配置变更后调用。
    pub fn refresh(&self) {
        self.reload();
    }

    pub fn stats(&self) -> ResolverStats {
        match self.state.read() {
            Ok(guard) => ResolverStats {
                domains: guard.domains.len(),
                enabled: guard.enabled,
                cache_age_ms: guard
                    .loaded_at
                    .map(|at| at.elapsed().as_millis() as u64),
            },
            Err(_) => ResolverStats {
                domains: 0,
                enabled: false,
                cache_age_ms: None,
            },
        }
    }

    fn ensure_fresh(&self) {
        let stale = match self.state.read() {
            Ok(guard) => guard
                .loaded_at
                .map(|at| at.elapsed() >= self.ttl)
                .unwrap_or(true),
            Err(_) => true,
        };
        if stale {
            self.reload();
        }
    }

    fn reload(&self) {
        let domains = self.store.get_optimized_domain_configs(true);
        let toggle = self.store.get_system_toggle();
        let mut guard = match self.state.write() {
            Ok(g) => g,
            Err(_) => return,
        };
        match (domains, toggle) {
            (Ok(domains), Ok(toggle)) => {
                guard.domains = domains;
                guard.enabled = toggle.enable_cf_optimization;
                guard.loaded_at = Some(Instant::now());
            }
            (domains, toggle) => {
                if let Err(err) = &domains {
                    tracing::warn!(target = "optimizer", error = %err, "domain snapshot reload failed; keeping stale data");
                }
                if let Err(err) = &toggle {
                    tracing::warn!(target = "optimizer", error = %err, "toggle reload failed; keeping stale data");
                }
                // 失败也推进时间戳，避免每次解析都重试加载
                guard.loaded_at = Some(Instant::now());
            }
        }
    }
}

/// 先精确匹配，再做严格子域匹配（boundary 必须是 '.'，裸后缀不算）。
/// 多个父域同时命中时取最长的那个。
fn match_domain<'a>(
    domains: &'a [OptimizedDomainConfig],
    host: &str,
) -> Option<&'a OptimizedDomainConfig> {
    if let Some(exact) = domains.iter().find(|d| d.domain == host) {
        return Some(exact);
    }
    domains
        .iter()
        .filter(|d| is_strict_subdomain(host, &d.domain))
        .max_by_key(|d| d.domain.len())
}

fn is_strict_subdomain(host: &str, domain: &str) -> bool {
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::optimizer::registry::FailureCountPolicy;
    use std::collections::HashSet;
    use tokio::runtime::Builder;

    fn resolver_with(store: Arc<ConfigStore>) -> DomainResolver {
        let policy = Arc::new(FailureCountPolicy::new(store.clone(), 3));
        DomainResolver::new(store, policy, Duration::from_secs(60))
    }

    fn insert_domain(store: &ConfigStore, domain: &str, ips: &[&str]) {
        let mut cfg = OptimizedDomainConfig::new(domain);
        cfg.candidate_ips = ips.iter().map(|s| s.to_string()).collect();
        store.insert_optimized_domain_config(cfg).unwrap();
    }

    fn test_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn unconfigured_host_resolves_to_none() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        let resolver = resolver_with(store);
        assert!(rt.block_on(resolver.resolve("api.example.com")).is_none());
    }

    #[test]
    fn system_toggle_off_disables_all_domains() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        insert_domain(&store, "api.example.com", &["1.1.1.1"]);
        store
            .set_system_toggle(crate::core::optimizer::store::SystemToggle {
                enable_cf_optimization: false,
            })
            .unwrap();
        let resolver = resolver_with(store);
        assert!(rt.block_on(resolver.resolve("api.example.com")).is_none());
    }

    #[test]
    fn blacklisted_ips_are_skipped_and_all_blacklisted_means_none() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        insert_domain(&store, "api.example.com", &["1.1.1.1", "2.2.2.2"]);
        for _ in 0..3 {
            store
                .upsert_blacklist_entry("api.example.com", "1.1.1.1", None, None)
                .unwrap();
        }
        let resolver = resolver_with(store.clone());
        for _ in 0..20 {
            let target = rt
                .block_on(resolver.resolve("api.example.com"))
                .expect("one viable ip remains");
            assert_eq!(target.ip, "2.2.2.2".parse::<Ipv4Addr>().unwrap());
        }
        for _ in 0..3 {
            store
                .upsert_blacklist_entry("api.example.com", "2.2.2.2", None, None)
                .unwrap();
        }
        assert!(rt.block_on(resolver.resolve("api.example.com")).is_none());
    }

    #[test]
    fn random_pick_covers_every_candidate() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        insert_domain(&store, "api.example.com", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
        let resolver = resolver_with(store);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let target = rt.block_on(resolver.resolve("api.example.com")).unwrap();
            seen.insert(target.ip);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn subdomain_matching_is_strict() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        insert_domain(&store, "example.com", &["1.1.1.1"]);
        let resolver = resolver_with(store);
        let hit = rt.block_on(resolver.resolve("api.example.com")).unwrap();
        assert_eq!(hit.config_domain, "example.com");
        // 裸后缀不是子域
        assert!(rt.block_on(resolver.resolve("notexample.com")).is_none());
        assert!(rt.block_on(resolver.resolve("example.com.evil.org")).is_none());
    }

    #[test]
    fn exact_match_wins_over_parent_domain() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        insert_domain(&store, "example.com", &["1.1.1.1"]);
        insert_domain(&store, "api.example.com", &["2.2.2.2"]);
        let resolver = resolver_with(store);
        let hit = rt.block_on(resolver.resolve("api.example.com")).unwrap();
        assert_eq!(hit.config_domain, "api.example.com");
        assert_eq!(hit.ip, "2.2.2.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn disabled_domain_or_empty_candidates_resolve_to_none() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        let mut off = OptimizedDomainConfig::new("off.example.com");
        off.enabled = false;
        off.candidate_ips = vec!["1.1.1.1".into()];
        store.insert_optimized_domain_config(off).unwrap();
        insert_domain(&store, "empty.example.com", &[]);
        let resolver = resolver_with(store);
        assert!(rt.block_on(resolver.resolve("off.example.com")).is_none());
        assert!(rt.block_on(resolver.resolve("empty.example.com")).is_none());
    }

    #[test]
    fn refresh_picks_up_new_store_state_before_ttl() {
        let rt = test_runtime();
        let store = Arc::new(ConfigStore::in_memory());
        let resolver = resolver_with(store.clone());
        assert!(rt.block_on(resolver.resolve("api.example.com")).is_none());
        insert_domain(&store, "api.example.com", &["1.1.1.1"]);
        // TTL 尚未过期，旧快照依旧生效
        assert!(rt.block_on(resolver.resolve("api.example.com")).is_none());
        resolver.refresh();
        assert!(rt.block_on(resolver.resolve("api.example.com")).is_some());
        let stats = resolver.stats();
        assert_eq!(stats.domains, 1);
        assert!(stats.enabled);
        assert!(stats.cache_age_ms.is_some());
    }
}
