use std::sync::Arc;

use super::store::ConfigStore;

/// 候选排除策略：判断某个 (域名, IP) 是否不再参与选择。
/// 单独抽象成 trait，便于后续替换为带衰减/过期的策略而不触及 Resolver。
pub trait ExclusionPolicy: Send + Sync {
    fn is_excluded(&self, domain: &str, ip: &str) -> bool;
    fn excluded_ips(&self, domain: &str) -> Vec<String>;
}

/// 当前唯一实现：累计失败次数达到阈值即永久排除（不自动清除）。
pub struct FailureCountPolicy {
    store: Arc<ConfigStore>,
    threshold: u32,
}

impl FailureCountPolicy {
    pub fn new(store: Arc<ConfigStore>, threshold: u32) -> Self {
        Self { store, threshold }
    }
}

impl ExclusionPolicy for FailureCountPolicy {
    fn is_excluded(&self, domain: &str, ip: &str) -> bool {
        self.store
            .get_blacklist_entry(domain, ip)
            .map(|e| e.failure_count >= self.threshold)
            .unwrap_or(false)
    }

    fn excluded_ips(&self, domain: &str) -> Vec<String> {
        match self.store.get_blacklisted_ips(domain, self.threshold) {
            Ok(ips) => ips,
            Err(err) => {
                tracing::warn!(
                    target = "optimizer",
                    domain,
                    error = %err,
                    "blacklist lookup failed; excluding nothing"
                );
                Vec::new()
            }
        }
    }
}

/// 健康台账门面：探测失败的唯一记录入口。
pub struct HealthRegistry {
    store: Arc<ConfigStore>,
    threshold: u32,
}

impl HealthRegistry {
    pub fn new(store: Arc<ConfigStore>, threshold: u32) -> Self {
        Self { store, threshold }
    }

    /// 记录一次失败。持久化错误只记日志，绝不向探测热路径传播。
    pub fn record_failure(
        &self,
        domain: &str,
        ip: &str,
        error_type: Option<&str>,
        error_message: Option<&str>,
    ) {
        match self
            .store
            .upsert_blacklist_entry(domain, ip, error_type, error_message)
        {
            Ok(count) => {
                tracing::debug!(
                    target = "optimizer",
                    domain,
                    ip,
                    failure_count = count,
                    error_type,
                    "probe failure recorded"
                );
                if count == self.threshold {
                    tracing::warn!(
                        target = "optimizer",
                        domain,
                        ip,
                        threshold = self.threshold,
                        "ip reached blacklist threshold; excluded from selection"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "optimizer",
                    domain,
                    ip,
                    error = %err,
                    "failed to persist probe failure"
                );
            }
        }
    }

    /// 达到阈值的 IP 列表，供探测前剔除已知坏节点。
    pub fn blacklisted(&self, domain: &str) -> Vec<String> {
        match self.store.get_blacklisted_ips(domain, self.threshold) {
            Ok(ips) => ips,
            Err(err) => {
                tracing::warn!(
                    target = "optimizer",
                    domain,
                    error = %err,
                    "blacklist lookup failed; treating all candidates as healthy"
                );
                Vec::new()
            }
        }
    }
}
