use serde::{Deserialize, Serialize};

fn default_log_level() -> String {
    "info".into()
}

pub fn default_cache_ttl_secs() -> u64 {
    60
}

pub fn default_blacklist_threshold() -> u32 {
    3
}

pub fn default_probe_timeout_ms() -> u64 {
    3_000
}

pub fn default_probe_batch_size() -> usize {
    10
}

pub fn default_auto_test_count() -> u32 {
    3
}

pub fn default_warmup_secs() -> u64 {
    60
}

pub fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_primary_source_url() -> String {
    "https://addressesapi.090227.xyz/ct".into()
}

fn default_mirror_source_url() -> String {
    "https://raw.githubusercontent.com/ymyuuu/IPDB/main/BestCF/bestcfv4.txt".into()
}

/// 上游优化器的运行期配置，来自主配置文件（config.json）。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerCfg {
    /// 解析缓存 TTL（秒）。
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// (域名, IP) 累计失败达到该次数后从候选中剔除。
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: u32,
    /// 单次探测的硬超时（毫秒）。
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// 并发探测批大小，限制同时外连的数量。
    #[serde(default = "default_probe_batch_size")]
    pub probe_batch_size: usize,
    /// 自动测速时每个候选 IP 的探测次数。
    #[serde(default = "default_auto_test_count")]
    pub auto_test_count: u32,
    /// 调度器启动后的一次性预热延迟（秒）。
    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,
    /// 调度器巡检间隔（秒）。
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 优选 IP 主源。
    #[serde(default = "default_primary_source_url")]
    pub primary_source_url: String,
    /// 优选 IP 镜像静态列表。
    #[serde(default = "default_mirror_source_url")]
    pub mirror_source_url: String,
    /// 可选：覆盖持久化存储文件路径，缺省时由模块自行推导。
    #[serde(default)]
    pub store_path: Option<String>,
}

impl Default for OptimizerCfg {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            blacklist_threshold: default_blacklist_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_batch_size: default_probe_batch_size(),
            auto_test_count: default_auto_test_count(),
            warmup_secs: default_warmup_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            primary_source_url: default_primary_source_url(),
            mirror_source_url: default_mirror_source_url(),
            store_path: None,
        }
    }
}

/// 应用级配置根。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub optimizer: OptimizerCfg,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerCfg::default(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = OptimizerCfg::default();
        assert_eq!(cfg.cache_ttl_secs, 60);
        assert_eq!(cfg.blacklist_threshold, 3);
        assert_eq!(cfg.probe_batch_size, 10);
        assert_eq!(cfg.sweep_interval_secs, 300);
    }

    #[test]
    fn empty_json_deserializes_with_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(cfg.optimizer, OptimizerCfg::default());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn camel_case_fields_roundtrip() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("cacheTtlSecs"));
        assert!(json.contains("probeTimeoutMs"));
        let back: AppConfig = serde_json::from_str(&json).expect("roundtrip");
        assert_eq!(back, cfg);
    }
}
