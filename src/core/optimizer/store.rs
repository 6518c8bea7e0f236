use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration as StdDuration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const STORE_FILE_NAME: &str = "optimizer-store.json";

fn default_true() -> bool {
    true
}

pub fn default_auto_test_interval_minutes() -> u64 {
    60
}

pub(crate) fn current_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| StdDuration::from_secs(0))
        .as_millis() as i64
}

/// 单个被优化域名的持久化配置。域名作为唯一键，统一小写存储。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedDomainConfig {
    pub id: Uuid,
    pub domain: String,
    /// 候选 IPv4 字面量，按探测排名有序，允许为空。
    #[serde(default)]
    pub candidate_ips: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_test_enabled: bool,
    #[serde(default = "default_auto_test_interval_minutes")]
    pub auto_test_interval_minutes: u64,
    /// 最近一次自动测速时间（Unix epoch 毫秒），从未测速时为 None。
    #[serde(default)]
    pub last_auto_test_at: Option<i64>,
    #[serde(default)]
    pub description: String,
}

impl OptimizedDomainConfig {
    pub fn new<S: Into<String>>(domain: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into().to_ascii_lowercase(),
            candidate_ips: Vec::new(),
            enabled: true,
            auto_test_enabled: false,
            auto_test_interval_minutes: default_auto_test_interval_minutes(),
            last_auto_test_at: None,
            description: String::new(),
        }
    }
}

/// (域名, IP) 维度的失败台账，只增不减。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    pub domain: String,
    pub ip: String,
    pub failure_count: u32,
    #[serde(default)]
    pub last_error_type: Option<String>,
    #[serde(default)]
    pub last_error_message: Option<String>,
    pub last_failure_at: i64,
}

/// 系统级总开关：为 false 时所有域名一律不优化。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemToggle {
    #[serde(default = "default_true")]
    pub enable_cf_optimization: bool,
}

impl Default for SystemToggle {
    fn default() -> Self {
        Self {
            enable_cf_optimization: true,
        }
    }
}

/// 域名配置的部分更新；None 字段保持原值。
#[derive(Debug, Clone, Default)]
pub struct DomainConfigPatch {
    pub candidate_ips: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub auto_test_enabled: Option<bool>,
    pub auto_test_interval_minutes: Option<u64>,
    pub last_auto_test_at: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    #[serde(default)]
    domains: Vec<OptimizedDomainConfig>,
    #[serde(default)]
    toggle: SystemToggle,
    #[serde(default)]
    blacklist: Vec<BlacklistEntry>,
}

/// 持久化仓库：域名配置、系统开关与黑名单台账的唯一出入口。
/// 所有变更都在内部锁内完成并写穿到磁盘，调用方不做读-改-写。
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    inner: Mutex<StoreFile>,
}

impl ConfigStore {
    pub fn load_or_init_at(base_dir: &Path) -> Result<Self> {
        let path = Self::join_store_path(base_dir);
        Self::load_or_init_from_file(&path)
    }

    pub fn load_or_init_from_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let file = if path.exists() {
            let data = fs::read(path)
                .with_context(|| format!("read optimizer store: {}", path.display()))?;
            match serde_json::from_slice::<StoreFile>(&data) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(
                        target = "optimizer",
                        path = %path.display(),
                        error = %err,
                        "optimizer store corrupted, resetting"
                    );
                    StoreFile::default()
                }
            }
        } else {
            let default = StoreFile::default();
            Self::persist(Some(path), &default)?;
            default
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(file),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(StoreFile::default()),
        }
    }

    fn join_store_path(base_dir: &Path) -> PathBuf {
        let mut p = base_dir.to_path_buf();
        p.push("config");
        p.push(STORE_FILE_NAME);
        p
    }

    pub fn get_optimized_domain_configs(
        &self,
        only_enabled: bool,
    ) -> Result<Vec<OptimizedDomainConfig>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        Ok(guard
            .domains
            .iter()
            .filter(|d| !only_enabled || d.enabled)
            .cloned()
            .collect())
    }

    pub fn get_system_toggle(&self) -> Result<SystemToggle> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        Ok(guard.toggle)
    }

    pub fn set_system_toggle(&self, toggle: SystemToggle) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        guard.toggle = toggle;
        Self::persist(self.path.as_deref(), &guard)
    }

    pub fn insert_optimized_domain_config(&self, cfg: OptimizedDomainConfig) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        let key = cfg.domain.to_ascii_lowercase();
        if guard.domains.iter().any(|d| d.domain == key) {
            return Err(anyhow!("domain '{}' already configured", key));
        }
        guard.domains.push(OptimizedDomainConfig {
            domain: key,
            ..cfg
        });
        Self::persist(self.path.as_deref(), &guard)
    }

    pub fn remove_optimized_domain_config(&self, domain: &str) -> Result<bool> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        let key = domain.to_ascii_lowercase();
        if let Some(idx) = guard.domains.iter().position(|d| d.domain == key) {
            guard.domains.remove(idx);
            Self::persist(self.path.as_deref(), &guard)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn update_optimized_domain_config(
        &self,
        id: Uuid,
        patch: DomainConfigPatch,
    ) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        let entry = guard
            .domains
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow!("domain config {} not found", id))?;
        if let Some(ips) = patch.candidate_ips {
            entry.candidate_ips = ips;
        }
        if let Some(enabled) = patch.enabled {
            entry.enabled = enabled;
        }
        if let Some(auto) = patch.auto_test_enabled {
            entry.auto_test_enabled = auto;
        }
        if let Some(interval) = patch.auto_test_interval_minutes {
            entry.auto_test_interval_minutes = interval.max(1);
        }
        if let Some(at) = patch.last_auto_test_at {
            entry.last_auto_test_at = Some(at);
        }
        if let Some(desc) = patch.description {
            entry.description = desc;
        }
        Self::persist(self.path.as_deref(), &guard)
    }

    /// 失败台账 upsert：首次失败建档 failure_count=1，其后在锁内原子自增，
    /// 并覆盖最近一次错误信息与时间戳。并发调用不会丢失计数。
    pub fn upsert_blacklist_entry(
        &self,
        domain: &str,
        ip: &str,
        error_type: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<u32> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        let key = domain.to_ascii_lowercase();
        let now_ms = current_epoch_ms();
        let count = if let Some(entry) = guard
            .blacklist
            .iter_mut()
            .find(|e| e.domain == key && e.ip == ip)
        {
            entry.failure_count = entry.failure_count.saturating_add(1);
            entry.last_error_type = error_type.map(str::to_string);
            entry.last_error_message = error_message.map(str::to_string);
            entry.last_failure_at = now_ms;
            entry.failure_count
        } else {
            guard.blacklist.push(BlacklistEntry {
                domain: key,
                ip: ip.to_string(),
                failure_count: 1,
                last_error_type: error_type.map(str::to_string),
                last_error_message: error_message.map(str::to_string),
                last_failure_at: now_ms,
            });
            1
        };
        Self::persist(self.path.as_deref(), &guard)?;
        Ok(count)
    }

    pub fn get_blacklisted_ips(&self, domain: &str, threshold: u32) -> Result<Vec<String>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("optimizer store poisoned"))?;
        let key = domain.to_ascii_lowercase();
        Ok(guard
            .blacklist
            .iter()
            .filter(|e| e.domain == key && e.failure_count >= threshold)
            .map(|e| e.ip.clone())
            .collect())
    }

    pub fn get_blacklist_entry(&self, domain: &str, ip: &str) -> Option<BlacklistEntry> {
        let guard = self.inner.lock().ok()?;
        let key = domain.to_ascii_lowercase();
        guard
            .blacklist
            .iter()
            .find(|e| e.domain == key && e.ip == ip)
            .cloned()
    }

    fn persist(path: Option<&Path>, file: &StoreFile) -> Result<()> {
        if let Some(path) = path {
            let json = serde_json::to_string_pretty(file).context("serialize optimizer store")?;
            fs::write(path, json)
                .with_context(|| format!("write optimizer store: {}", path.display()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_creates_file() {
        let dir = std::env::temp_dir().join(format!("optimizer-store-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let store = ConfigStore::load_or_init_at(&dir).expect("load store");
        assert!(ConfigStore::join_store_path(&dir).exists());
        assert!(store
            .get_optimized_domain_configs(false)
            .unwrap()
            .is_empty());
        assert!(store.get_system_toggle().unwrap().enable_cf_optimization);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn insert_lowercases_domain_and_rejects_duplicates() {
        let store = ConfigStore::in_memory();
        store
            .insert_optimized_domain_config(OptimizedDomainConfig::new("API.Example.COM"))
            .expect("insert");
        let configs = store.get_optimized_domain_configs(false).unwrap();
        assert_eq!(configs[0].domain, "api.example.com");
        assert!(store
            .insert_optimized_domain_config(OptimizedDomainConfig::new("api.example.com"))
            .is_err());
    }

    #[test]
    fn only_enabled_filter_applies() {
        let store = ConfigStore::in_memory();
        let mut off = OptimizedDomainConfig::new("off.example.com");
        off.enabled = false;
        store.insert_optimized_domain_config(off).unwrap();
        store
            .insert_optimized_domain_config(OptimizedDomainConfig::new("on.example.com"))
            .unwrap();
        assert_eq!(store.get_optimized_domain_configs(false).unwrap().len(), 2);
        let enabled = store.get_optimized_domain_configs(true).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].domain, "on.example.com");
    }

    #[test]
    fn update_patch_only_touches_given_fields() {
        let store = ConfigStore::in_memory();
        let cfg = OptimizedDomainConfig::new("api.example.com");
        let id = cfg.id;
        store.insert_optimized_domain_config(cfg).unwrap();
        store
            .update_optimized_domain_config(
                id,
                DomainConfigPatch {
                    candidate_ips: Some(vec!["1.1.1.1".into()]),
                    last_auto_test_at: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();
        let got = &store.get_optimized_domain_configs(false).unwrap()[0];
        assert_eq!(got.candidate_ips, vec!["1.1.1.1".to_string()]);
        assert_eq!(got.last_auto_test_at, Some(42));
        assert!(got.enabled);
        assert_eq!(got.auto_test_interval_minutes, 60);
    }

    #[test]
    fn blacklist_upsert_increments_and_overwrites_error() {
        let store = ConfigStore::in_memory();
        let first = store
            .upsert_blacklist_entry("Api.Example.com", "1.1.1.1", Some("connect"), Some("refused"))
            .unwrap();
        assert_eq!(first, 1);
        let second = store
            .upsert_blacklist_entry("api.example.com", "1.1.1.1", Some("timeout"), Some("3000ms"))
            .unwrap();
        assert_eq!(second, 2);
        let entry = store.get_blacklist_entry("api.example.com", "1.1.1.1").unwrap();
        assert_eq!(entry.failure_count, 2);
        assert_eq!(entry.last_error_type.as_deref(), Some("timeout"));
        assert_eq!(entry.last_error_message.as_deref(), Some("3000ms"));
    }

    #[test]
    fn blacklisted_ips_respect_threshold() {
        let store = ConfigStore::in_memory();
        for _ in 0..3 {
            store
                .upsert_blacklist_entry("d.example.com", "1.1.1.1", None, None)
                .unwrap();
        }
        store
            .upsert_blacklist_entry("d.example.com", "2.2.2.2", None, None)
            .unwrap();
        let bad = store.get_blacklisted_ips("d.example.com", 3).unwrap();
        assert_eq!(bad, vec!["1.1.1.1".to_string()]);
        // 其它域名的台账互不影响
        assert!(store
            .get_blacklisted_ips("other.example.com", 3)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn concurrent_upserts_do_not_lose_updates() {
        use std::sync::Arc;
        let store = Arc::new(ConfigStore::in_memory());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    store
                        .upsert_blacklist_entry("race.example.com", "9.9.9.9", None, None)
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let entry = store
            .get_blacklist_entry("race.example.com", "9.9.9.9")
            .unwrap();
        assert_eq!(entry.failure_count, 200);
    }
}
