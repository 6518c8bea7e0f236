use anyhow::{Context, Result};
use dirs_next as dirs;
use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use super::model::AppConfig;

fn join_default_path(base: &Path) -> PathBuf {
    let mut p = base.to_path_buf();
    p.push("config");
    p.push("config.json");
    p
}

// 全局配置基目录（由宿主进程在启动阶段注入）
static GLOBAL_BASE_DIR: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

fn global_base_dir() -> Option<PathBuf> {
    GLOBAL_BASE_DIR.lock().ok().and_then(|guard| guard.clone())
}

/// 由应用在启动时设置配置基目录，一旦设置将作为默认配置路径的来源。
/// 重复设置将被忽略（保持第一次设置的值）。
pub fn set_global_base_dir<P: AsRef<Path>>(base: P) {
    if let Ok(mut guard) = GLOBAL_BASE_DIR.lock() {
        if guard.is_none() {
            *guard = Some(base.as_ref().to_path_buf());
        }
    }
}

fn config_path() -> PathBuf {
    // 优先使用注入的基目录；若尚未注入，则回退到系统应用配置目录
    let base = global_base_dir().unwrap_or_else(|| {
        if let Some(mut dir) = dirs::config_dir() {
            dir.push("upstream-optimizer");
            dir
        } else {
            // 极端环境下获取失败，才回退到当前目录
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        }
    });
    join_default_path(&base)
}

/// 返回配置基目录（包含 config 子目录的上一级），用于派生其它持久化文件。
pub fn base_dir() -> PathBuf {
    let p = config_path();
    p.parent()
        .unwrap_or_else(|| Path::new("."))
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

pub fn load_or_init() -> Result<AppConfig> {
    load_or_init_at(&base_dir())
}

pub fn load_or_init_at(base_dir: &Path) -> Result<AppConfig> {
    let path = join_default_path(base_dir);
    if path.exists() {
        let data = fs::read(&path).with_context(|| format!("read config: {}", path.display()))?;
        let cfg: AppConfig = serde_json::from_slice(&data).context("parse config json")?;
        Ok(cfg)
    } else {
        let cfg = AppConfig::default();
        save_at(&cfg, base_dir)?;
        Ok(cfg)
    }
}

pub fn save_at(cfg: &AppConfig, base_dir: &Path) -> Result<()> {
    let path = join_default_path(base_dir);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).ok();
    }
    let json = serde_json::to_string_pretty(cfg).context("serialize config")?;
    let mut file =
        fs::File::create(&path).with_context(|| format!("create config: {}", path.display()))?;
    file.write_all(json.as_bytes()).context("write config")?;
    tracing::info!(target = "config", path = %path.display(), "config saved");
    Ok(())
}
