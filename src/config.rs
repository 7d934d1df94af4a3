//! 应用配置模块
//!
//! 所有配置保存在 `<config_dir>/config.json`，按段落（`profiles`、`retry`、`scan`、`log`）
//! 读写；缺失的文件或段落回退到默认值。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.json";

/// 存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
}

/// 连接配置（凭据不在此处，见 `secrets`）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    pub name: String,
    #[serde(rename = "type", default = "default_storage_type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// 本地存储目录（`type = local` 时使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_storage_type() -> StorageType {
    StorageType::S3
}

/// 退避方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 两次尝试之间的等待（毫秒）
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    /// 指数退避的上限（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Fixed
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: default_backoff(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// 扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// 忽略规则（glob patterns），命中的文件不计入扫描
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "desktop.ini".to_string(),
    ]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

/// 会话使用的全部配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub profiles: Vec<StorageProfile>,
    pub retry: RetryConfig,
    pub scan: ScanConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            profiles: load_section(config_dir, "profiles").unwrap_or_default(),
            retry: load_section(config_dir, "retry").unwrap_or_default(),
            scan: load_section(config_dir, "scan").unwrap_or_default(),
        }
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "profiles", &self.profiles)?;
        save_section(config_dir, "retry", &self.retry)?;
        save_section(config_dir, "scan", &self.scan)
    }

    pub fn profile(&self, name: &str) -> Option<&StorageProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

fn read_config_value(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE_NAME)).ok()?;
    serde_json::from_str(&content).ok()
}

/// 从配置文件读取一个段落，文件或段落不存在、格式不对时返回 None
pub fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let section = read_config_value(config_dir)?.get(key)?.clone();
    match serde_json::from_value(section) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置段落 {} 无效，使用默认值: {}", key, e);
            None
        }
    }
}

/// 写回一个段落，保留文件中的其他段落
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;

    // 读取现有配置
    let mut config = read_config_value(config_dir)
        .filter(|v| v.is_object())
        .unwrap_or_else(|| serde_json::json!({}));

    config[key] = serde_json::to_value(value)?;

    let content = serde_json::to_string_pretty(&config)?;
    fs::write(config_dir.join(CONFIG_FILE_NAME), content)
}

/// 平台默认配置目录
pub fn default_config_dir() -> PathBuf {
    let base = if cfg!(target_os = "windows") {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    } else {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    };

    base.map(|p| p.join("foldersync"))
        .unwrap_or_else(|| PathBuf::from(".foldersync"))
}

/// 解析实际使用的配置目录：默认目录中的 `data_path` 可以把数据迁到别处
pub fn resolve_config_dir(default_dir: &Path) -> PathBuf {
    read_config_value(default_dir)
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or_else(|| default_dir.to_path_buf())
}
