//! 日志模块 - 文件日志（按大小轮转）+ 调试构建下的控制台输出

use crate::config::{load_section, save_section};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

const LOG_FILE_NAME: &str = "app.log";

/// 日志配置（`config.json` 中的 `log` 段落）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB），超过后轮转为 app.log.old
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" | "warn" | "info" | "debug" | "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "log", self)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

type SharedFile = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock(file: &SharedFile) -> MutexGuard<'_, Option<BufWriter<File>>> {
    // 写日志的线程 panic 后继续使用同一个文件句柄
    file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    file: SharedFile,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = u64::from(max_size_mb) * 1024 * 1024;
        let writer = Self::open(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            file: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn open(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        if Self::oversized(file_path, max_size) {
            Self::rotate(file_path)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    fn oversized(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path).is_ok_and(|m| m.len() > max_size)
    }

    /// app.log -> app.log.old（覆盖旧备份）
    fn rotate(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn rotate_if_needed(&self) -> io::Result<()> {
        if !Self::oversized(&self.file_path, self.max_size) {
            return Ok(());
        }
        let mut guard = lock(&self.file);
        if let Some(mut old) = guard.take() {
            let _ = old.flush();
        }
        Self::rotate(&self.file_path)?;
        *guard = Some(Self::open(&self.file_path, self.max_size)?);
        Ok(())
    }
}

/// 单次日志事件的写入句柄
pub struct LogWriter {
    owner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = lock(&self.owner.file);
            let writer = guard
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件不可用"))?;
            let n = writer.write(buf)?;
            writer.flush()?;
            n
        };
        let _ = self.owner.rotate_if_needed();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.owner.file).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            owner: self.clone(),
        }
    }
}

/// 日志目录跟随配置目录
pub fn log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

/// 初始化全局 tracing subscriber，可重复调用（后续调用无效）
pub fn init(config_dir: &Path) {
    let config = LogConfig::load(config_dir);

    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();

    let file_layer = match SizeRotatingWriter::new(&log_dir(config_dir), config.max_size_mb) {
        Ok(writer) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        ),
        Err(e) => {
            eprintln!("无法创建日志文件，仅输出到控制台: {}", e);
            None
        }
    };

    // 调试构建或文件日志不可用时输出到控制台
    let console_layer = (cfg!(debug_assertions) || file_layer.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.level = "DEBUG".into();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        config.level = "nonsense".into();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_log_config_roundtrip_through_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            enabled: false,
            max_size_mb: 1,
            level: "warn".into(),
        };
        config.save(dir.path()).unwrap();
        let loaded = LogConfig::load(dir.path());
        assert!(!loaded.enabled);
        assert_eq!(loaded.max_size_mb, 1);
    }

    #[test]
    fn test_writer_rotates_when_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeRotatingWriter {
            file_path: dir.path().join(LOG_FILE_NAME),
            max_size: 16,
            file: Arc::new(Mutex::new(Some(
                SizeRotatingWriter::open(&dir.path().join(LOG_FILE_NAME), 16).unwrap(),
            ))),
        };

        let mut w = writer.make_writer();
        w.write_all(b"0123456789abcdefghij\n").unwrap();
        assert!(dir.path().join("app.log.old").exists());

        w.write_all(b"next\n").unwrap();
        let current = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(current, "next\n");
    }
}
