use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod secrets;
pub mod storage;

pub use config::{AppConfig, StorageProfile, StorageType};
pub use crate::core::{
    PassOutcome, ProgressEvent, SyncEngine, SyncPolicy, SyncResult, SyncStats, SyncWorker,
};
pub use error::SyncError;
pub use secrets::{Credentials, KeyringSecretStore, SecretStore};

/// 同步会话：配置目录 + 应用配置，显式传给引擎构造，不使用全局状态
#[derive(Debug, Clone)]
pub struct SyncSession {
    config_dir: PathBuf,
    config: AppConfig,
}

impl SyncSession {
    pub fn new(config_dir: PathBuf, config: AppConfig) -> Self {
        Self { config_dir, config }
    }

    /// 从平台默认配置目录加载（跟随 `data_path` 迁移）
    pub fn load() -> anyhow::Result<Self> {
        let default_dir = config::default_config_dir();
        std::fs::create_dir_all(&default_dir)
            .with_context(|| format!("无法创建配置目录: {:?}", default_dir))?;
        Self::from_dir(&config::resolve_config_dir(&default_dir))
    }

    pub fn from_dir(config_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("无法创建配置目录: {:?}", config_dir))?;
        let config = AppConfig::load(config_dir);
        tracing::debug!(
            "加载配置: {:?}, {} 个存储配置",
            config_dir,
            config.profiles.len()
        );
        Ok(Self::new(config_dir.to_path_buf(), config))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 用已有的存储实例构造引擎，重试与扫描配置取自本会话
    pub fn engine_with_store(&self, store: Arc<dyn storage::ObjectStore>) -> SyncEngine {
        SyncEngine::new(
            store,
            crate::core::RetryPolicy::from_config(&self.config.retry),
            self.config.scan.clone(),
        )
    }

    /// 按存储配置名连接对象存储
    pub async fn connect(
        &self,
        profile_name: &str,
        secrets: &dyn SecretStore,
    ) -> anyhow::Result<SyncEngine> {
        let profile = self
            .config
            .profile(profile_name)
            .ok_or_else(|| anyhow::anyhow!("未找到存储配置: {}", profile_name))?;

        let credentials = match profile.typ {
            StorageType::Local => None,
            StorageType::S3 => Some(
                secrets
                    .get_credentials(profile_name)
                    .await
                    .with_context(|| format!("读取凭据失败: {}", profile_name))?,
            ),
        };

        let store = storage::create_object_store(profile, credentials.as_ref()).await?;
        tracing::info!("已连接存储: {} ({})", profile_name, store.name());
        Ok(self.engine_with_store(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecretStore;

    fn session_with(profiles: Vec<StorageProfile>) -> SyncSession {
        let config = AppConfig {
            profiles,
            ..AppConfig::default()
        };
        SyncSession::new(PathBuf::from("unused"), config)
    }

    #[tokio::test]
    async fn test_connect_local_profile() {
        let remote = tempfile::tempdir().unwrap();
        let session = session_with(vec![StorageProfile {
            name: "nas".into(),
            typ: StorageType::Local,
            bucket: None,
            region: None,
            endpoint: None,
            prefix: None,
            path: Some(remote.path().to_string_lossy().into_owned()),
        }]);

        let engine = session
            .connect("nas", &StaticSecretStore::new())
            .await
            .unwrap();
        assert!(engine.store_name().starts_with("local:"));
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let session = session_with(vec![StorageProfile {
            name: "s3".into(),
            typ: StorageType::S3,
            bucket: Some("bucket".into()),
            region: Some("us-east-1".into()),
            endpoint: None,
            prefix: None,
            path: None,
        }]);
        let secrets = StaticSecretStore::new();

        assert!(session.connect("missing", &secrets).await.is_err());
        // 没有凭据
        assert!(session.connect("s3", &secrets).await.is_err());
    }
}
