//! 凭据读取
//!
//! 凭据从不写入 `config.json`，由系统钥匙串提供。

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// 钥匙串服务名
pub const KEYRING_SERVICE: &str = "foldersync";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("未找到配置 {0} 的凭据")]
    NotFound(String),

    #[error("钥匙串错误: {0}")]
    Backend(String),
}

/// 对象存储访问凭据
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &mask(&self.access_key))
            .field("secret_key", &"***")
            .finish()
    }
}

/// 只保留首尾四位，用于日志
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_credentials(&self, profile_name: &str) -> Result<Credentials, SecretError>;
}

/// 系统钥匙串实现，条目名为 `<profile>_access` / `<profile>_secret`
pub struct KeyringSecretStore {
    service_name: String,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self {
            service_name: KEYRING_SERVICE.to_string(),
        }
    }

    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn read_entry(&self, profile_name: &str, user: &str) -> Result<String, SecretError> {
        let entry = keyring::Entry::new(&self.service_name, user)
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        match entry.get_password() {
            Ok(value) => Ok(value),
            Err(keyring::Error::NoEntry) => Err(SecretError::NotFound(profile_name.to_string())),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn get_credentials(&self, profile_name: &str) -> Result<Credentials, SecretError> {
        let access_key = self.read_entry(profile_name, &format!("{}_access", profile_name))?;
        let secret_key = self.read_entry(profile_name, &format!("{}_secret", profile_name))?;
        debug!(profile = profile_name, access_key = %mask(&access_key), "从钥匙串读取凭据");
        Ok(Credentials {
            access_key,
            secret_key,
        })
    }
}

/// 内存中的凭据表（命令行参数、环境变量、测试）
#[derive(Default)]
pub struct StaticSecretStore {
    entries: HashMap<String, Credentials>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, profile_name: &str, credentials: Credentials) -> Self {
        self.entries.insert(profile_name.to_string(), credentials);
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_credentials(&self, profile_name: &str) -> Result<Credentials, SecretError> {
        self.entries
            .get(profile_name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(profile_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("AKIA1234567890XYZ"), "AKIA***0XYZ");
        assert_eq!(mask("short"), "***");
    }

    #[tokio::test]
    async fn test_static_store() {
        let store = StaticSecretStore::new().with(
            "default",
            Credentials {
                access_key: "ak".into(),
                secret_key: "sk".into(),
            },
        );
        let creds = store.get_credentials("default").await.unwrap();
        assert_eq!(creds.access_key, "ak");
        assert!(matches!(
            store.get_credentials("other").await,
            Err(SecretError::NotFound(_))
        ));
    }

    /// 需要系统钥匙串（macOS Keychain / Windows 凭据管理器 / Secret Service），
    /// 用 `cargo test -- --ignored` 运行
    #[tokio::test]
    #[ignore]
    async fn test_keyring_round_trip() {
        let service = format!("foldersync-test-{}", uuid::Uuid::new_v4().simple());
        let profile = "roundtrip";
        let access = keyring::Entry::new(&service, &format!("{}_access", profile)).unwrap();
        let secret = keyring::Entry::new(&service, &format!("{}_secret", profile)).unwrap();
        access.set_password("AKIA1234567890XYZ").unwrap();
        secret.set_password("s3cr3t").unwrap();

        // 新建的 Entry 能读到说明写进了持久化的钥匙串，而不是只存在于单个 Entry 的内存里
        let store = KeyringSecretStore::with_service_name(&service);
        let creds = store.get_credentials(profile).await;

        access.delete_credential().unwrap();
        secret.delete_credential().unwrap();

        let creds = creds.unwrap();
        assert_eq!(creds.access_key, "AKIA1234567890XYZ");
        assert_eq!(creds.secret_key, "s3cr3t");
        assert!(matches!(
            store.get_credentials(profile).await,
            Err(SecretError::NotFound(_))
        ));
    }
}
