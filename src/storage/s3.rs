use super::{
    temp_path, ObjectStore, RemoteObject, StorageError, TransferProgress, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS, TRANSFER_CHUNK_SIZE,
};
use crate::secrets::Credentials;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct S3ObjectStore {
    operator: Operator,
    name: String,
}

impl S3ObjectStore {
    pub fn new(
        bucket: &str,
        region: &str,
        credentials: &Credentials,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> anyhow::Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(&credentials.access_key)
            .secret_access_key(&credentials.secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }

    async fn upload_chunks(
        &self,
        file: &mut tokio::fs::File,
        writer: &mut opendal::Writer,
        total: u64,
        on_progress: TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(buf[..n].to_vec()).await?;
            sent += n as u64;
            on_progress(sent, total);
        }
        writer.close().await?;
        Ok(())
    }

    async fn download_chunks(
        reader: &opendal::Reader,
        file: &mut tokio::fs::File,
        total: u64,
    ) -> Result<(), StorageError> {
        let mut offset = 0u64;
        while offset < total {
            let end = (offset + TRANSFER_CHUNK_SIZE as u64).min(total);
            let buffer = reader.read(offset..end).await?;
            for chunk in buffer {
                file.write_all(&chunk).await?;
            }
            offset = end;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        local_path: &Path,
        remote_key: &str,
        on_progress: TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let total = file.metadata().await?.len();
        let mut writer = self.operator.writer(remote_key).await?;

        if let Err(e) = self
            .upload_chunks(&mut file, &mut writer, total, on_progress)
            .await
        {
            // 中途失败时放弃分片上传，避免残留半个对象
            if let Err(abort_err) = writer.abort().await {
                tracing::debug!("放弃上传失败: {} - {}", remote_key, abort_err);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, remote_key: &str, local_path: &Path) -> Result<(), StorageError> {
        let total = self.operator.stat(remote_key).await?.content_length();
        let reader = self.operator.reader(remote_key).await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 按块读取写入临时文件，然后原子重命名
        let temp_path = temp_path(local_path);
        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            Self::download_chunks(&reader, &mut file, total).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, local_path).await?;
            Ok::<(), StorageError>(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn delete(&self, remote_key: &str) -> Result<(), StorageError> {
        // S3 删除不存在的文件不会报错
        self.operator.delete(remote_key).await?;
        Ok(())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Result<RemoteObject, StorageError>>, StorageError> {
        // 使用 lister_with 进行递归列表
        let lister = self
            .operator
            .lister_with(prefix)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        let stream = lister
            .map_err(StorageError::from)
            .try_filter_map(|entry| {
                let meta = entry.metadata();
                let key = entry.path().trim_start_matches('/').to_string();
                let object = if key.is_empty() || meta.is_dir() {
                    None
                } else {
                    Some(RemoteObject {
                        key,
                        size: meta.content_length(),
                        modified_time: meta.last_modified().map_or(0, |t| t.timestamp()),
                    })
                };
                futures::future::ready(Ok(object))
            })
            .boxed();

        Ok(stream)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.operator.list("").await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
