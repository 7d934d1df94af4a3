//! 内容指纹：对文件完整字节流计算 BLAKE3（256 位）摘要

use crate::error::{Result, SyncError};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// 每次读取的块大小，内存占用与文件大小无关
pub const FINGERPRINT_CHUNK_SIZE: usize = 64 * 1024;

/// 同步计算文件指纹（十六进制）。路径不是普通文件时返回 `NotFound`。
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let metadata = std::fs::metadata(path).map_err(|e| SyncError::from_io(path, e))?;
    if !metadata.is_file() {
        return Err(SyncError::NotFound(path.to_path_buf()));
    }

    let mut file = File::open(path).map_err(|e| SyncError::from_io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; FINGERPRINT_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| SyncError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// 在阻塞线程池中计算指纹
pub async fn fingerprint(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || fingerprint_file(&path))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_matches_one_shot_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        // 跨越多个块
        let data: Vec<u8> = (0..FINGERPRINT_CHUNK_SIZE * 3 + 17)
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(&path, &data).unwrap();

        let hash = fingerprint_file(&path).unwrap();
        assert_eq!(hash, blake3::hash(&data).to_hex().to_string());
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_same_content_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"content").unwrap();
        std::fs::write(&b, b"content").unwrap();
        assert_eq!(fingerprint_file(&a).unwrap(), fingerprint_file(&b).unwrap());

        std::fs::write(&b, b"contenT").unwrap();
        assert_ne!(fingerprint_file(&a).unwrap(), fingerprint_file(&b).unwrap());
    }

    #[test]
    fn test_missing_or_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            fingerprint_file(&dir.path().join("gone")),
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            fingerprint_file(dir.path()),
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_async_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(
            fingerprint(path.clone()).await.unwrap(),
            fingerprint_file(&path).unwrap()
        );
    }
}
