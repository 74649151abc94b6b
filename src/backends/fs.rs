//! 本地文件系统协作者

use std::io::ErrorKind;
use std::path::PathBuf;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use crate::core::errors::Result;
use crate::core::traits::{FileStat, MediaSource, StateStore};

/// file:// URI 或普通路径都接受
fn local_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

/// tokio::fs 实现的媒体读取
#[derive(Debug, Clone, Copy, Default)]
pub struct FsMediaSource;

#[async_trait]
impl MediaSource for FsMediaSource {
    async fn stat(&self, uri: &str) -> Result<FileStat> {
        match tokio::fs::metadata(local_path(uri)).await {
            Ok(meta) => Ok(FileStat {
                exists: meta.is_file(),
                size: meta.len(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(FileStat {
                exists: false,
                size: 0,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_base64(&self, uri: &str) -> Result<String> {
        let data = tokio::fs::read(local_path(uri)).await?;
        Ok(BASE64_STANDARD.encode(data))
    }
}

/// 一个 key 一个文件的持久化存储
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // key 里的冒号等分隔符不能变成路径层级
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{name}.json"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.key_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.key_path(key), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_strips_scheme() {
        assert_eq!(local_path("file:///tmp/a.mp4"), "/tmp/a.mp4");
        assert_eq!(local_path("/tmp/a.mp4"), "/tmp/a.mp4");
    }

    #[tokio::test]
    async fn test_stat_missing_file() {
        let source = FsMediaSource;
        let stat = source.stat("/definitely/not/here.mp4").await.unwrap();
        assert!(!stat.exists);
        assert_eq!(stat.size, 0);
    }

    #[tokio::test]
    async fn test_read_base64_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        tokio::fs::write(&path, b"raw bytes").await.unwrap();

        let source = FsMediaSource;
        let encoded = source.read_base64(path.to_str().unwrap()).await.unwrap();
        assert_eq!(BASE64_STANDARD.decode(encoded).unwrap(), b"raw bytes");
    }

    #[tokio::test]
    async fn test_file_state_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        assert_eq!(store.get("backhaul:queue:v1:u1").await.unwrap(), None);

        store.set("backhaul:queue:v1:u1", "[1,2]").await.unwrap();
        assert_eq!(
            store.get("backhaul:queue:v1:u1").await.unwrap().as_deref(),
            Some("[1,2]")
        );

        store.remove("backhaul:queue:v1:u1").await.unwrap();
        assert_eq!(store.get("backhaul:queue:v1:u1").await.unwrap(), None);
        // 删除不存在的 key 不报错
        store.remove("backhaul:queue:v1:u1").await.unwrap();
    }
}
