use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use super::errors::Result;
use super::types::ClipMetadata;

/// 本地文件信息
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub exists: bool,
    pub size: u64,
}

/// 对象存储 - 流水线只依赖这四个操作
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// 把一段字节写到 bucket 内的路径。
    /// `upsert` 为 true 时允许覆盖已有对象。
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
        upsert: bool,
    ) -> Result<()>;

    /// 下载整个对象（回读校验用）
    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes>;

    /// 对象的公开访问 URL
    async fn public_url(&self, bucket: &str, path: &str) -> Result<String>;
}

/// 远端处理调用 - 把已上传的原始文件交给服务端转码入库
#[async_trait]
pub trait RemoteProcessor: Send + Sync {
    async fn process(&self, remote_file: &str, metadata: &ClipMetadata) -> Result<()>;
}

/// 持久化 KV 存储，崩溃恢复用。不假设任何事务语义。
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// 本地媒体文件读取
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// 文件是否存在、多大
    async fn stat(&self, uri: &str) -> Result<FileStat>;

    /// 读出整个文件内容的 base64 编码
    async fn read_base64(&self, uri: &str) -> Result<String>;
}

/// 队列依赖的外部协作者集合
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn ObjectStorage>,
    pub processor: Arc<dyn RemoteProcessor>,
    pub state: Arc<dyn StateStore>,
    pub media: Arc<dyn MediaSource>,
}
