//! 资产上传。
//!
//! 缩略图走覆盖写；原始视频走不可覆盖的投递路径，上传完成后
//! 回读一次校验大小。存储端出现过悄悄收下截断对象的情况，
//! 只信上传返回值会丢数据。

use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use crate::config::QueueConfig;
use crate::core::errors::{Result, UploadError};
use crate::core::traits::{MediaSource, ObjectStorage};
use crate::core::types::{OwnerId, UploadStage};
use super::codec;

/// 进度回调，参数是阶段内 [0, 1] 的完成度
pub type ProgressFn = Arc<dyn Fn(f64, UploadStage) + Send + Sync>;

/// 视频阶段内的进度划分：读取到 0.2，解码到 0.3，传输到 0.85，校验到 1.0
const READ_DONE: f64 = 0.2;
const DECODE_DONE: f64 = 0.3;
const TRANSFER_DONE: f64 = 0.85;

/// 存储客户端没有原生进度回调，网络阶段按节拍估算推进
const TRANSFER_TICK: Duration = Duration::from_millis(400);
const TRANSFER_STEP: f64 = 0.05;

/// 视频上传的产出
#[derive(Debug, Clone)]
pub struct VideoUpload {
    pub remote_file: String,
    pub file_size: u64,
}

pub struct AssetUploader {
    storage: Arc<dyn ObjectStorage>,
    media: Arc<dyn MediaSource>,
    config: QueueConfig,
}

impl AssetUploader {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        media: Arc<dyn MediaSource>,
        config: QueueConfig,
    ) -> Self {
        Self {
            storage,
            media,
            config,
        }
    }

    /// 缩略图：读 -> 解码 -> 覆盖写 -> 公开 URL。
    /// 存储错误原样向上抛，这一阶段是可重试的。
    pub async fn upload_thumbnail(
        &self,
        uri: &str,
        metadata_id: &str,
        owner: &OwnerId,
    ) -> Result<String> {
        let encoded = self.media.read_base64(uri).await?;
        let data = codec::decode_base64_chunked(&encoded).await?;
        drop(encoded);

        let ext = extension_for(uri);
        let path = format!("{owner}/{metadata_id}/thumbnail.{ext}");
        self.storage
            .upload(
                &self.config.media_bucket,
                &path,
                Bytes::from(data),
                content_type_for(uri),
                true,
            )
            .await?;

        self.storage.public_url(&self.config.media_bucket, &path).await
    }

    /// 视频：校验 -> 读取 -> 解码 -> 上传 -> 回读校验。
    /// 源文件缺失、为空、超限都是校验错误，立刻失败且不消耗重试次数。
    pub async fn upload_video(
        &self,
        uri: &str,
        metadata_id: &str,
        cancel: &CancellationToken,
        on_progress: ProgressFn,
    ) -> Result<VideoUpload> {
        let stat = self.media.stat(uri).await?;
        if !stat.exists {
            return Err(UploadError::validation(format!(
                "Source file does not exist: {uri}"
            )));
        }
        if stat.size == 0 {
            return Err(UploadError::validation(format!("Source file is empty: {uri}")));
        }
        if stat.size > self.config.max_file_size {
            return Err(UploadError::validation(format!(
                "File size {} exceeds the {} byte limit",
                stat.size, self.config.max_file_size
            )));
        }

        on_progress(0.0, UploadStage::Reading);

        // 读取
        let encoded = tokio::select! {
            result = self.media.read_base64(uri) => result?,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        };
        on_progress(READ_DONE, UploadStage::Reading);

        // 解码
        let data = tokio::select! {
            result = codec::decode_base64_chunked(&encoded) => result?,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        };
        drop(encoded);
        on_progress(DECODE_DONE, UploadStage::Decoding);

        // 上传。解码缓冲的所有权转进请求，future 结束时随之释放，
        // 校验阶段开始前内存已经还回去了。
        let remote_file = format!("{metadata_id}.mp4");
        let upload_target = remote_file.clone();
        let upload_fut = self.storage.upload(
            &self.config.intake_bucket,
            &upload_target,
            Bytes::from(data),
            "video/mp4",
            false,
        );
        tokio::pin!(upload_fut);

        let mut ticker = tokio::time::interval(TRANSFER_TICK);
        ticker.tick().await; // 第一跳是立即的，跳过
        let mut estimated = DECODE_DONE;

        loop {
            tokio::select! {
                result = &mut upload_fut => {
                    result?;
                    break;
                }
                _ = ticker.tick() => {
                    estimated = (estimated + TRANSFER_STEP).min(TRANSFER_DONE);
                    on_progress(estimated, UploadStage::Transferring);
                }
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            }
        }
        on_progress(TRANSFER_DONE, UploadStage::Transferring);

        // 回读校验
        let downloaded = tokio::select! {
            result = self.storage.download(&self.config.intake_bucket, &remote_file) => result?,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        };
        if downloaded.is_empty() {
            return Err(UploadError::Storage(format!(
                "Read-back verification failed: {remote_file} is empty on the server"
            )));
        }
        on_progress(1.0, UploadStage::Verifying);

        Ok(VideoUpload {
            remote_file,
            file_size: stat.size,
        })
    }

    /// 投递 bucket 内对象的公开地址
    pub async fn intake_public_url(&self, remote_file: &str) -> Result<String> {
        self.storage
            .public_url(&self.config.intake_bucket, remote_file)
            .await
    }
}

fn extension_for(uri: &str) -> String {
    uri.rsplit('.')
        .next()
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && !ext.contains('/'))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".to_string())
}

fn content_type_for(uri: &str) -> &'static str {
    match extension_for(uri).as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("file:///tmp/cover.PNG"), "png");
        assert_eq!(extension_for("/tmp/cover.webp"), "webp");
        // 没有扩展名时落回 jpg
        assert_eq!(extension_for("/tmp/cover"), "jpg");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("/a/b.png"), "image/png");
        assert_eq!(content_type_for("/a/b.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("/a/b.jpg"), "image/jpeg");
        assert_eq!(content_type_for("/a/b.webp"), "image/webp");
        assert_eq!(content_type_for("/a/b"), "image/jpeg");
    }
}
