use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::errors::{Result, UploadError};

// 用于序列化 Duration（毫秒）
fn serialize_duration_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

/// 上传队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最大并发上传数
    pub max_concurrent: usize,

    /// 队列容量，所有状态的任务总数上限
    pub queue_size: usize,

    /// 单个视频文件大小上限（字节）
    pub max_file_size: u64,

    /// 默认自动重试上限
    pub max_retries: u32,

    /// 重试退避基数
    #[serde(
        serialize_with = "serialize_duration_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    pub retry_base_delay: Duration,

    /// 重试退避上限
    #[serde(
        serialize_with = "serialize_duration_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    pub retry_max_delay: Duration,

    /// 同一轮调度内相邻任务的启动间隔。
    /// 峰值内存来自并发的 base64 解码而不是带宽，所以刻意错开。
    #[serde(
        serialize_with = "serialize_duration_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    pub task_start_interval: Duration,

    /// 任务完成后距下一轮调度的冷却
    #[serde(
        serialize_with = "serialize_duration_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    pub completion_cooldown: Duration,

    /// 进度事件放行的最小增量
    pub progress_min_delta: f64,

    /// 进度事件的节流窗口
    #[serde(
        serialize_with = "serialize_duration_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    pub progress_interval: Duration,

    /// 完成历史的保留条数
    pub history_limit: usize,

    /// 缩略图等公开资源所在 bucket
    pub media_bucket: String,

    /// 原始视频投递 bucket
    pub intake_bucket: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            queue_size: 20,
            max_file_size: 100 * 1024 * 1024, // 100MB
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            task_start_interval: Duration::from_millis(500),
            completion_cooldown: Duration::from_secs(1),
            progress_min_delta: 0.02,
            progress_interval: Duration::from_millis(100),
            history_limit: 50,
            media_bucket: "media".to_string(),
            intake_bucket: "raw-intake".to_string(),
        }
    }
}

impl QueueConfig {
    /// 从 TOML 文件加载，缺省字段用默认值
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|err| UploadError::Config(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.history_limit, 50);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: QueueConfig = toml::from_str(
            r#"
            max_concurrent = 3
            retry_base_delay = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        // 未给出的字段落回默认
        assert_eq!(config.queue_size, 20);
        assert_eq!(config.intake_bucket, "raw-intake");
    }

    #[test]
    fn test_duration_roundtrip() {
        let config = QueueConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: QueueConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.retry_base_delay, config.retry_base_delay);
        assert_eq!(parsed.progress_interval, config.progress_interval);
    }
}
