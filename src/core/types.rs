use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 队列归属者，一个用户一条队列
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待中（在队列中）
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已暂停
    Paused,
}

impl TaskStatus {
    /// 状态机允许的转移。
    /// 注意没有 Pending -> Completed，也没有离开 Completed 的边。
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, to),
            (Pending, Uploading)
                | (Pending, Paused)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Pending)
                | (Uploading, Paused)
                | (Failed, Pending)
                | (Paused, Pending)
        )
    }
}

/// 进度事件所处的流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    /// 缩略图上传
    Thumbnail,
    /// 读取本地文件
    Reading,
    /// Base64 解码
    Decoding,
    /// 网络传输
    Transferring,
    /// 回读校验
    Verifying,
    /// 远端处理
    Processing,
    /// 全部完成
    Done,
}

/// 随任务转发到远端处理的元数据。
/// `id` 用来命名派生的存储对象，其余字段原样透传。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClipMetadata {
    pub id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClipMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub owner_id: OwnerId,
    pub video_path: String,
    pub thumbnail_path: Option<String>,
    pub metadata: ClipMetadata,
    pub status: TaskStatus,
    /// [0, 1]，整个生命周期内单调不减
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 最近一次失败原因，手动重试时清除
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub file_size_bytes: Option<u64>,
    pub upload_duration_ms: Option<u64>,
    pub final_video_url: Option<String>,
    pub final_thumbnail_url: Option<String>,
    pub remote_id: Option<String>,
}

impl UploadTask {
    pub(crate) fn new(owner_id: OwnerId, request: EnqueueRequest, max_retries: u32) -> Self {
        Self {
            id: TaskId::new(),
            owner_id,
            video_path: request.video_path,
            thumbnail_path: request.thumbnail_path,
            metadata: request.metadata,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            max_retries: request.options.max_retries.unwrap_or(max_retries),
            file_size_bytes: None,
            upload_duration_ms: None,
            final_video_url: None,
            final_thumbnail_url: None,
            remote_id: None,
        }
    }

    /// 应用一次进度更新。低于当前值的更新直接丢弃，返回 false。
    pub(crate) fn apply_progress(&mut self, value: f64) -> bool {
        let clamped = value.clamp(0.0, 1.0);
        if clamped < self.progress {
            return false;
        }

        self.progress = clamped;
        true
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 入队参数
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub video_path: String,
    pub thumbnail_path: Option<String>,
    pub metadata: ClipMetadata,
    pub options: EnqueueOptions,
}

/// 入队选项
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// 覆盖队列默认的自动重试上限
    pub max_retries: Option<u32>,
}

/// 队列统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    /// completed / (completed + failed)，没有已结束任务时为 0
    pub success_rate: f64,
}

/// 队列事件
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// 队列内容变更（任何状态转移之后广播）
    QueueUpdated {
        tasks: Vec<UploadTask>,
    },

    /// 任务已入队
    UploadAdded {
        task: UploadTask,
    },

    /// 任务开始上传
    UploadStarted {
        task_id: TaskId,
    },

    /// 进度更新（节流后）
    UploadProgress {
        task_id: TaskId,
        progress: f64,
        stage: UploadStage,
    },

    /// 上传成功
    UploadSuccess {
        task: UploadTask,
    },

    /// 上传失败（不可重试或重试已用尽）
    UploadFailed {
        task_id: TaskId,
        error: String,
    },

    /// 任务被取消并移出队列
    UploadCancelled {
        task_id: TaskId,
    },

    /// 即将自动重试
    UploadRetrying {
        task_id: TaskId,
        retry_count: u32,
        next_retry_in_ms: u64,
    },
}

// 静态断言确保类型是 Send 的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadTask>();
        assert_send::<QueueEvent>();
        assert_send::<QueueStats>();
    }
};
