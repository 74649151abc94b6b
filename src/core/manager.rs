//! 队列的公开句柄。
//!
//! 所有操作都是往 worker 发命令再等 oneshot 回执，
//! worker 退出后统一报 WorkerShutdown。

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::config::QueueConfig;
use crate::core::errors::{Result, UploadError};
use crate::core::scheduler::QueueWorker;
use crate::core::traits::Collaborators;
use crate::core::types::{
    ClipMetadata, EnqueueOptions, EnqueueRequest, OwnerId, QueueEvent, QueueStats, TaskId,
    TaskStatus, UploadTask,
};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// 队列命令
pub(crate) enum QueueCommand {
    Enqueue {
        request: EnqueueRequest,
        reply: oneshot::Sender<Result<TaskId>>,
    },
    Retry {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Pause {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    ClearCompleted {
        reply: oneshot::Sender<Result<()>>,
    },
    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },
    ListTasks {
        status: Option<TaskStatus>,
        reply: oneshot::Sender<Vec<UploadTask>>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
    History {
        reply: oneshot::Sender<Result<Vec<UploadTask>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// 单个 owner 的上传队列
pub struct UploadQueue {
    owner: OwnerId,
    command_tx: mpsc::Sender<QueueCommand>,
    event_tx: broadcast::Sender<QueueEvent>,
    worker_handle: JoinHandle<()>,
}

impl UploadQueue {
    /// 创建队列并在后台启动它的 worker
    pub fn new(owner: OwnerId, collaborators: Collaborators, config: QueueConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let worker = QueueWorker::new(owner.clone(), collaborators, config, event_tx.clone());
        let worker_handle = tokio::spawn(worker.run(command_rx));

        Self {
            owner,
            command_tx,
            event_tx,
            worker_handle,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// 订阅队列事件
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| UploadError::WorkerShutdown)?;

        reply_rx.await.map_err(|_| UploadError::WorkerShutdown)
    }

    /// 入队一个视频/缩略图对。
    /// 队列满了报 QueueFull，源文件缺失或超限同步报 Validation。
    pub async fn enqueue(
        &self,
        video_path: impl Into<String>,
        thumbnail_path: Option<String>,
        metadata: ClipMetadata,
        options: EnqueueOptions,
    ) -> Result<TaskId> {
        let request = EnqueueRequest {
            video_path: video_path.into(),
            thumbnail_path,
            metadata,
            options,
        };

        self.send(|reply| QueueCommand::Enqueue { request, reply })
            .await?
    }

    /// 手动重试一个失败任务
    pub async fn retry(&self, task_id: TaskId) -> Result<bool> {
        self.send(|reply| QueueCommand::Retry { task_id, reply }).await
    }

    /// 取消任务并把它移出队列
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        self.send(|reply| QueueCommand::Cancel { task_id, reply }).await
    }

    /// 暂停任务。上传中的任务会被打断，恢复后从头上传。
    pub async fn pause(&self, task_id: TaskId) -> Result<bool> {
        self.send(|reply| QueueCommand::Pause { task_id, reply }).await
    }

    /// 恢复一个暂停的任务
    pub async fn resume(&self, task_id: TaskId) -> Result<bool> {
        self.send(|reply| QueueCommand::Resume { task_id, reply }).await
    }

    /// 已完成任务先归档进有界历史，再移出活动队列
    pub async fn clear_completed(&self) -> Result<()> {
        self.send(|reply| QueueCommand::ClearCompleted { reply })
            .await?
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<UploadTask>> {
        self.send(|reply| QueueCommand::GetTask { task_id, reply }).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<UploadTask>> {
        self.send(|reply| QueueCommand::ListTasks { status, reply }).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.send(|reply| QueueCommand::Stats { reply }).await
    }

    /// 正在上传的任务数
    pub async fn active_count(&self) -> Result<usize> {
        self.send(|reply| QueueCommand::ActiveCount { reply }).await
    }

    /// 读取归档的完成历史
    pub async fn history(&self) -> Result<Vec<UploadTask>> {
        self.send(|reply| QueueCommand::History { reply }).await?
    }

    /// 停掉 worker。在途上传会被打断，重启后从持久化状态恢复。
    pub async fn shutdown(&self) -> Result<()> {
        self.send(|reply| QueueCommand::Shutdown { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}
