//! 队列调度。
//!
//! actor 模式：句柄把命令发进 mpsc，worker 独占全部状态，
//! 事件从 broadcast 出去。一个 owner 一个 worker，互不可见。
//!
//! 已知限制：没有硬超时。网络调用卡死会一直占着槽位，
//! 默认并发为 1 时这是接受的取舍。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::core::errors::{Result, UploadError};
use crate::core::progress::ProgressThrottle;
use crate::core::store::QueueStore;
use crate::core::traits::{Collaborators, MediaSource};
use crate::core::types::{
    EnqueueRequest, OwnerId, QueueEvent, TaskId, TaskStatus, UploadStage, UploadTask,
};
use crate::pipeline::invoker::ProcessingInvoker;
use crate::pipeline::uploader::{AssetUploader, ProgressFn};
use crate::utils::retry::BackoffStrategy;
use super::manager::QueueCommand;

/// 任务级进度区间：缩略图完成 0.05，视频阶段到 0.90，远端处理完成 1.0
const THUMBNAIL_DONE: f64 = 0.05;
const PROCESSING_START: f64 = 0.90;

/// 流水线成功的产出
#[derive(Debug, Clone)]
pub(crate) struct PipelineOutcome {
    final_video_url: String,
    final_thumbnail_url: Option<String>,
    remote_id: String,
    file_size_bytes: u64,
}

/// worker 内部信号
pub(crate) enum WorkerSignal {
    /// 请求一轮调度
    ProcessQueue,
    /// 流水线进度
    Progress {
        task_id: TaskId,
        progress: f64,
        stage: UploadStage,
    },
    /// 流水线结束
    TaskFinished {
        task_id: TaskId,
        result: Result<PipelineOutcome>,
    },
    /// 重试退避到期
    RetryDue {
        task_id: TaskId,
    },
}

struct ActiveUpload {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

enum FailureNext {
    Retry(u32),
    Fail(String),
}

pub(crate) struct QueueWorker {
    owner: OwnerId,
    config: QueueConfig,
    store: QueueStore,
    media: Arc<dyn MediaSource>,
    uploader: Arc<AssetUploader>,
    invoker: ProcessingInvoker,
    backoff: BackoffStrategy,
    active: HashMap<TaskId, ActiveUpload>,
    is_processing: bool,
    throttle: ProgressThrottle,
    event_tx: broadcast::Sender<QueueEvent>,
    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
    signal_rx: mpsc::UnboundedReceiver<WorkerSignal>,
}

impl QueueWorker {
    pub(crate) fn new(
        owner: OwnerId,
        collaborators: Collaborators,
        config: QueueConfig,
        event_tx: broadcast::Sender<QueueEvent>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let store = QueueStore::new(
            owner.clone(),
            collaborators.state.clone(),
            config.queue_size,
            config.history_limit,
        );
        let uploader = Arc::new(AssetUploader::new(
            collaborators.storage.clone(),
            collaborators.media.clone(),
            config.clone(),
        ));
        let invoker = ProcessingInvoker::new(collaborators.processor.clone());
        let backoff = BackoffStrategy::Exponential {
            base: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        };
        let throttle = ProgressThrottle::new(config.progress_min_delta, config.progress_interval);

        Self {
            owner,
            media: collaborators.media,
            config,
            store,
            uploader,
            invoker,
            backoff,
            active: HashMap::new(),
            is_processing: false,
            throttle,
            event_tx,
            signal_tx,
            signal_rx,
        }
    }

    pub(crate) async fn run(mut self, mut command_rx: mpsc::Receiver<QueueCommand>) {
        // 启动即恢复持久化状态
        if let Err(err) = self.store.reload().await {
            warn!(owner = %self.owner, error = %err, "failed to restore persisted queue state");
        }
        if self.store.next_pending().is_some() {
            self.request_process();
        }

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(QueueCommand::Shutdown { reply }) => {
                            self.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        // 所有句柄已丢弃
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
                Some(signal) = self.signal_rx.recv() => {
                    self.handle_signal(signal).await;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // 打断在途上传。落盘里它们保持 Uploading，
        // 下次 reload 会重置为 Pending 从头再来。
        for (_, upload) in self.active.drain() {
            upload.cancel.cancel();
            upload.join.abort();
        }
        debug!(owner = %self.owner, "queue worker shutdown");
    }

    async fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue { request, reply } => {
                let _ = reply.send(self.enqueue(request).await);
            }
            QueueCommand::Retry { task_id, reply } => {
                let _ = reply.send(self.retry(task_id).await);
            }
            QueueCommand::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id).await);
            }
            QueueCommand::Pause { task_id, reply } => {
                let _ = reply.send(self.pause(task_id).await);
            }
            QueueCommand::Resume { task_id, reply } => {
                let _ = reply.send(self.resume(task_id).await);
            }
            QueueCommand::ClearCompleted { reply } => {
                let result = self.store.clear_completed().await;
                if result.is_ok() {
                    self.emit_queue_updated();
                }
                let _ = reply.send(result);
            }
            QueueCommand::GetTask { task_id, reply } => {
                let _ = reply.send(self.store.get(&task_id).cloned());
            }
            QueueCommand::ListTasks { status, reply } => {
                let _ = reply.send(self.store.list(status));
            }
            QueueCommand::Stats { reply } => {
                let _ = reply.send(self.store.stats());
            }
            QueueCommand::ActiveCount { reply } => {
                let _ = reply.send(self.active.len());
            }
            QueueCommand::History { reply } => {
                let _ = reply.send(self.store.load_history().await);
            }
            // run 循环先截获 Shutdown，到不了这里
            QueueCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_signal(&mut self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::ProcessQueue => self.process_queue().await,
            WorkerSignal::Progress {
                task_id,
                progress,
                stage,
            } => self.handle_progress(task_id, progress, stage).await,
            WorkerSignal::TaskFinished { task_id, result } => {
                self.handle_finished(task_id, result).await;
            }
            WorkerSignal::RetryDue { task_id } => {
                // 只要任务还在等待就跑一轮
                if self.store.get(&task_id).map(|t| t.status) == Some(TaskStatus::Pending) {
                    self.process_queue().await;
                }
            }
        }
    }

    // ---- 队列变更命令 ----

    async fn enqueue(&mut self, request: EnqueueRequest) -> Result<TaskId> {
        if self.store.is_full() {
            return Err(UploadError::QueueFull {
                capacity: self.config.queue_size,
            });
        }

        // 入队前同步校验，坏输入永远进不了队列
        let stat = self.media.stat(&request.video_path).await?;
        if !stat.exists {
            return Err(UploadError::validation(format!(
                "Source file does not exist: {}",
                request.video_path
            )));
        }
        if stat.size == 0 {
            return Err(UploadError::validation(format!(
                "Source file is empty: {}",
                request.video_path
            )));
        }
        if stat.size > self.config.max_file_size {
            return Err(UploadError::validation(format!(
                "File size {} exceeds the {} byte limit",
                stat.size, self.config.max_file_size
            )));
        }

        let task = UploadTask::new(self.owner.clone(), request, self.config.max_retries);
        let task_id = task.id;
        self.store.insert(task.clone())?;
        self.store.persist().await?;

        debug!(task_id = %task_id, owner = %self.owner, "task enqueued");
        let _ = self.event_tx.send(QueueEvent::UploadAdded { task });
        self.emit_queue_updated();
        self.request_process();

        Ok(task_id)
    }

    async fn retry(&mut self, task_id: TaskId) -> bool {
        {
            let Some(task) = self.store.get_mut(&task_id) else {
                return false;
            };
            if task.status != TaskStatus::Failed {
                return false;
            }
            task.status = TaskStatus::Pending;
            // 手动重试：错误清除，重试预算重置
            task.error = None;
            task.retry_count = 0;
            task.progress = 0.0;
            task.started_at = None;
            task.completed_at = None;
        }

        self.persist_store().await;
        self.emit_queue_updated();
        self.request_process();
        true
    }

    async fn cancel(&mut self, task_id: TaskId) -> bool {
        if self.store.remove(&task_id).is_none() {
            return false;
        }

        // 被取消的任务不留失败记录，整个移出队列
        if let Some(upload) = self.active.remove(&task_id) {
            upload.cancel.cancel();
        }
        self.throttle.forget(&task_id);

        self.persist_store().await;
        let _ = self.event_tx.send(QueueEvent::UploadCancelled { task_id });
        self.emit_queue_updated();
        self.request_process();
        true
    }

    async fn pause(&mut self, task_id: TaskId) -> bool {
        {
            let Some(task) = self.store.get_mut(&task_id) else {
                return false;
            };
            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Paused;
                }
                TaskStatus::Uploading => {
                    // 中断后没法续传，进度清零重来
                    task.status = TaskStatus::Paused;
                    task.progress = 0.0;
                    task.started_at = None;
                }
                _ => return false,
            }
        }

        if let Some(upload) = self.active.remove(&task_id) {
            upload.cancel.cancel();
        }
        self.throttle.forget(&task_id);

        self.persist_store().await;
        self.emit_queue_updated();
        self.request_process();
        true
    }

    async fn resume(&mut self, task_id: TaskId) -> bool {
        {
            let Some(task) = self.store.get_mut(&task_id) else {
                return false;
            };
            if task.status != TaskStatus::Paused {
                return false;
            }
            task.status = TaskStatus::Pending;
        }

        self.persist_store().await;
        self.emit_queue_updated();
        self.request_process();
        true
    }

    // ---- 调度 ----

    /// 一轮调度。入队、重试到期、完成回调都会触发，对重叠触发幂等。
    async fn process_queue(&mut self) {
        if self.is_processing {
            return;
        }
        self.is_processing = true;

        let available = self.config.max_concurrent.saturating_sub(self.active.len());
        if available > 0 {
            if let Some(task_id) = self.store.next_pending() {
                self.start_task(task_id).await;

                // 刻意一次只放行一个任务：峰值内存吃在并发 base64 解码上，
                // 不在带宽上。还有空槽也等一个间隔再来下一轮。
                if self.active.len() < self.config.max_concurrent
                    && self.store.next_pending().is_some()
                {
                    self.schedule_pass(self.config.task_start_interval);
                }
            }
        }

        self.is_processing = false;
    }

    async fn start_task(&mut self, task_id: TaskId) {
        // 同一任务绝不双开
        if self.active.contains_key(&task_id) {
            return;
        }

        let snapshot = {
            let Some(task) = self.store.get_mut(&task_id) else {
                return;
            };
            if task.status != TaskStatus::Pending {
                return;
            }
            task.status = TaskStatus::Uploading;
            task.started_at = Some(Utc::now());
            task.error = None;
            task.clone()
        };

        self.persist_store().await;
        let _ = self.event_tx.send(QueueEvent::UploadStarted { task_id });
        self.emit_queue_updated();

        let cancel = CancellationToken::new();
        let pipeline_token = cancel.clone();
        let uploader = self.uploader.clone();
        let invoker = self.invoker.clone();
        let signal_tx = self.signal_tx.clone();

        let join = tokio::spawn(async move {
            let result =
                run_pipeline(snapshot, uploader, invoker, pipeline_token, signal_tx.clone()).await;
            let _ = signal_tx.send(WorkerSignal::TaskFinished { task_id, result });
        });

        self.active.insert(task_id, ActiveUpload { cancel, join });
    }

    // ---- 流水线回调 ----

    async fn handle_progress(&mut self, task_id: TaskId, progress: f64, stage: UploadStage) {
        let value = {
            let Some(task) = self.store.get_mut(&task_id) else {
                return;
            };
            // 暂停/取消后迟到的进度直接丢
            if task.status != TaskStatus::Uploading {
                return;
            }
            // 回退的更新既不落盘也不广播
            if !task.apply_progress(progress) {
                return;
            }
            task.progress
        };

        let terminal = stage == UploadStage::Processing;
        if !self.throttle.admit(task_id, value, terminal) {
            return;
        }

        // 先落盘再广播，观察者看到事件时存储一定已经反映它
        self.persist_store().await;
        let _ = self.event_tx.send(QueueEvent::UploadProgress {
            task_id,
            progress: value,
            stage,
        });
    }

    async fn handle_finished(&mut self, task_id: TaskId, result: Result<PipelineOutcome>) {
        self.active.remove(&task_id);

        if self.store.get(&task_id).is_none() {
            // 取消路径已经把任务移出队列
            self.request_process();
            return;
        }

        match result {
            Ok(outcome) => self.finish_success(task_id, outcome).await,
            Err(UploadError::Cancelled) => self.finish_cancelled(task_id).await,
            Err(err) => self.finish_failure(task_id, err).await,
        }
    }

    async fn finish_success(&mut self, task_id: TaskId, outcome: PipelineOutcome) {
        let snapshot = {
            let Some(task) = self.store.get_mut(&task_id) else {
                return;
            };
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.progress = 1.0;
            task.completed_at = Some(now);
            task.error = None;
            task.final_video_url = Some(outcome.final_video_url);
            task.final_thumbnail_url = outcome.final_thumbnail_url;
            task.remote_id = Some(outcome.remote_id);
            task.file_size_bytes = Some(outcome.file_size_bytes);
            task.upload_duration_ms = task
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
            task.clone()
        };

        self.throttle.forget(&task_id);
        self.persist_store().await;

        debug!(
            task_id = %task_id,
            duration_ms = ?snapshot.upload_duration_ms,
            "upload completed"
        );
        let _ = self.event_tx.send(QueueEvent::UploadProgress {
            task_id,
            progress: 1.0,
            stage: UploadStage::Done,
        });
        let _ = self.event_tx.send(QueueEvent::UploadSuccess { task: snapshot });
        self.emit_queue_updated();

        // 完成后冷却一段再放下一个，拉平资源曲线
        self.schedule_pass(self.config.completion_cooldown);
    }

    async fn finish_cancelled(&mut self, task_id: TaskId) {
        let changed = {
            let Some(task) = self.store.get_mut(&task_id) else {
                return;
            };
            if task.status == TaskStatus::Uploading {
                // 令牌被掐断但任务还挂着（比如停机路径）：
                // 按取消收尾，绝不自动重试
                task.status = TaskStatus::Failed;
                task.error = Some(UploadError::Cancelled.to_string());
                true
            } else {
                // 暂停路径已经把状态处理好了
                false
            }
        };

        self.throttle.forget(&task_id);
        if changed {
            self.persist_store().await;
            let _ = self.event_tx.send(QueueEvent::UploadFailed {
                task_id,
                error: UploadError::Cancelled.to_string(),
            });
            self.emit_queue_updated();
        }
        self.request_process();
    }

    async fn finish_failure(&mut self, task_id: TaskId, err: UploadError) {
        let retryable = err.is_retryable();
        let message = err.to_string();

        let next = {
            let Some(task) = self.store.get_mut(&task_id) else {
                return;
            };
            // 和暂停赛跑时以暂停为准
            if task.status != TaskStatus::Uploading {
                return;
            }

            if retryable && task.retry_count < task.max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Pending;
                task.progress = 0.0;
                task.started_at = None;
                task.error = Some(message.clone());
                FailureNext::Retry(task.retry_count)
            } else {
                let final_message = if retryable {
                    format!("{message} (retries exhausted)")
                } else {
                    message.clone()
                };
                task.status = TaskStatus::Failed;
                task.error = Some(final_message.clone());
                FailureNext::Fail(final_message)
            }
        };

        self.throttle.forget(&task_id);
        self.persist_store().await;

        match next {
            FailureNext::Retry(retry_count) => {
                let delay = self.backoff.delay_for(retry_count);
                warn!(
                    task_id = %task_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "upload failed, retry scheduled"
                );
                let _ = self.event_tx.send(QueueEvent::UploadRetrying {
                    task_id,
                    retry_count,
                    next_retry_in_ms: delay.as_millis() as u64,
                });
                self.emit_queue_updated();

                let signal_tx = self.signal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = signal_tx.send(WorkerSignal::RetryDue { task_id });
                });
                // 槽位空出来了，别的等待任务可以先上
                self.request_process();
            }
            FailureNext::Fail(final_message) => {
                error!(task_id = %task_id, error = %final_message, "upload failed permanently");
                let _ = self.event_tx.send(QueueEvent::UploadFailed {
                    task_id,
                    error: final_message,
                });
                self.emit_queue_updated();
                self.request_process();
            }
        }
    }

    // ---- 杂项 ----

    fn request_process(&self) {
        let _ = self.signal_tx.send(WorkerSignal::ProcessQueue);
    }

    fn schedule_pass(&self, delay: Duration) {
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signal_tx.send(WorkerSignal::ProcessQueue);
        });
    }

    async fn persist_store(&self) {
        if let Err(err) = self.store.persist().await {
            warn!(owner = %self.owner, error = %err, "failed to persist queue state");
        }
    }

    fn emit_queue_updated(&self) {
        let _ = self.event_tx.send(QueueEvent::QueueUpdated {
            tasks: self.store.list(None),
        });
    }
}

async fn run_pipeline(
    task: UploadTask,
    uploader: Arc<AssetUploader>,
    invoker: ProcessingInvoker,
    cancel: CancellationToken,
    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
) -> Result<PipelineOutcome> {
    let task_id = task.id;

    // 缩略图（可选，覆盖写）
    let final_thumbnail_url = match &task.thumbnail_path {
        Some(path) => {
            let url = tokio::select! {
                result = uploader.upload_thumbnail(path, &task.metadata.id, &task.owner_id) => result?,
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            };
            let _ = signal_tx.send(WorkerSignal::Progress {
                task_id,
                progress: THUMBNAIL_DONE,
                stage: UploadStage::Thumbnail,
            });
            Some(url)
        }
        None => None,
    };

    // 视频阶段内部的 [0,1] 映射到任务整体区间
    let base = if final_thumbnail_url.is_some() {
        THUMBNAIL_DONE
    } else {
        0.0
    };
    let span = PROCESSING_START - base;
    let progress_tx = signal_tx.clone();
    let on_progress: ProgressFn = Arc::new(move |value, stage| {
        let _ = progress_tx.send(WorkerSignal::Progress {
            task_id,
            progress: base + value * span,
            stage,
        });
    });

    let video = uploader
        .upload_video(&task.video_path, &task.metadata.id, &cancel, on_progress)
        .await?;

    // 远端处理
    let _ = signal_tx.send(WorkerSignal::Progress {
        task_id,
        progress: PROCESSING_START,
        stage: UploadStage::Processing,
    });
    invoker
        .invoke(&video.remote_file, &task.metadata, &cancel)
        .await?;

    let final_video_url = uploader.intake_public_url(&video.remote_file).await?;

    Ok(PipelineOutcome {
        final_video_url,
        final_thumbnail_url,
        remote_id: video.remote_file,
        file_size_bytes: video.file_size,
    })
}
