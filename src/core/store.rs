use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use super::errors::{Result, UploadError};
use super::traits::StateStore;
use super::types::{OwnerId, QueueStats, TaskId, TaskStatus, UploadTask};

const QUEUE_KEY_PREFIX: &str = "backhaul:queue:v1:";
const HISTORY_KEY_PREFIX: &str = "backhaul:history:v1:";

/// 任务的唯一持有者。
///
/// 调度器只在驱动任务时拿临时引用，所有落盘、查询、增删都走这里，
/// 并且严格按 owner 隔离：持久化记录里混进别人的任务一律丢弃。
pub struct QueueStore {
    owner: OwnerId,
    tasks: HashMap<TaskId, UploadTask>,
    state: Arc<dyn StateStore>,
    capacity: usize,
    history_limit: usize,
}

impl QueueStore {
    pub fn new(
        owner: OwnerId,
        state: Arc<dyn StateStore>,
        capacity: usize,
        history_limit: usize,
    ) -> Self {
        Self {
            owner,
            tasks: HashMap::new(),
            state,
            capacity,
            history_limit,
        }
    }

    fn queue_key(&self) -> String {
        format!("{QUEUE_KEY_PREFIX}{}", self.owner)
    }

    fn history_key(&self) -> String {
        format!("{HISTORY_KEY_PREFIX}{}", self.owner)
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.capacity
    }

    pub fn get(&self, id: &TaskId) -> Option<&UploadTask> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut UploadTask> {
        self.tasks.get_mut(id)
    }

    /// 入队。超出容量直接报错，什么都不写。
    pub fn insert(&mut self, task: UploadTask) -> Result<()> {
        if task.owner_id != self.owner {
            return Err(UploadError::OwnerMismatch {
                expected: self.owner.to_string(),
                actual: task.owner_id.to_string(),
            });
        }

        if self.is_full() {
            return Err(UploadError::QueueFull {
                capacity: self.capacity,
            });
        }

        self.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<UploadTask> {
        self.tasks.remove(id)
    }

    /// 按状态过滤，创建时间排序
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self
            .tasks
            .values()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// 最老的待上传任务
    pub fn next_pending(&self) -> Option<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .min_by_key(|task| task.created_at)
            .map(|task| task.id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks
            .values()
            .filter(|task| task.status == status)
            .count()
    }

    pub fn stats(&self) -> QueueStats {
        let completed = self.count(TaskStatus::Completed);
        let failed = self.count(TaskStatus::Failed);
        let finished = completed + failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        };

        QueueStats {
            total: self.tasks.len(),
            pending: self.count(TaskStatus::Pending),
            uploading: self.count(TaskStatus::Uploading),
            completed,
            failed,
            success_rate,
        }
    }

    /// 全量快照落盘。任务数有容量上限，写放大换崩溃安全是划算的。
    pub async fn persist(&self) -> Result<()> {
        let tasks = self.list(None);
        let data = serde_json::to_string(&tasks)?;
        self.state.set(&self.queue_key(), &data).await
    }

    /// 进程启动时恢复。
    /// 上传中的任务不可能活过重启，一律重置为待上传从头再来。
    pub async fn reload(&mut self) -> Result<()> {
        let Some(data) = self.state.get(&self.queue_key()).await? else {
            return Ok(());
        };

        let tasks: Vec<UploadTask> = serde_json::from_str(&data)?;
        self.tasks.clear();

        for mut task in tasks {
            if task.owner_id != self.owner {
                // 用户切换之类的场景会留下别人的记录，丢弃而不是合并
                warn!(
                    task_id = %task.id,
                    task_owner = %task.owner_id,
                    queue_owner = %self.owner,
                    "dropping persisted task from another owner"
                );
                continue;
            }

            if task.status == TaskStatus::Uploading {
                task.status = TaskStatus::Pending;
                task.progress = 0.0;
                task.started_at = None;
            }

            self.tasks.insert(task.id, task);
        }

        Ok(())
    }

    /// 读出有界的完成历史
    pub async fn load_history(&self) -> Result<Vec<UploadTask>> {
        match self.state.get(&self.history_key()).await? {
            Some(data) => {
                let tasks: Vec<UploadTask> = serde_json::from_str(&data)?;
                Ok(tasks
                    .into_iter()
                    .filter(|task| task.owner_id == self.owner)
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// 把当前的已完成任务追加进历史，只保留最近 history_limit 条
    pub async fn archive_completed(&self) -> Result<()> {
        let completed = self.list(Some(TaskStatus::Completed));
        if completed.is_empty() {
            return Ok(());
        }

        let mut history = self.load_history().await?;
        history.extend(completed);
        if history.len() > self.history_limit {
            let overflow = history.len() - self.history_limit;
            history.drain(..overflow);
        }

        let data = serde_json::to_string(&history)?;
        self.state.set(&self.history_key(), &data).await
    }

    /// 归档后把已完成任务移出活动队列
    pub async fn clear_completed(&mut self) -> Result<()> {
        self.archive_completed().await?;
        self.tasks
            .retain(|_, task| task.status != TaskStatus::Completed);
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryStateStore;
    use crate::core::types::{ClipMetadata, EnqueueOptions, EnqueueRequest};

    fn request(video: &str) -> EnqueueRequest {
        EnqueueRequest {
            video_path: video.to_string(),
            thumbnail_path: None,
            metadata: ClipMetadata::new("clip-1"),
            options: EnqueueOptions::default(),
        }
    }

    fn task_for(owner: &OwnerId, video: &str) -> UploadTask {
        UploadTask::new(owner.clone(), request(video), 3)
    }

    fn store_for(owner: &OwnerId, state: Arc<dyn StateStore>) -> QueueStore {
        QueueStore::new(owner.clone(), state, 3, 5)
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let owner = OwnerId::new("user-a");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut store = store_for(&owner, state);

        for i in 0..3 {
            store.insert(task_for(&owner, &format!("v{i}.mp4"))).unwrap();
        }

        let result = store.insert(task_for(&owner, "v3.mp4"));
        assert!(matches!(result, Err(UploadError::QueueFull { capacity: 3 })));
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_insert_rejects_foreign_owner() {
        let owner = OwnerId::new("user-a");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut store = store_for(&owner, state);

        let foreign = task_for(&OwnerId::new("user-b"), "v.mp4");
        assert!(matches!(
            store.insert(foreign),
            Err(UploadError::OwnerMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_resets_uploading_tasks() {
        let owner = OwnerId::new("user-a");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut store = store_for(&owner, state.clone());

        let mut task = task_for(&owner, "v.mp4");
        let id = task.id;
        task.status = TaskStatus::Uploading;
        task.progress = 0.63;
        task.started_at = Some(chrono::Utc::now());
        store.insert(task).unwrap();
        store.persist().await.unwrap();

        // 模拟进程重启
        let mut fresh = store_for(&owner, state);
        fresh.reload().await.unwrap();

        let restored = fresh.get(&id).unwrap();
        assert_eq!(restored.status, TaskStatus::Pending);
        assert_eq!(restored.progress, 0.0);
        assert!(restored.started_at.is_none());
    }

    #[tokio::test]
    async fn test_reload_drops_cross_owner_records() {
        let owner_a = OwnerId::new("user-a");
        let owner_b = OwnerId::new("user-b");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        // 把 b 的任务硬塞进 a 的持久化记录
        let tasks = vec![task_for(&owner_a, "a.mp4"), task_for(&owner_b, "b.mp4")];
        let data = serde_json::to_string(&tasks).unwrap();
        state
            .set(&format!("{QUEUE_KEY_PREFIX}{owner_a}"), &data)
            .await
            .unwrap();

        let mut store = store_for(&owner_a, state);
        store.reload().await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.list(None).iter().all(|t| t.owner_id == owner_a));
    }

    #[tokio::test]
    async fn test_next_pending_is_oldest_first() {
        let owner = OwnerId::new("user-a");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut store = store_for(&owner, state);

        let mut first = task_for(&owner, "first.mp4");
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        let first_id = first.id;
        let second = task_for(&owner, "second.mp4");

        store.insert(second).unwrap();
        store.insert(first).unwrap();

        assert_eq!(store.next_pending(), Some(first_id));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let owner = OwnerId::new("user-a");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        // 容量要够放测试任务
        let mut store = QueueStore::new(owner.clone(), state, 16, 5);

        for round in 0..4 {
            for i in 0..2 {
                let mut task = task_for(&owner, &format!("r{round}-v{i}.mp4"));
                task.status = TaskStatus::Completed;
                store.insert(task).unwrap();
            }
            store.clear_completed().await.unwrap();
        }

        let history = store.load_history().await.unwrap();
        assert_eq!(history.len(), 5);
        assert!(store.list(Some(TaskStatus::Completed)).is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let owner = OwnerId::new("user-a");
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let mut store = QueueStore::new(owner.clone(), state, 16, 5);

        let mut completed = task_for(&owner, "done.mp4");
        completed.status = TaskStatus::Completed;
        let mut failed = task_for(&owner, "bad.mp4");
        failed.status = TaskStatus::Failed;
        store.insert(completed).unwrap();
        store.insert(failed).unwrap();
        store.insert(task_for(&owner, "waiting.mp4")).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_progress_never_regresses() {
        let owner = OwnerId::new("user-a");
        let mut task = task_for(&owner, "v.mp4");

        assert!(task.apply_progress(0.4));
        assert!(!task.apply_progress(0.2));
        assert_eq!(task.progress, 0.4);
        assert!(task.apply_progress(0.9));
        // 超界值被钳到 [0, 1]
        assert!(task.apply_progress(1.7));
        assert_eq!(task.progress, 1.0);
    }
}
