//! owner -> 队列的显式注册表。
//!
//! 由调用方构建、持有、拆除，不搞进程级单例。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::config::QueueConfig;
use crate::core::errors::{Result, UploadError};
use crate::core::manager::UploadQueue;
use crate::core::traits::Collaborators;
use crate::core::types::OwnerId;

pub struct QueueRegistry {
    collaborators: Collaborators,
    config: QueueConfig,
    queues: Mutex<HashMap<OwnerId, Arc<UploadQueue>>>,
}

impl QueueRegistry {
    pub fn new(collaborators: Collaborators, config: QueueConfig) -> Self {
        Self {
            collaborators,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// 取得 owner 的队列，没有就建一个
    pub async fn obtain(&self, owner: &OwnerId) -> Arc<UploadQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(owner.clone())
            .or_insert_with(|| {
                Arc::new(UploadQueue::new(
                    owner.clone(),
                    self.collaborators.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub async fn get(&self, owner: &OwnerId) -> Option<Arc<UploadQueue>> {
        self.queues.lock().await.get(owner).cloned()
    }

    pub async fn owners(&self) -> Vec<OwnerId> {
        self.queues.lock().await.keys().cloned().collect()
    }

    /// 拆除 owner 的队列。
    /// 还有上传在跑时拒绝，这是对调用方的防护栏，不是静默跳过。
    pub async fn teardown(&self, owner: &OwnerId) -> Result<()> {
        let mut queues = self.queues.lock().await;

        let Some(queue) = queues.get(owner) else {
            return Ok(());
        };

        let active = queue.active_count().await?;
        if active > 0 {
            return Err(UploadError::ActiveUploads { count: active });
        }

        if let Some(queue) = queues.remove(owner) {
            queue.shutdown().await?;
        }

        Ok(())
    }
}
