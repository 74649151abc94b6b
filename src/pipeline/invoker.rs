//! 远端处理调用封装

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use crate::core::errors::{Result, UploadError};
use crate::core::traits::RemoteProcessor;
use crate::core::types::ClipMetadata;

/// 把原始上传交给服务端处理的单次调用。
/// 除取消之外的一切失败统一为 Transport，这一阶段是可重试的。
#[derive(Clone)]
pub struct ProcessingInvoker {
    processor: Arc<dyn RemoteProcessor>,
}

impl ProcessingInvoker {
    pub fn new(processor: Arc<dyn RemoteProcessor>) -> Self {
        Self { processor }
    }

    pub async fn invoke(
        &self,
        remote_file: &str,
        metadata: &ClipMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(remote_file, metadata_id = %metadata.id, "invoking remote processing");

        let result = tokio::select! {
            result = self.processor.process(remote_file, metadata) => result,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        };

        result.map_err(|err| match err {
            UploadError::Cancelled => UploadError::Cancelled,
            UploadError::Transport(_) => err,
            other => UploadError::Transport(other.to_string()),
        })
    }
}
