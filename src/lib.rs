//! backhaul: 用户态的后台上传流水线。
//!
//! 本地拍好的视频/缩略图对加上结构化元数据，上传到对象存储并触发
//! 远端处理。每个用户一条持久化任务队列：并发有上限、失败指数退避
//! 自动重试、崩溃后从快照恢复、进度事件节流后广播。
//!
//! 外部世界（对象存储、处理函数、KV 持久化、本地文件）全部走
//! [`core::traits`] 里的接口，`backends` 提供默认实现。

pub mod backends;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod utils;

// 重新导出核心类型
pub use config::QueueConfig;
pub use core::{
    ClipMetadata,
    Collaborators,
    EnqueueOptions,
    FileStat,
    MediaSource,
    ObjectStorage,
    OwnerId,
    QueueEvent,
    QueueRegistry,
    QueueStats,
    RemoteProcessor,
    Result,
    StateStore,
    TaskId,
    TaskStatus,
    UploadError,
    UploadQueue,
    UploadStage,
    UploadTask,
};
