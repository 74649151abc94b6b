pub mod codec;
pub mod invoker;
pub mod uploader;

pub use invoker::ProcessingInvoker;
pub use uploader::{AssetUploader, ProgressFn, VideoUpload};
