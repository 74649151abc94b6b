pub mod retry;

pub use retry::BackoffStrategy;
