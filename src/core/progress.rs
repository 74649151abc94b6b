//! 进度事件节流。
//!
//! 流水线里细碎的进度更新很多，全部广播出去 UI 根本消化不了。
//! 这里按任务收敛成一个稳定节奏，同时保证两条硬性规则：
//! 进度永不回退，0 和 1 永远放行。

use std::collections::HashMap;
use std::time::{Duration, Instant};
use super::types::TaskId;

struct LastEmit {
    value: f64,
    at: Instant,
}

/// 每任务的进度节流器
pub struct ProgressThrottle {
    min_delta: f64,
    min_interval: Duration,
    last_emitted: HashMap<TaskId, LastEmit>,
}

impl ProgressThrottle {
    pub fn new(min_delta: f64, min_interval: Duration) -> Self {
        Self {
            min_delta,
            min_interval,
            last_emitted: HashMap::new(),
        }
    }

    /// 判定这次更新是否放行，放行时记为新的基准。
    ///
    /// 低于上次放行值的更新直接压掉。不是去重，是不允许回退到达观察者。
    pub fn admit(&mut self, id: TaskId, value: f64, terminal: bool) -> bool {
        let now = Instant::now();

        let emit = match self.last_emitted.get(&id) {
            None => true,
            Some(last) => {
                if value < last.value {
                    return false;
                }

                terminal
                    || value <= 0.0
                    || value >= 1.0
                    || (value - last.value) >= self.min_delta
                    || now.duration_since(last.at) >= self.min_interval
            }
        };

        if emit {
            self.last_emitted.insert(id, LastEmit { value, at: now });
        }

        emit
    }

    /// 任务终止后清理基准
    pub fn forget(&mut self, id: &TaskId) {
        self.last_emitted.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> ProgressThrottle {
        ProgressThrottle::new(0.02, Duration::from_millis(100))
    }

    #[test]
    fn test_first_update_passes() {
        let mut t = throttle();
        assert!(t.admit(TaskId::new(), 0.0, false));
    }

    #[test]
    fn test_regression_is_suppressed() {
        let mut t = throttle();
        let id = TaskId::new();

        assert!(t.admit(id, 0.5, false));
        assert!(!t.admit(id, 0.4, false));
        // 回退不能借 terminal 放行
        assert!(!t.admit(id, 0.3, true));
        // 基准没被回退污染
        assert!(t.admit(id, 0.52, false));
    }

    #[test]
    fn test_small_delta_within_window_is_held() {
        let mut t = throttle();
        let id = TaskId::new();

        assert!(t.admit(id, 0.50, false));
        assert!(!t.admit(id, 0.505, false));
    }

    #[test]
    fn test_delta_threshold_passes() {
        let mut t = throttle();
        let id = TaskId::new();

        assert!(t.admit(id, 0.50, false));
        assert!(t.admit(id, 0.53, false));
    }

    #[test]
    fn test_extremes_always_pass() {
        let mut t = throttle();
        let id = TaskId::new();

        assert!(t.admit(id, 0.0, false));
        // 增量不足、窗口未到，但 1.0 必须放行
        assert!(t.admit(id, 1.0, false));
    }

    #[test]
    fn test_terminal_passes() {
        let mut t = throttle();
        let id = TaskId::new();

        assert!(t.admit(id, 0.90, false));
        assert!(t.admit(id, 0.905, true));
    }

    #[test]
    fn test_window_elapsed_passes() {
        let mut t = ProgressThrottle::new(0.5, Duration::from_millis(1));
        let id = TaskId::new();

        assert!(t.admit(id, 0.10, false));
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.admit(id, 0.101, false));
    }

    #[test]
    fn test_forget_resets_baseline() {
        let mut t = throttle();
        let id = TaskId::new();

        assert!(t.admit(id, 0.9, false));
        t.forget(&id);
        // 重新开始的任务可以从 0 起步
        assert!(t.admit(id, 0.0, false));
    }
}
