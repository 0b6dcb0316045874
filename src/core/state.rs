//! 运行阶段状态机
//!
//! Idle -> Starting -> Running(n) -> Terminating -> Closed；Failed 为可从 Starting / Running 到达的吸收态。

use serde::Serialize;

/// 编排器所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "step", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Starting,
    /// 当前第几步（从 1 开始）
    Running(usize),
    Terminating,
    Closed,
    Failed,
}

impl RunPhase {
    /// 是否允许从当前阶段迁移到 next
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Running(1)) => true,
            (Starting, Failed) => true,
            (Running(n), Running(m)) => m == n + 1,
            (Running(_), Terminating) => true,
            (Running(_), Failed) => true,
            (Terminating, Closed) => true,
            _ => false,
        }
    }

    /// Closed / Failed 为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Closed | RunPhase::Failed)
    }
}

impl Default for RunPhase {
    fn default() -> Self {
        RunPhase::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            RunPhase::Idle,
            RunPhase::Starting,
            RunPhase::Running(1),
            RunPhase::Running(2),
            RunPhase::Terminating,
            RunPhase::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_only_from_starting_or_running() {
        assert!(RunPhase::Starting.can_transition_to(RunPhase::Failed));
        assert!(RunPhase::Running(4).can_transition_to(RunPhase::Failed));
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Failed));
        assert!(!RunPhase::Terminating.can_transition_to(RunPhase::Failed));
        assert!(!RunPhase::Failed.can_transition_to(RunPhase::Closed));
    }

    #[test]
    fn test_running_cannot_skip_steps() {
        assert!(!RunPhase::Running(1).can_transition_to(RunPhase::Running(3)));
        assert!(!RunPhase::Starting.can_transition_to(RunPhase::Running(2)));
    }
}
