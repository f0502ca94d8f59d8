//! 编排状态机
//!
//! Idle -> Planning -> Executing -> Verifying -> {Responding | Replanning} -> Idle，
//! 任意工作阶段可进入 Failed，Failed 只能回到 Idle。

use serde::Serialize;

/// Brain 所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BrainPhase {
    Idle,
    Planning,
    Executing,
    Verifying,
    Replanning,
    Responding,
    Failed,
}

impl BrainPhase {
    pub fn can_transition_to(self, next: BrainPhase) -> bool {
        use BrainPhase::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Verifying)
                | (Executing, Failed)
                | (Verifying, Responding)
                | (Verifying, Replanning)
                | (Verifying, Failed)
                | (Replanning, Planning)
                | (Replanning, Failed)
                | (Responding, Idle)
                | (Failed, Idle)
        )
    }
}

/// 单轮内的状态：当前阶段、重规划次数、经过的阶段
#[derive(Clone, Debug)]
pub struct TurnState {
    phase: BrainPhase,
    replans: u32,
    history: Vec<BrainPhase>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            phase: BrainPhase::Idle,
            replans: 0,
            history: vec![BrainPhase::Idle],
        }
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> BrainPhase {
        self.phase
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }

    pub fn history(&self) -> &[BrainPhase] {
        &self.history
    }

    /// 切换阶段；非法转移返回 false 且不改变状态
    pub fn transition(&mut self, next: BrainPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        if next == BrainPhase::Replanning {
            self.replans += 1;
        }
        self.phase = next;
        self.history.push(next);
        true
    }
}
