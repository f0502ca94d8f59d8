//! 可观测性：日志初始化与每轮耗时统计

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，RUST_LOG 可覆盖；重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 一轮编排的耗时与计数
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnMetrics {
    pub planning_ms: u64,
    pub execution_ms: u64,
    pub verification_ms: u64,
    pub total_ms: u64,
    pub plans: u32,
    pub replans: u32,
    pub steps_executed: usize,
    pub steps_failed: usize,
    /// 本轮规划消耗的 token（模型不报告用量时为 0）
    pub planner_tokens: u64,
}

impl TurnMetrics {
    pub fn add_planning(&mut self, elapsed: Duration, tokens: u64) {
        self.planning_ms += elapsed.as_millis() as u64;
        self.plans += 1;
        self.planner_tokens += tokens;
    }

    pub fn add_execution(&mut self, elapsed: Duration, executed: usize, failed: usize) {
        self.execution_ms += elapsed.as_millis() as u64;
        self.steps_executed += executed;
        self.steps_failed += failed;
    }

    pub fn add_verification(&mut self, elapsed: Duration) {
        self.verification_ms += elapsed.as_millis() as u64;
    }

    pub fn finish(&mut self, started: Instant, replans: u32) {
        self.total_ms = started.elapsed().as_millis() as u64;
        self.replans = replans;
    }

    /// 轮次结束时输出一行汇总
    pub fn log(&self, outcome: &str) {
        tracing::info!(
            outcome,
            total_ms = self.total_ms,
            planning_ms = self.planning_ms,
            execution_ms = self.execution_ms,
            verification_ms = self.verification_ms,
            plans = self.plans,
            replans = self.replans,
            steps = self.steps_executed,
            failed_steps = self.steps_failed,
            planner_tokens = self.planner_tokens,
            "turn finished"
        );
    }
}
