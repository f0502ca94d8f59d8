//! Executor：按依赖图运行计划步骤，产出 Trace
//!
//! - 依赖全部成功的步骤才会启动；依赖失败/超时的步骤直接记为 failure（attempts = 0，不调用工具）
//! - 相互独立的步骤并发运行（FuturesUnordered），由共享信号量限制并发数；Trace 顺序即完成顺序
//! - 工具 panic 被捕获并记为 failure，不会越过 Executor 边界
//! - 每次工具调用有单步超时；pure / idempotent 工具按 RetryPolicy 重试，non_idempotent 只调用一次
//! - 轮次截止或取消时，在途步骤记为 timeout，未启动的步骤没有结果，返回部分 Trace
//! - 每次工具调用输出一行 JSON 审计日志

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cognition::retry::RetryPolicy;
use crate::core::{InvariantViolation, ToolError};
use crate::knowledge::KnowledgeRetriever;
use crate::plan::{Plan, Step, StepId, StepKind, StepResult, Trace};
use crate::tools::{SideEffectClass, ToolOutput, ToolRegistry};

/// 一轮执行的预算：截止时间 + 取消令牌
#[derive(Debug, Clone)]
pub struct ExecutionBudget {
    pub deadline: Option<tokio::time::Instant>,
    pub cancel: CancellationToken,
}

impl ExecutionBudget {
    pub fn new(deadline: Option<tokio::time::Instant>, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn unbounded() -> Self {
        Self::new(None, CancellationToken::new())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_steps: usize,
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
    /// retrieve 步骤返回的片段数
    pub retrieval_top_k: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4,
            step_timeout: Duration::from_millis(10_000),
            retry: RetryPolicy::default(),
            retrieval_top_k: 4,
        }
    }
}

enum Abort {
    Deadline,
    Cancelled,
}

enum Event {
    Finished(StepResult),
    Abort(Abort),
}

enum Readiness {
    Waiting,
    Ready,
    /// 某个依赖没有成功
    Blocked(StepId),
}

pub struct Executor {
    registry: Arc<ToolRegistry>,
    retriever: Option<Arc<KnowledgeRetriever>>,
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        retriever: Option<Arc<KnowledgeRetriever>>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            retriever,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_steps.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// 执行计划；计划引用未注册工具时在任何步骤运行前返回错误
    pub async fn execute(&self, plan: &Plan, budget: &ExecutionBudget) -> Result<Trace, InvariantViolation> {
        self.check_tools(plan)?;

        let mut trace = Trace::new(plan.revision());
        let mut pending: Vec<&Step> = plan.steps().iter().collect();
        let mut running: Vec<StepId> = Vec::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, StepResult>> = FuturesUnordered::new();

        let deadline = async {
            match budget.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            self.schedule_ready(&mut pending, &mut trace, &mut in_flight, &mut running);
            if in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                biased;
                _ = budget.cancel.cancelled() => Event::Abort(Abort::Cancelled),
                _ = &mut deadline => Event::Abort(Abort::Deadline),
                Some(result) = in_flight.next() => Event::Finished(result),
            };

            match event {
                Event::Finished(result) => {
                    running.retain(|id| id != &result.step_id);
                    log_step(&result);
                    trace.record(result);
                }
                Event::Abort(abort) => {
                    let reason = match abort {
                        Abort::Deadline => {
                            trace.mark_deadline_exceeded();
                            "turn deadline exceeded"
                        }
                        Abort::Cancelled => "turn cancelled",
                    };
                    tracing::warn!(
                        revision = plan.revision(),
                        in_flight = running.len(),
                        not_started = pending.len(),
                        reason,
                        "execution aborted"
                    );
                    for id in running.drain(..) {
                        trace.record(StepResult::timeout(id, reason));
                    }
                    break;
                }
            }
        }

        Ok(trace)
    }

    fn check_tools(&self, plan: &Plan) -> Result<(), InvariantViolation> {
        for step in plan.steps().iter().filter(|s| s.kind == StepKind::ToolCall) {
            let tool = step
                .tool
                .as_deref()
                .ok_or_else(|| InvariantViolation::MissingToolName(step.id.clone()))?;
            if !self.registry.contains(tool) {
                return Err(InvariantViolation::UnregisteredTool {
                    step_id: step.id.clone(),
                    tool: tool.to_string(),
                });
            }
        }
        Ok(())
    }

    /// 启动所有依赖已满足的步骤；短路与 respond 步骤当场记录，直到没有新进展
    fn schedule_ready<'a>(
        &'a self,
        pending: &mut Vec<&'a Step>,
        trace: &mut Trace,
        in_flight: &mut FuturesUnordered<BoxFuture<'a, StepResult>>,
        running: &mut Vec<StepId>,
    ) {
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < pending.len() {
                let step = pending[i];
                match readiness(step, trace) {
                    Readiness::Waiting => {
                        i += 1;
                        continue;
                    }
                    Readiness::Blocked(dependency) => {
                        let result = StepResult::short_circuit(&step.id, &dependency);
                        log_step(&result);
                        trace.record(result);
                    }
                    Readiness::Ready if step.kind == StepKind::Respond => {
                        let result = StepResult::success(&step.id, dependency_outputs(step, trace));
                        log_step(&result);
                        trace.record(result);
                    }
                    Readiness::Ready => {
                        running.push(step.id.clone());
                        in_flight.push(self.run_step(step));
                    }
                }
                pending.remove(i);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn run_step<'a>(&'a self, step: &'a Step) -> BoxFuture<'a, StepResult> {
        async move {
            let started = Instant::now();
            let result = match step.kind {
                StepKind::Retrieve => self.run_retrieve(step).await,
                _ => self.run_tool(step).await,
            };
            result.with_duration(started.elapsed())
        }
        .boxed()
    }

    async fn run_tool(&self, step: &Step) -> StepResult {
        let Some(tool) = step.tool.as_deref() else {
            return StepResult::failure(&step.id, "tool call without a tool name");
        };
        let class = self
            .registry
            .descriptor(tool)
            .map(|d| d.side_effect)
            .unwrap_or(SideEffectClass::NonIdempotent);
        let max_attempts = self.config.retry.attempts_for(class);
        let Ok(_permit) = self.semaphore.acquire().await else {
            return StepResult::failure(&step.id, "executor is shut down");
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let call = AssertUnwindSafe(self.registry.invoke(tool, step.args.clone())).catch_unwind();
            let outcome = match tokio::time::timeout(self.config.step_timeout, call).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => Err(ToolError::Panicked {
                    tool: tool.to_string(),
                    detail: panic_message(panic.as_ref()),
                }),
                Err(_) => Err(ToolError::Timeout {
                    tool: tool.to_string(),
                    after_ms: self.config.step_timeout.as_millis() as u64,
                }),
            };
            audit(step, tool, attempt, &outcome, started.elapsed());

            match outcome {
                Ok(output) => {
                    return StepResult::success(&step.id, output.value)
                        .with_attempts(attempt)
                        .with_state_changed(output.state_changed);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!(
                        step_id = %step.id,
                        tool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying step"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e @ ToolError::Timeout { .. }) => {
                    return StepResult::timeout(&step.id, e.to_string()).with_attempts(attempt);
                }
                Err(e) => return StepResult::failure(&step.id, e.to_string()).with_attempts(attempt),
            }
        }
    }

    async fn run_retrieve(&self, step: &Step) -> StepResult {
        let query = step
            .args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let Some(retriever) = &self.retriever else {
            return StepResult::success(&step.id, serde_json::json!({ "query": query, "passages": [] }));
        };
        let Ok(_permit) = self.semaphore.acquire().await else {
            return StepResult::failure(&step.id, "executor is shut down");
        };
        match tokio::time::timeout(
            self.config.step_timeout,
            retriever.retrieve(&query, self.config.retrieval_top_k),
        )
        .await
        {
            Ok(Ok(passages)) => {
                StepResult::success(&step.id, serde_json::json!({ "query": query, "passages": passages }))
            }
            Ok(Err(e)) => StepResult::failure(&step.id, format!("retrieval failed: {e}")),
            Err(_) => StepResult::timeout(
                &step.id,
                format!("retrieval timed out after {}ms", self.config.step_timeout.as_millis()),
            ),
        }
    }
}

fn readiness(step: &Step, trace: &Trace) -> Readiness {
    for dep in &step.depends_on {
        match trace.get(dep) {
            None => return Readiness::Waiting,
            Some(r) if !r.is_success() => return Readiness::Blocked(dep.clone()),
            Some(_) => {}
        }
    }
    Readiness::Ready
}

/// respond 步骤的输出：{依赖 id: 依赖输出}
fn dependency_outputs(step: &Step, trace: &Trace) -> Value {
    let mut map = Map::new();
    for dep in &step.depends_on {
        if let Some(result) = trace.get(dep) {
            map.insert(dep.clone(), result.output.clone());
        }
    }
    Value::Object(map)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_step(result: &StepResult) {
    tracing::debug!(
        step_id = %result.step_id,
        status = ?result.status,
        attempts = result.attempts,
        duration_ms = result.duration_ms,
        short_circuited = result.short_circuited,
        "step finished"
    );
}

fn audit(step: &Step, tool: &str, attempt: u32, outcome: &Result<ToolOutput, ToolError>, elapsed: Duration) {
    let (ok, outcome_str) = match outcome {
        Ok(_) => (true, "ok"),
        Err(ToolError::Timeout { .. }) => (false, "timeout"),
        Err(ToolError::Panicked { .. }) => (false, "panic"),
        Err(_) => (false, "error"),
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "step_id": step.id,
        "tool": tool,
        "ok": ok,
        "outcome": outcome_str,
        "attempt": attempt,
        "duration_ms": elapsed.as_millis() as u64,
        "state_changed": outcome.as_ref().map(|o| o.state_changed).unwrap_or(false),
        "args_preview": args_preview(&step.args),
    });
    tracing::info!(audit = %audit, "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::plan::StepStatus;
    use crate::tools::{Tool, ToolDescriptor};

    #[derive(Clone, Default)]
    struct Counters {
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct TestTool {
        descriptor: ToolDescriptor,
        delay: Duration,
        fail: bool,
        counters: Counters,
    }

    impl TestTool {
        fn new(name: &str, class: SideEffectClass, delay_ms: u64, fail: bool, counters: &Counters) -> Self {
            Self {
                descriptor: ToolDescriptor::new(name, "test tool", class),
                delay: Duration::from_millis(delay_ms),
                fail,
                counters: counters.clone(),
            }
        }
    }

    #[async_trait]
    impl Tool for TestTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _args: Value) -> Result<ToolOutput, String> {
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(ToolOutput::new(serde_json::json!({ "tool": self.descriptor.name })))
            }
        }
    }

    fn executor(tools: Vec<TestTool>, config: ExecutorConfig) -> Executor {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        Executor::new(Arc::new(registry), None, config)
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..ExecutorConfig::default()
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan::new(Uuid::new_v4(), 0, "test", steps).unwrap()
    }

    #[tokio::test]
    async fn test_independent_steps_run_concurrently() {
        let counters = Counters::default();
        let exec = executor(
            vec![
                TestTool::new("slow_a", SideEffectClass::Pure, 100, false, &counters),
                TestTool::new("slow_b", SideEffectClass::Pure, 100, false, &counters),
            ],
            fast_config(),
        );
        let plan = plan(vec![
            Step::tool_call("a", "slow_a", serde_json::json!({})),
            Step::tool_call("b", "slow_b", serde_json::json!({})),
            Step::respond("r").after(["a", "b"]),
        ]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(counters.peak.load(Ordering::SeqCst), 2);
        let respond = trace.get("r").unwrap();
        assert_eq!(respond.output["a"]["tool"], "slow_a");
        assert_eq!(respond.output["b"]["tool"], "slow_b");
        assert_eq!(trace.results().last().unwrap().step_id, "r");
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_semaphore() {
        let counters = Counters::default();
        let exec = executor(
            vec![
                TestTool::new("t1", SideEffectClass::Pure, 30, false, &counters),
                TestTool::new("t2", SideEffectClass::Pure, 30, false, &counters),
                TestTool::new("t3", SideEffectClass::Pure, 30, false, &counters),
            ],
            ExecutorConfig {
                max_concurrent_steps: 1,
                ..fast_config()
            },
        );
        let plan = plan(vec![
            Step::tool_call("a", "t1", serde_json::json!({})),
            Step::tool_call("b", "t2", serde_json::json!({})),
            Step::tool_call("c", "t3", serde_json::json!({})),
        ]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_short_circuits() {
        let counters = Counters::default();
        let exec = executor(
            vec![
                TestTool::new("broken", SideEffectClass::NonIdempotent, 0, true, &counters),
                TestTool::new("after", SideEffectClass::Pure, 0, false, &Counters::default()),
            ],
            fast_config(),
        );
        let plan = plan(vec![
            Step::tool_call("a", "broken", serde_json::json!({})),
            Step::tool_call("b", "after", serde_json::json!({})).after(["a"]),
            Step::respond("r").after(["b"]),
        ]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        assert_eq!(trace.len(), 3);
        let a = trace.get("a").unwrap();
        assert_eq!(a.status, StepStatus::Failure);
        assert_eq!(a.attempts, 1);
        for id in ["b", "r"] {
            let r = trace.get(id).unwrap();
            assert_eq!(r.status, StepStatus::Failure);
            assert_eq!(r.attempts, 0);
            assert!(r.short_circuited);
        }
        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_tool_retried() {
        let counters = Counters::default();
        let exec = executor(
            vec![TestTool::new("flaky", SideEffectClass::Idempotent, 0, true, &counters)],
            fast_config(),
        );
        let plan = plan(vec![Step::tool_call("a", "flaky", serde_json::json!({}))]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        assert_eq!(trace.get("a").unwrap().attempts, 3);
        assert_eq!(counters.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let exec = executor(
            vec![TestTool::new("sleepy", SideEffectClass::NonIdempotent, 500, false, &Counters::default())],
            ExecutorConfig {
                step_timeout: Duration::from_millis(20),
                ..fast_config()
            },
        );
        let plan = plan(vec![Step::tool_call("a", "sleepy", serde_json::json!({}))]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        let a = trace.get("a").unwrap();
        assert_eq!(a.status, StepStatus::Timeout);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test]
    async fn test_deadline_marks_in_flight_as_timeout() {
        let exec = executor(
            vec![TestTool::new("sleepy", SideEffectClass::Pure, 5_000, false, &Counters::default())],
            fast_config(),
        );
        let plan = plan(vec![
            Step::tool_call("a", "sleepy", serde_json::json!({})),
            Step::respond("r").after(["a"]),
        ]);
        let budget = ExecutionBudget::new(
            Some(tokio::time::Instant::now() + Duration::from_millis(50)),
            CancellationToken::new(),
        );
        let trace = exec.execute(&plan, &budget).await.unwrap();
        assert!(trace.deadline_exceeded());
        assert_eq!(trace.get("a").unwrap().status, StepStatus::Timeout);
        assert!(trace.get("r").is_none());
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight() {
        let exec = executor(
            vec![TestTool::new("sleepy", SideEffectClass::Pure, 5_000, false, &Counters::default())],
            fast_config(),
        );
        let plan = plan(vec![Step::tool_call("a", "sleepy", serde_json::json!({}))]);
        let budget = ExecutionBudget::unbounded();
        let token = budget.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let trace = exec.execute(&plan, &budget).await.unwrap();
        assert_eq!(trace.get("a").unwrap().status, StepStatus::Timeout);
        assert!(!trace.deadline_exceeded());
    }

    #[tokio::test]
    async fn test_unregistered_tool_rejected_before_running() {
        let counters = Counters::default();
        let exec = executor(
            vec![TestTool::new("known", SideEffectClass::Pure, 0, false, &counters)],
            fast_config(),
        );
        let plan = plan(vec![
            Step::tool_call("a", "known", serde_json::json!({})),
            Step::tool_call("b", "send_email", serde_json::json!({})),
        ]);
        let err = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::UnregisteredTool {
                step_id: "b".into(),
                tool: "send_email".into()
            }
        );
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retrieve_without_index_is_empty_success() {
        let exec = executor(vec![], fast_config());
        let plan = plan(vec![Step::retrieve("k", "rust ownership"), Step::respond("r").after(["k"])]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        let k = trace.get("k").unwrap();
        assert!(k.is_success());
        assert_eq!(k.output["passages"], serde_json::json!([]));
    }

    struct PanickingTool {
        descriptor: ToolDescriptor,
    }

    #[async_trait]
    impl Tool for PanickingTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _args: Value) -> Result<ToolOutput, String> {
            panic!("index out of range")
        }
    }

    #[tokio::test]
    async fn test_tool_panic_becomes_failure() {
        let mut registry = ToolRegistry::new();
        registry
            .register(PanickingTool {
                descriptor: ToolDescriptor::new("explode", "panics", SideEffectClass::Idempotent),
            })
            .unwrap();
        let exec = Executor::new(Arc::new(registry), None, fast_config());
        let plan = plan(vec![
            Step::tool_call("a", "explode", serde_json::json!({})),
            Step::respond("r").after(["a"]),
        ]);
        let trace = exec.execute(&plan, &ExecutionBudget::unbounded()).await.unwrap();
        let a = trace.get("a").unwrap();
        assert_eq!(a.status, StepStatus::Failure);
        assert_eq!(a.attempts, 1);
        assert!(a.error.as_deref().unwrap().contains("index out of range"));
        assert!(trace.get("r").unwrap().short_circuited);
    }

    #[test]
    fn test_args_preview_truncates() {
        let args = serde_json::json!({ "text": "x".repeat(500) });
        assert!(args_preview(&args).ends_with("..."));
        assert_eq!(args_preview(&serde_json::json!({})), "{}");
    }
}
