//! Brain：Planner -> Executor -> Verifier 的有界编排循环
//!
//! 每轮：读取记忆快照并检索一次知识 -> 规划 -> 执行 -> 合成回复 -> 校验；
//! 拒绝时带提示重规划（最多 max_replans 次），通过时写入记忆并返回回复。
//! 截止时间覆盖整轮；终止失败连同 Goal / Plan / Trace / Verdict 一起记录日志。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

use crate::cognition::{
    BrainEvent, ExecutionBudget, Executor, ExecutorConfig, PlanRequest, Planner, ReplanHint,
    RetryPolicy, Synthesizer, Verdict, Verifier,
};
use crate::core::error::OrchestratorFailure;
use crate::core::session::Session;
use crate::core::state::{BrainPhase, TurnState};
use crate::knowledge::{IngestReport, KnowledgeRetriever, Passage, RetrievalError};
use crate::memory::{
    remembered_fact, MemoryError, MemoryRecord, MemoryScope, MemorySnapshot, MemoryStore,
    FACT_PREFIX,
};
use crate::observability::TurnMetrics;
use crate::plan::{Goal, Plan, Trace};
use crate::tools::ToolRegistry;

/// 编排参数
#[derive(Debug, Clone)]
pub struct BrainConfig {
    /// 每轮最多重规划次数
    pub max_replans: u32,
    pub step_timeout_ms: u64,
    pub max_concurrent_steps: usize,
    pub retrieval_top_k: usize,
    /// 整轮截止时间
    pub turn_deadline_ms: u64,
    pub max_step_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_context_turns: usize,
    /// 快照中最多带多少条长期事实
    pub max_facts: usize,
    /// 短期记录存活时间；None 表示只在会话结束时清理
    pub short_term_ttl_secs: Option<u64>,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            max_replans: 2,
            step_timeout_ms: 10_000,
            max_concurrent_steps: 4,
            retrieval_top_k: 4,
            turn_deadline_ms: 60_000,
            max_step_retries: 2,
            retry_backoff_ms: 200,
            max_context_turns: 10,
            max_facts: 20,
            short_term_ttl_secs: None,
        }
    }
}

impl BrainConfig {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_steps: self.max_concurrent_steps,
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            retry: RetryPolicy::new(self.max_step_retries, Duration::from_millis(self.retry_backoff_ms)),
            retrieval_top_k: self.retrieval_top_k,
        }
    }
}

/// 一轮成功的结果
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub goal_id: Uuid,
    /// 被接受的计划修订号
    pub revision: u32,
    pub replans: u32,
    pub metrics: TurnMetrics,
}

/// 一次校验的完整记录（用于持久化与失败日志）
struct Attempt {
    plan: Plan,
    trace: Trace,
    /// 取消时没有结论
    verdict: Option<Verdict>,
}

pub struct Brain {
    config: BrainConfig,
    registry: Arc<ToolRegistry>,
    memory: Arc<dyn MemoryStore>,
    retriever: Arc<KnowledgeRetriever>,
    planner: Planner,
    executor: Executor,
    verifier: Verifier,
    synthesizer: Synthesizer,
    events: broadcast::Sender<BrainEvent>,
}

impl Brain {
    pub(crate) fn new(
        config: BrainConfig,
        registry: Arc<ToolRegistry>,
        memory: Arc<dyn MemoryStore>,
        retriever: Arc<KnowledgeRetriever>,
        planner: Planner,
        verifier: Verifier,
        synthesizer: Synthesizer,
    ) -> Self {
        let executor = Executor::new(registry.clone(), Some(retriever.clone()), config.executor_config());
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            registry,
            memory,
            retriever,
            planner,
            executor,
            verifier,
            synthesizer,
            events,
        }
    }

    pub fn config(&self) -> &BrainConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn memory(&self) -> Arc<dyn MemoryStore> {
        self.memory.clone()
    }

    /// 订阅编排事件
    pub fn subscribe(&self) -> broadcast::Receiver<BrainEvent> {
        self.events.subscribe()
    }

    /// 新会话（对话窗口长度取自配置）
    pub fn new_session(&self) -> Session {
        Session::new(self.config.max_context_turns)
    }

    /// 处理一轮用户输入
    pub async fn handle_turn(
        &self,
        session: &mut Session,
        utterance: &str,
    ) -> Result<TurnReply, OrchestratorFailure> {
        let context = session.next_turn();
        let goal = Goal::new(utterance.trim(), context);
        let span = tracing::info_span!(
            "turn",
            session = %session.id(),
            turn = goal.context().turn,
            goal_id = %goal.id()
        );
        self.run_turn(session, goal).instrument(span).await
    }

    async fn run_turn(&self, session: &mut Session, goal: Goal) -> Result<TurnReply, OrchestratorFailure> {
        let started = Instant::now();
        let mut metrics = TurnMetrics::default();
        let mut state = TurnState::new();
        let turn = goal.context().turn;
        let budget = ExecutionBudget::new(
            Some(tokio::time::Instant::now() + Duration::from_millis(self.config.turn_deadline_ms)),
            session.cancel_token(),
        );
        tracing::info!(utterance = %goal.utterance(), "turn started");

        self.expire_short_term();
        let snapshot = MemorySnapshot::capture(
            self.memory.as_ref(),
            session.conversation().messages(),
            &session.short_term_prefix(),
            self.config.max_facts,
        )
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "memory snapshot failed, continuing without context");
            MemorySnapshot::default()
        });

        self.enter(&mut state, BrainPhase::Planning, turn);
        let knowledge = match self.within_budget(&budget, self.retrieve_knowledge(goal.utterance())).await {
            Ok(passages) => passages,
            Err(failure) => return Err(self.fail(&mut state, &goal, None, failure, metrics, started)),
        };

        let catalog = self.registry.catalog();
        let mut previous: Option<Attempt> = None;
        let mut hint: Option<ReplanHint> = None;

        loop {
            let plan_started = Instant::now();
            let (_, _, tokens_before) = self.planner.token_usage();
            let planned = self
                .within_budget(
                    &budget,
                    self.planner.plan(PlanRequest {
                        goal: &goal,
                        context: &snapshot,
                        knowledge: &knowledge,
                        catalog: &catalog,
                        hint: hint.as_ref(),
                        previous: previous.as_ref().map(|a| &a.plan),
                    }),
                )
                .await;
            let (_, _, tokens_after) = self.planner.token_usage();
            metrics.add_planning(plan_started.elapsed(), tokens_after.saturating_sub(tokens_before));
            let plan = match planned {
                Ok(Ok(plan)) => plan,
                Ok(Err(e)) => {
                    return Err(self.fail(&mut state, &goal, previous.as_ref(), e.into(), metrics, started))
                }
                Err(failure) => {
                    return Err(self.fail(&mut state, &goal, previous.as_ref(), failure, metrics, started))
                }
            };
            self.emit(BrainEvent::PlanReady {
                revision: plan.revision(),
                rationale: plan.rationale().to_string(),
                steps: plan.steps().iter().map(|s| format!("{}:{}", s.id, s.label())).collect(),
            });

            self.enter(&mut state, BrainPhase::Executing, turn);
            let exec_started = Instant::now();
            let mut trace = match self.executor.execute(&plan, &budget).await {
                Ok(trace) => trace,
                Err(e) => return Err(self.fail(&mut state, &goal, previous.as_ref(), e.into(), metrics, started)),
            };
            let failed = trace.results().iter().filter(|r| !r.is_success()).count();
            metrics.add_execution(exec_started.elapsed(), trace.len(), failed);
            for result in trace.results() {
                self.emit(BrainEvent::StepFinished {
                    step_id: result.step_id.clone(),
                    status: result.status,
                    attempts: result.attempts,
                    duration_ms: result.duration_ms,
                });
            }
            if budget.cancel.is_cancelled() {
                let attempt = Attempt {
                    plan,
                    trace,
                    verdict: None,
                };
                return Err(self.fail(&mut state, &goal, Some(&attempt), OrchestratorFailure::Cancelled, metrics, started));
            }

            let respond_ok = plan
                .respond_step()
                .and_then(|r| trace.get(&r.id))
                .map(|r| r.is_success())
                .unwrap_or(false);
            if respond_ok {
                let text = self.synthesizer.synthesize(&goal, &plan, &trace).await;
                trace.attach_response(text);
            }

            self.enter(&mut state, BrainPhase::Verifying, turn);
            let verify_started = Instant::now();
            let verdict = self.verifier.verify(&goal, &plan, &trace).await;
            metrics.add_verification(verify_started.elapsed());

            match verdict {
                Verdict::Accept => {
                    self.emit(BrainEvent::Accepted {
                        revision: plan.revision(),
                    });
                    self.enter(&mut state, BrainPhase::Responding, turn);
                    let text = trace.response().unwrap_or_default().to_string();
                    let attempt = Attempt {
                        plan,
                        trace,
                        verdict: Some(Verdict::Accept),
                    };
                    self.persist(session, &goal, &attempt, &text).await;
                    session.record_exchange(goal.utterance(), &text);
                    self.emit(BrainEvent::Response { text: text.clone() });
                    self.enter(&mut state, BrainPhase::Idle, turn);

                    metrics.finish(started, state.replans());
                    metrics.log("accepted");
                    return Ok(TurnReply {
                        text,
                        goal_id: goal.id(),
                        revision: attempt.plan.revision(),
                        replans: state.replans(),
                        metrics,
                    });
                }
                Verdict::Reject { kind, reason, hint: next_hint } => {
                    tracing::warn!(revision = plan.revision(), ?kind, reason = %reason, "plan rejected");
                    self.emit(BrainEvent::Rejected {
                        revision: plan.revision(),
                        kind,
                        reason: reason.clone(),
                    });
                    let timed_out = trace.deadline_exceeded();
                    let attempt = Attempt {
                        plan,
                        trace,
                        verdict: Some(Verdict::Reject {
                            kind,
                            reason: reason.clone(),
                            hint: next_hint.clone(),
                        }),
                    };
                    if timed_out {
                        let failure = OrchestratorFailure::TurnTimeout {
                            budget_ms: self.config.turn_deadline_ms,
                        };
                        return Err(self.fail(&mut state, &goal, Some(&attempt), failure, metrics, started));
                    }
                    if state.replans() >= self.config.max_replans {
                        let failure = OrchestratorFailure::ReplanLimitExceeded {
                            replans: state.replans(),
                            reason,
                        };
                        return Err(self.fail(&mut state, &goal, Some(&attempt), failure, metrics, started));
                    }
                    self.enter(&mut state, BrainPhase::Replanning, turn);
                    self.emit(BrainEvent::Replanning {
                        replans: state.replans(),
                        max_replans: self.config.max_replans,
                    });
                    self.enter(&mut state, BrainPhase::Planning, turn);
                    hint = next_hint;
                    previous = Some(attempt);
                }
            }
        }
    }

    /// 结束会话：取消在途步骤并清理其短期记录
    pub fn end_session(&self, session: &Session) -> Result<usize, MemoryError> {
        session.cancel();
        let removed = self
            .memory
            .remove_prefix(MemoryScope::ShortTerm, &session.short_term_prefix())?;
        tracing::info!(session = %session.id(), removed, "session ended");
        Ok(removed)
    }

    pub async fn ingest_document(&self, doc_id: &str, text: &str) -> Result<usize, RetrievalError> {
        self.retriever.ingest_document(doc_id, text).await
    }

    pub async fn ingest_dir(&self, root: &std::path::Path, pattern: &str) -> Result<IngestReport, RetrievalError> {
        self.retriever.ingest_dir(root, pattern).await
    }

    fn enter(&self, state: &mut TurnState, next: BrainPhase, turn: u64) {
        let from = state.phase();
        if state.transition(next) {
            self.emit(BrainEvent::PhaseChanged { turn, phase: next });
        } else {
            tracing::error!(?from, to = ?next, "illegal phase transition ignored");
        }
    }

    fn emit(&self, event: BrainEvent) {
        // 无订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    /// 在整轮截止时间与取消令牌下运行
    async fn within_budget<F: Future>(
        &self,
        budget: &ExecutionBudget,
        fut: F,
    ) -> Result<F::Output, OrchestratorFailure> {
        let deadline = async {
            match budget.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = budget.cancel.cancelled() => Err(OrchestratorFailure::Cancelled),
            _ = deadline => Err(OrchestratorFailure::TurnTimeout {
                budget_ms: self.config.turn_deadline_ms,
            }),
            out = fut => Ok(out),
        }
    }

    /// 检索失败降级为无知识
    async fn retrieve_knowledge(&self, query: &str) -> Vec<Passage> {
        match self.retriever.retrieve(query, self.config.retrieval_top_k).await {
            Ok(passages) => {
                tracing::debug!(passages = passages.len(), "knowledge for planning");
                passages
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, planning without knowledge");
                Vec::new()
            }
        }
    }

    fn expire_short_term(&self) {
        let Some(ttl) = self.config.short_term_ttl_secs else {
            return;
        };
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl as i64);
        match self.memory.expire_short_term(cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(expired = n, "short-term records expired"),
            Err(e) => tracing::warn!(error = %e, "short-term expiry failed"),
        }
    }

    /// 写入：长期执行记录 + 会话短期记录 + 向量摘要（+ 事实），一次原子 upsert
    async fn persist(&self, session: &Session, goal: &Goal, attempt: &Attempt, answer: &str) {
        let turn = goal.context().turn;
        let mut records = vec![
            MemoryRecord::long_term(
                format!("turn/{}/{:06}", session.id(), turn),
                json!({
                    "goal": goal,
                    "plan": attempt.plan,
                    "trace": attempt.trace,
                    "verdict": attempt.verdict,
                    "answer": answer,
                }),
            ),
            MemoryRecord::short_term(
                format!("{}{:06}", session.short_term_prefix(), turn),
                json!({ "user": goal.utterance(), "assistant": answer }),
            ),
        ];

        if let Some(fact) = remembered_fact(goal.utterance()) {
            records.push(MemoryRecord::long_term(
                format!("{}{}", FACT_PREFIX, goal.id()),
                json!({ "text": fact, "session": session.id() }),
            ));
        }

        let summary = format!("User: {}\nJarvis: {}", goal.utterance(), answer);
        match self.retriever.embed(&summary).await {
            Ok(embedding) => records.push(MemoryRecord::vector(
                format!("episode/{}", goal.id()),
                json!({ "text": summary, "source": format!("episode/{}", goal.id()) }),
                embedding,
            )),
            Err(e) => tracing::warn!(error = %e, "episode embedding failed, skipping vector record"),
        }

        if let Err(e) = self.memory.upsert_many(records) {
            tracing::error!(error = %e, "failed to persist turn, memory left unchanged");
        }
    }

    /// 记录终止失败（完整链路）并转为 Failed -> Idle
    fn fail(
        &self,
        state: &mut TurnState,
        goal: &Goal,
        attempt: Option<&Attempt>,
        failure: OrchestratorFailure,
        mut metrics: TurnMetrics,
        started: Instant,
    ) -> OrchestratorFailure {
        let chain = json!({
            "goal": goal,
            "plan": attempt.map(|a| &a.plan),
            "trace": attempt.map(|a| &a.trace),
            "verdict": attempt.and_then(|a| a.verdict.as_ref()),
        });
        tracing::error!(
            failure = %failure,
            phase = ?state.phase(),
            replans = state.replans(),
            chain = %chain,
            "turn failed"
        );
        self.enter(state, BrainPhase::Failed, goal.context().turn);
        self.emit(BrainEvent::Failed {
            message: failure.to_string(),
        });
        self.enter(state, BrainPhase::Idle, goal.context().turn);
        metrics.finish(started, state.replans());
        metrics.log("failed");
        failure
    }
}
