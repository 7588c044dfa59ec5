//! 编排器：计划 → 执行 → 评估 → 重规划 状态机
//!
//! 一次会话独占一个 SessionState，按 Classifying → Planning → Executing → Evaluating →
//! (Replanning → Executing | Terminal) 推进。重规划预算在调用 Replanner 之前检查；
//! 每个挂起点（LLM / 工具调用）都与 CancellationToken 竞争，取消后直接进入 Cancelled 终态。

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, OrchestratorConfig};
use crate::core::error::AgentError;
use crate::core::events::{EventSink, SessionEvent};
use crate::core::state::{SessionOutcome, SessionPhase, SessionState};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{Message, PlanLibrary};
use crate::plan::Plan;
use crate::stages::{
    select_next, AnswerComposer, IntentClassifier, IntentType, OutcomeEvaluator, PlanGenerator,
    ReplanOutcome, Replanner, StepExecutor,
};
use crate::stages::prompts::truncate_chars;

/// 一次会话的最终报告；state 已处于终态，不再可变
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// 面向用户的文本（答案或失败说明）
    pub answer: String,
    pub state: SessionState,
}

/// 主控编排器（可跨会话复用，每次会话新建 SessionState）
pub struct Orchestrator {
    pub(crate) classifier: IntentClassifier,
    pub(crate) generator: PlanGenerator,
    pub(crate) executor: StepExecutor,
    pub(crate) evaluator: OutcomeEvaluator,
    pub(crate) replanner: Replanner,
    pub(crate) composer: AnswerComposer,
    pub(crate) library: PlanLibrary,
    pub(crate) config: OrchestratorConfig,
    pub(crate) events: EventSink,
}

impl Orchestrator {
    /// 运行一次查询，返回面向用户的文本
    pub async fn run_query(&self, text: &str) -> String {
        self.run_session(text, CancellationToken::new()).await.answer
    }

    /// 运行一次完整会话；cancel 被触发时在最近的挂起点结束
    pub async fn run_session(&self, text: &str, cancel: CancellationToken) -> SessionReport {
        let mut state = SessionState::new(text);
        tracing::info!(query = %truncate_chars(text, 100), "session started");

        if let Err(e) = self.drive(&mut state, &cancel).await {
            let outcome = match e {
                AgentError::Cancelled => SessionOutcome::Cancelled,
                other => SessionOutcome::Failed {
                    reason: failure_message(&other),
                },
            };
            self.finish(&mut state, outcome);
        }

        let outcome = state.outcome().cloned().unwrap_or(SessionOutcome::Cancelled);
        let answer = match &outcome {
            SessionOutcome::Answered { answer } => answer.clone(),
            SessionOutcome::Failed { reason } => reason.clone(),
            SessionOutcome::Cancelled => "The request was cancelled.".to_string(),
        };
        SessionReport {
            outcome,
            answer,
            state,
        }
    }

    /// 正常结束时在内部调用 finish；返回 Err 的情况由 run_session 收尾
    async fn drive(&self, state: &mut SessionState, cancel: &CancellationToken) -> Result<(), AgentError> {
        let intent = if self.config.classify_intent {
            self.enter(state, SessionPhase::Classifying);
            let result = until_cancelled(cancel, self.classifier.classify(state.input())).await?;
            tracing::info!(intent = %result.intent, confidence = result.confidence, "intent classified");
            state.set_context("intent_confidence", json!(result.confidence));
            state.set_context("intent_reason", json!(result.reason));
            result.intent
        } else {
            IntentType::default()
        };
        state.set_intent(intent);
        state.set_context("intent", json!(intent.as_str()));

        self.enter(state, SessionPhase::Planning);
        let plan = until_cancelled(
            cancel,
            self.generator.generate(state.input(), intent, state.context()),
        )
        .await?;
        self.install(state, plan);

        loop {
            if self.current_plan_is_done(state) {
                let answer = until_cancelled(cancel, self.composer.compose(state.input(), &state.latest_output())).await?;
                self.finish(state, SessionOutcome::Answered { answer });
                return Ok(());
            }

            self.enter(state, SessionPhase::Executing);
            self.execute_cycle(state, cancel).await?;

            self.enter(state, SessionPhase::Evaluating);
            let Some(plan) = state.current_plan().cloned() else {
                return Err(AgentError::NoReplanTarget("no current plan".to_string()));
            };
            let output = state.current_output();
            let evaluation = until_cancelled(
                cancel,
                self.evaluator
                    .evaluate(state.input(), &output, &plan, state.current_cycle_records()),
            )
            .await?;
            tracing::info!(
                plan_id = %plan.id,
                need_replan = evaluation.need_replan,
                reason = %evaluation.reason,
                "evaluation finished"
            );
            self.events.emit(SessionEvent::Evaluated {
                need_replan: evaluation.need_replan,
                reason: evaluation.reason.clone(),
            });
            let need_replan = evaluation.need_replan;
            state.set_evaluation(evaluation);

            if !need_replan {
                let answer = until_cancelled(cancel, self.composer.compose(state.input(), &output)).await?;
                self.library.record(&plan);
                self.finish(state, SessionOutcome::Answered { answer });
                return Ok(());
            }

            // 一轮重规划得到新计划后回到 Executing；耗尽则在同一评估结论上再试，直到预算用完
            loop {
                if state.replan_count() >= self.config.max_replan_count {
                    let err = AgentError::ReplanBudgetExhausted {
                        attempts: state.replan_count(),
                    };
                    tracing::warn!(replan_count = state.replan_count(), "replan budget exhausted");
                    self.finish(
                        state,
                        SessionOutcome::Failed {
                            reason: failure_message(&err),
                        },
                    );
                    return Ok(());
                }

                self.enter(state, SessionPhase::Replanning);
                let outcome = until_cancelled(cancel, self.replanner.replan(state)).await??;
                state.increment_replan();
                tracing::info!(
                    replan_count = state.replan_count(),
                    outcome = outcome.kind(),
                    "replan finished"
                );
                self.events.emit(SessionEvent::Replanned {
                    replan_count: state.replan_count(),
                    outcome: outcome.kind().to_string(),
                });

                match outcome {
                    ReplanOutcome::Plan(plan) => {
                        self.install(state, plan);
                        break;
                    }
                    ReplanOutcome::FinalAnswer(answer) => {
                        self.finish(state, SessionOutcome::Answered { answer });
                        return Ok(());
                    }
                    ReplanOutcome::Exhausted(reason) => {
                        tracing::warn!(replan_count = state.replan_count(), reason = %reason, "replan attempt exhausted");
                        state.set_last_error(reason);
                    }
                }
            }
        }
    }

    /// 内层循环：逐个执行可执行步骤，直到没有可选步骤
    async fn execute_cycle(&self, state: &mut SessionState, cancel: &CancellationToken) -> Result<(), AgentError> {
        loop {
            let step = {
                let Some(plan) = state.current_plan() else {
                    return Ok(());
                };
                match select_next(plan, &state.completed_step_ids()) {
                    Some(step) => step.clone(),
                    None => return Ok(()),
                }
            };

            let record = until_cancelled(cancel, self.executor.execute(&step, state)).await?;
            tracing::info!(
                step_id = %record.step_id(),
                tool = %record.tool_used(),
                status = ?record.status(),
                "step executed"
            );
            self.events.emit(SessionEvent::StepExecuted {
                step_id: record.step_id().to_string(),
                tool: record.tool_used().to_string(),
                status: record.status(),
                preview: truncate_chars(&record.result_text(), self.config.result_preview_chars),
            });
            state.record_execution(record);
        }
    }

    fn current_plan_is_done(&self, state: &SessionState) -> bool {
        state.current_plan().map(Plan::is_done_signal).unwrap_or(false)
    }

    fn enter(&self, state: &mut SessionState, phase: SessionPhase) {
        state.set_phase(phase);
        self.events.emit(SessionEvent::PhaseChanged { phase });
    }

    fn install(&self, state: &mut SessionState, plan: Plan) {
        tracing::info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            confidence = plan.confidence,
            fallback = plan.is_fallback(),
            replan_count = state.replan_count(),
            "plan installed"
        );
        self.events.emit(SessionEvent::PlanReady {
            plan_id: plan.id.clone(),
            step_count: plan.steps.len(),
            confidence: plan.confidence,
            fallback: plan.is_fallback(),
        });
        state.push_message(Message::system(format!(
            "Plan {} ({} steps): {}",
            plan.id,
            plan.steps.len(),
            plan.goal
        )));
        state.install_plan(plan);
    }

    fn finish(&self, state: &mut SessionState, outcome: SessionOutcome) {
        match &outcome {
            SessionOutcome::Answered { .. } => {
                tracing::info!(replan_count = state.replan_count(), "session answered")
            }
            SessionOutcome::Failed { reason } => {
                tracing::warn!(replan_count = state.replan_count(), reason = %reason, "session failed");
                state.push_message(Message::assistant(reason.clone()));
            }
            SessionOutcome::Cancelled => tracing::info!("session cancelled"),
        }
        self.events.emit(SessionEvent::Finished {
            outcome: outcome.clone(),
        });
        state.finish(outcome);
    }
}

/// 与取消信号竞争；取消优先
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}

/// 面向用户的失败说明（纯文本，并提示可重试）
fn failure_message(err: &AgentError) -> String {
    match err {
        AgentError::ReplanBudgetExhausted { attempts } => format!(
            "Sorry, I could not complete the request after {attempts} re-planning attempt(s). Please try again, possibly rephrasing the request."
        ),
        other => format!("Sorry, the request could not be completed ({other}). Please try again."),
    }
}

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）；超时与重试由构建器统一包装
pub(crate) fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "mock" || api_key.is_none() {
        tracing::warn!("No API key set or mock provider selected, using Mock LLM");
        return Arc::new(MockLlmClient::default());
    }

    tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
    Arc::new(OpenAiClient::new(
        cfg.llm.base_url.as_deref(),
        &cfg.llm.model,
        api_key.as_deref(),
        cfg.llm.temperature,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;

    #[test]
    fn test_mock_provider_selected() {
        let cfg = AppConfig {
            llm: LlmSection {
                provider: "mock".into(),
                ..LlmSection::default()
            },
            ..AppConfig::default()
        };
        // Mock 客户端 token 统计恒为 0
        assert_eq!(create_llm_from_config(&cfg).token_usage(), (0, 0, 0));
    }

    #[test]
    fn test_failure_message_suggests_retry() {
        let msg = failure_message(&AgentError::ReplanBudgetExhausted { attempts: 2 });
        assert!(msg.contains("2 re-planning attempt"));
        assert!(msg.contains("try again"));
        let msg = failure_message(&AgentError::NoReplanTarget("no current plan".into()));
        assert!(msg.contains("no current plan"));
    }

    #[tokio::test]
    async fn test_until_cancelled_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = until_cancelled(&cancel, async { 1 }).await;
        assert_eq!(result, Err(AgentError::Cancelled));

        let result = until_cancelled(&CancellationToken::new(), async { 1 }).await;
        assert_eq!(result, Ok(1));
    }
}
