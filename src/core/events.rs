//! 会话过程事件：供调用方实时展示阶段切换、计划、步骤执行、评估与重规划

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::state::{SessionOutcome, SessionPhase};
use crate::plan::StepStatus;

/// 单个过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 状态机阶段切换
    PhaseChanged { phase: SessionPhase },
    /// 新计划就绪（首次生成或重规划后）
    PlanReady {
        plan_id: String,
        step_count: usize,
        confidence: f64,
        fallback: bool,
    },
    /// 步骤执行完毕（结果预览，避免过长）
    StepExecuted {
        step_id: String,
        tool: String,
        status: StepStatus,
        preview: String,
    },
    /// 评估结论
    Evaluated { need_replan: bool, reason: String },
    /// 重规划结果：plan / final_answer / exhausted
    Replanned { replan_count: u32, outcome: String },
    /// 会话结束
    Finished { outcome: SessionOutcome },
}

/// 可选的事件发送端；接收方已关闭时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::UnboundedSender<SessionEvent>>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let ev = SessionEvent::Evaluated {
            need_replan: true,
            reason: "step failed".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "evaluated");
        assert_eq!(v["need_replan"], true);

        let ev = SessionEvent::PhaseChanged {
            phase: SessionPhase::Replanning,
        };
        assert_eq!(serde_json::to_value(&ev).unwrap()["phase"], "replanning");
    }

    #[test]
    fn test_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        EventSink::new(Some(tx)).emit(SessionEvent::Finished {
            outcome: SessionOutcome::Cancelled,
        });
        EventSink::default().emit(SessionEvent::Finished {
            outcome: SessionOutcome::Cancelled,
        });
    }
}
