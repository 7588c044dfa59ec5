//! 控制循环的各阶段组件：意图识别 → 计划生成 → 步骤执行 → 结果评估 → 重规划 → 答案合成

pub mod answer;
pub mod evaluator;
pub mod generator;
pub mod intent;
pub mod prompts;
pub mod replanner;
pub mod step_executor;

pub use answer::AnswerComposer;
pub use evaluator::OutcomeEvaluator;
pub use generator::PlanGenerator;
pub use intent::{IntentClassifier, IntentResult, IntentType};
pub use replanner::{ReplanOutcome, Replanner};
pub use step_executor::{select_next, StepExecutor};
