//! 记忆层：会话记录（只追加）、进程内计划库与中英文分词

pub mod conversation;
pub mod plan_library;
pub mod tokenizer;

pub use conversation::{Message, Role, Transcript};
pub use plan_library::{PlanHint, PlanLibrary};
