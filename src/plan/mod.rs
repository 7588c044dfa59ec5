//! 计划模型：Plan / Step 线格式、依赖图、容错解析、校验与归一化

pub mod builder;
pub mod graph;
pub mod normalize;
pub mod parse;
pub mod types;
pub mod validate;

pub use builder::PlanBuilder;
pub use graph::DependencyGraph;
pub use normalize::{NormalizedPlan, PlanNormalizer};
pub use parse::{extract_json_object, PlanParseError};
pub use types::*;
pub use validate::{is_well_formed_id, validate_plan, ValidationIssue};
