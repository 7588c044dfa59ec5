//! 工具层：Tool trait、注册表、带超时与审计日志的执行器、内置计算器

pub mod calculator;
pub mod executor;
pub mod registry;
pub mod schema;

pub use calculator::CalculatorTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use schema::plan_schema_json;
