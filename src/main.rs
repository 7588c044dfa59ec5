//! planloop 命令行入口
//!
//! 初始化日志、加载配置、构建带计算器工具的编排器，运行一次查询并打印答案。

use anyhow::Context;
use planloop::{observability, OrchestratorBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("usage: planloop <query...>");
    }

    let orchestrator = OrchestratorBuilder::from_config_path(None)
        .context("Failed to load config")?
        .with_default_tools()
        .build();

    let answer = orchestrator.run_query(&query).await;
    println!("{answer}");
    Ok(())
}
