//! 计划库：进程内记录成功完成的计划，为新请求提供「相似计划」提示
//!
//! 按查询词集合（jieba 分词）的 Jaccard 相似度检索；不做持久化，进程退出即丢失。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::memory::tokenizer::{jaccard_similarity, tokenize_to_set};
use crate::plan::Plan;

/// 相似计划摘要（写入规划 prompt）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanHint {
    pub plan_id: String,
    pub query: String,
    pub goal: String,
    pub tools: Vec<String>,
    pub step_count: usize,
    pub score: f64,
}

impl PlanHint {
    pub fn summary(&self) -> String {
        let tools = if self.tools.is_empty() {
            "none".to_string()
        } else {
            self.tools.join(", ")
        };
        format!(
            "- [{}] goal: {} | steps: {} | tools: {}",
            self.plan_id, self.goal, self.step_count, tools
        )
    }
}

/// 进程内计划库
#[derive(Clone)]
pub struct PlanLibrary {
    /// (plan, 查询词集合)
    store: Arc<RwLock<Vec<(Plan, HashSet<String>)>>>,
    max_entries: usize,
}

impl PlanLibrary {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }

    /// 记录一个成功的计划；超出容量时淘汰最早的
    pub fn record(&self, plan: &Plan) {
        let tokens = tokenize_to_set(&plan.query);
        if tokens.is_empty() {
            return;
        }
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.retain(|(p, _)| p.id != plan.id);
        store.push((plan.clone(), tokens));
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
    }

    /// 按相似度降序返回至多 limit 条；相似度为 0 的不返回
    pub fn similar(&self, query: &str, limit: usize) -> Vec<PlanHint> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() || limit == 0 {
            return Vec::new();
        }
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<PlanHint> = store
            .iter()
            .map(|(plan, tokens)| (plan, jaccard_similarity(&query_tokens, tokens)))
            .filter(|(_, score)| *score > 0.0)
            .map(|(plan, score)| PlanHint {
                plan_id: plan.id.clone(),
                query: plan.query.clone(),
                goal: plan.goal.clone(),
                tools: plan.tools_used().into_iter().map(String::from).collect(),
                step_count: plan.steps.len(),
                score,
            })
            .collect();
        // 稳定排序：同分时较新的在前
        scored.reverse();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PlanLibrary {
    fn default() -> Self {
        Self::new(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Step;
    use serde_json::json;

    fn plan(query: &str) -> Plan {
        Plan::new(
            query,
            query,
            vec![Step::new("step_1", "calc").with_tool("calculate", [("expression", json!("1+1"))])],
        )
    }

    #[test]
    fn test_similar_ranks_by_overlap() {
        let lib = PlanLibrary::new(10);
        lib.record(&plan("what is 2 plus 2"));
        lib.record(&plan("compare revenue of A and B"));
        let hints = lib.similar("what is 3 plus 4", 5);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].query, "what is 2 plus 2");
        assert_eq!(hints[0].tools, vec!["calculate"]);
        assert!(hints[0].summary().contains("calculate"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let lib = PlanLibrary::new(2);
        lib.record(&plan("alpha query"));
        lib.record(&plan("beta query"));
        lib.record(&plan("gamma query"));
        assert_eq!(lib.len(), 2);
        assert!(lib.similar("alpha", 5).is_empty());
    }

    #[test]
    fn test_cjk_tokens() {
        let lib = PlanLibrary::default();
        lib.record(&plan("对比两个指标"));
        lib.record(&plan("查询销售额"));
        let hints = lib.similar("对比指标", 5);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].query, "对比两个指标");
        assert!(lib.similar("", 1).is_empty());
    }
}
