//! 步骤依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；悬空依赖（指向不存在的步骤）不计入边。

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::plan::types::{Step, StepId};

/// 步骤依赖图
pub struct DependencyGraph {
    /// 按计划顺序排列的步骤 ID（去重）
    order: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    in_degree: HashMap<StepId, usize>,
}

impl DependencyGraph {
    pub fn new(steps: &[Step]) -> Self {
        let mut order = Vec::new();
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            if !in_degree.contains_key(&step.id) {
                order.push(step.id.clone());
                in_degree.insert(step.id.clone(), 0);
                adjacency.insert(step.id.clone(), Vec::new());
            }
        }

        let mut edges: HashSet<(StepId, StepId)> = HashSet::new();
        for step in steps {
            for dep in &step.dependencies {
                if !in_degree.contains_key(dep) {
                    continue;
                }
                if edges.insert((dep.clone(), step.id.clone())) {
                    adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                    *in_degree.entry(step.id.clone()).or_insert(0) += 1;
                }
            }
        }

        Self {
            order,
            adjacency,
            in_degree,
        }
    }

    /// Kahn 拓扑排序；存在环时返回环上（及被环阻塞）的步骤 ID
    pub fn topological_order(&self) -> Result<Vec<StepId>, Vec<StepId>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: Vec<StepId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while !ready.is_empty() {
            let id = ready.remove(0);
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            let done: HashSet<&StepId> = sorted.iter().collect();
            Err(self
                .order
                .iter()
                .filter(|id| !done.contains(id))
                .cloned()
                .collect())
        }
    }

    /// 被给定步骤（通常是失败步骤）直接或间接阻塞的步骤，按计划顺序返回
    pub fn blocked_by(&self, roots: &BTreeSet<StepId>) -> Vec<StepId> {
        let mut blocked: HashSet<StepId> = HashSet::new();
        let mut stack: Vec<StepId> = roots.iter().cloned().collect();
        while let Some(id) = stack.pop() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if blocked.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|id| blocked.contains(*id) && !roots.contains(*id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Vec<Step> {
        vec![
            Step::new("step_1", "a"),
            Step::new("step_2", "b").depends_on(["step_1"]),
            Step::new("step_3", "c").depends_on(["step_2"]),
            Step::new("step_4", "d"),
        ]
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let order = DependencyGraph::new(&chain()).topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("step_1") < pos("step_2"));
        assert!(pos("step_2") < pos("step_3"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_cycle_reported() {
        let steps = vec![
            Step::new("a", "a").depends_on(["b"]),
            Step::new("b", "b").depends_on(["a"]),
            Step::new("c", "c"),
        ];
        let cycle = DependencyGraph::new(&steps).topological_order().unwrap_err();
        assert_eq!(cycle, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_dangling_dependency_ignored() {
        let steps = vec![Step::new("a", "a").depends_on(["ghost"])];
        assert!(DependencyGraph::new(&steps).topological_order().is_ok());
    }

    #[test]
    fn test_blocked_by_is_transitive() {
        let roots: BTreeSet<StepId> = ["step_1".to_string()].into_iter().collect();
        let blocked = DependencyGraph::new(&chain()).blocked_by(&roots);
        assert_eq!(blocked, vec!["step_2".to_string(), "step_3".to_string()]);
    }
}
