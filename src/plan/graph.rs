//! 计划依赖图
//!
//! 邻接表 + 入度表，Kahn 拓扑排序检测环；同层按声明顺序出队，结果确定。

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::plan::types::{Step, StepId};

/// 计划结构错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<StepId>),
    #[error("plan has {0} respond steps, at most one is allowed")]
    MultipleRespond(usize),
}

/// 依赖图：step -> 依赖它的步骤；step -> 未满足依赖数
pub struct PlanGraph {
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    pub in_degree: HashMap<StepId, usize>,
    order: Vec<StepId>,
}

impl PlanGraph {
    pub fn new(steps: &[Step]) -> Result<Self, PlanError> {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        let mut order = Vec::with_capacity(steps.len());

        for step in steps {
            if in_degree.insert(step.id.clone(), 0).is_some() {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
            adjacency.insert(step.id.clone(), Vec::new());
            order.push(step.id.clone());
        }

        for step in steps {
            let mut seen = HashSet::new();
            for dep in &step.depends_on {
                if !in_degree.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                // 重复声明的依赖只计一次
                if !seen.insert(dep) {
                    continue;
                }
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self {
            adjacency,
            in_degree,
            order,
        })
    }

    /// 拓扑序；存在环时返回环上（未能出队）的步骤
    pub fn topological_order(&self) -> Result<Vec<StepId>, PlanError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = self
            .order
            .iter()
            .filter(|id| degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() != self.order.len() {
            let stuck = self
                .order
                .iter()
                .filter(|id| !sorted.contains(id))
                .cloned()
                .collect();
            return Err(PlanError::Cycle(stuck));
        }
        Ok(sorted)
    }

    /// 只看 keep 选中的步骤时的汇点（没有被选中的步骤依赖它），按声明顺序
    pub fn sinks_among(&self, keep: impl Fn(&str) -> bool) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| keep(id))
            .filter(|id| {
                self.adjacency
                    .get(*id)
                    .map(|d| d.iter().all(|dependent| !keep(dependent)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// 传递依赖于 id 的所有步骤
    pub fn transitive_dependents(&self, id: &str) -> HashSet<StepId> {
        let mut out = HashSet::new();
        let mut stack: Vec<&StepId> = self
            .adjacency
            .get(id)
            .map(|d| d.iter().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if out.insert(next.clone()) {
                if let Some(more) = self.adjacency.get(next) {
                    stack.extend(more.iter());
                }
            }
        }
        out
    }
}

/// 便捷函数：构图并拓扑排序
pub fn topological_order(steps: &[Step]) -> Result<Vec<StepId>, PlanError> {
    PlanGraph::new(steps)?.topological_order()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::tool_call(id, "echo", serde_json::json!({})).after(deps.iter().copied())
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let steps = vec![step("c", &["a", "b"]), step("a", &[]), step("b", &["a"])];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![step("a", &["ghost"])];
        assert_eq!(
            topological_order(&steps),
            Err(PlanError::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string()
            })
        );
    }

    #[test]
    fn test_cycle_reports_stuck_steps() {
        let steps = vec![step("a", &[]), step("b", &["c"]), step("c", &["b"])];
        match topological_order(&steps) {
            Err(PlanError::Cycle(ids)) => assert_eq!(ids, vec!["b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_sinks_and_transitive_dependents() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"]), step("d", &[])];
        let graph = PlanGraph::new(&steps).unwrap();
        assert_eq!(graph.sinks_among(|_| true), vec!["c", "d"]);
        // 排除 c 后，b 成为汇点
        assert_eq!(graph.sinks_among(|id| id != "c"), vec!["b", "d"]);
        let deps = graph.transitive_dependents("a");
        assert!(deps.contains("b") && deps.contains("c"));
        assert!(!deps.contains("d"));
    }

    #[test]
    fn test_duplicate_dependency_counts_once() {
        let steps = vec![step("a", &[]), step("b", &["a", "a"])];
        let graph = PlanGraph::new(&steps).unwrap();
        assert_eq!(graph.in_degree.get("b"), Some(&1));
        assert!(graph.topological_order().is_ok());
    }
}
