//! Dependency resolution: DAG construction, cycle detection, topological
//! ordering, and grouping of steps into concurrency waves.
//!
//! The resolver maintains both forward edges (dependencies) and reverse
//! edges (dependents) for traversal in either direction, and keeps the
//! declared step order around so every derived ordering is deterministic.

use std::collections::{HashMap, HashSet};

use crate::error::FlowValidationError;
use crate::flow::StepDefinition;

/// Resolves step dependencies into a validated DAG.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    /// Step ids in declaration order. Drives deterministic tie-breaking.
    ids: Vec<String>,
    /// Forward edges: step id -> ids it depends on, in declared order.
    deps: HashMap<String, Vec<String>>,
    /// Reverse edges: step id -> ids that depend on it.
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyResolver {
    /// Builds the graph from step definitions with unique ids.
    ///
    /// Fails immediately with `UnknownDependency` when a `dependsOn` entry
    /// references a missing id, and with `CycleDetected` (reporting the
    /// concrete cycle path) when the graph is not acyclic.
    pub fn new(steps: &[StepDefinition]) -> Result<Self, FlowValidationError> {
        let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let mut deps: HashMap<String, Vec<String>> = HashMap::with_capacity(steps.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::with_capacity(steps.len());
        for id in &ids {
            deps.insert(id.clone(), Vec::new());
            dependents.insert(id.clone(), Vec::new());
        }

        for step in steps {
            for dep in &step.depends_on {
                if !id_set.contains(dep.as_str()) {
                    return Err(FlowValidationError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                deps.get_mut(&step.id).expect("id inserted above").push(dep.clone());
                dependents
                    .get_mut(dep)
                    .expect("id inserted above")
                    .push(step.id.clone());
            }
        }

        let resolver = Self {
            ids,
            deps,
            dependents,
        };

        if let Some(path) = resolver.find_cycle() {
            return Err(FlowValidationError::CycleDetected { path });
        }

        Ok(resolver)
    }

    /// Dependencies of a step, in declared order.
    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.deps.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps that depend on the given step.
    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    /// Kahn's algorithm. An emitted order shorter than the step count is
    /// itself proof of a cycle, caught here again even though `new` already
    /// ran DFS detection.
    pub fn topological_sort(&self) -> Result<Vec<String>, FlowValidationError> {
        let mut indegree: HashMap<&str, usize> = self
            .ids
            .iter()
            .map(|id| (id.as_str(), self.deps[id].len()))
            .collect();

        let mut queue: Vec<&str> = self
            .ids
            .iter()
            .map(String::as_str)
            .filter(|id| indegree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        let mut head = 0;
        while head < queue.len() {
            let id = queue[head];
            head += 1;
            order.push(id.to_string());
            for dependent in self.dependents(id) {
                let entry = indegree.get_mut(dependent.as_str()).expect("known id");
                *entry -= 1;
                if *entry == 0 {
                    queue.push(dependent.as_str());
                }
            }
        }

        if order.len() != self.ids.len() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(FlowValidationError::CycleDetected { path });
        }

        Ok(order)
    }

    /// Groups steps into execution waves: each step lands in the earliest
    /// wave at which all of its dependencies sit in strictly earlier waves.
    /// Wave 0 holds the indegree-0 steps; a step never waits for a wave it
    /// does not depend on. Intra-wave order follows the topological sort.
    pub fn group_into_waves(&self) -> Result<Vec<Vec<String>>, FlowValidationError> {
        let order = self.topological_sort()?;

        let mut wave_of: HashMap<&str, usize> = HashMap::with_capacity(order.len());
        let mut waves: Vec<Vec<String>> = Vec::new();

        for id in &order {
            let wave = self
                .dependencies(id)
                .iter()
                .map(|dep| wave_of[dep.as_str()] + 1)
                .max()
                .unwrap_or(0);
            wave_of.insert(id.as_str(), wave);
            if wave == waves.len() {
                waves.push(Vec::new());
            }
            waves[wave].push(id.clone());
        }

        Ok(waves)
    }

    /// DFS with recursion-stack marking. Returns the concrete cycle path
    /// (nodes in cycle order, first node repeated at the end) when a
    /// back-edge is found.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for root in &self.ids {
            if visited.contains(root.as_str()) {
                continue;
            }
            if let Some(path) = self.dfs(root, &mut visited, &mut stack, &mut on_stack) {
                return Some(path);
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        for dep in self.dependencies(node) {
            if on_stack.contains(dep.as_str()) {
                // Back edge: slice the stack from the first occurrence of
                // `dep` and close the loop.
                let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(dep.clone());
                return Some(path);
            }
            if !visited.contains(dep.as_str()) {
                if let Some(path) = self.dfs(dep, visited, stack, on_stack) {
                    return Some(path);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::StepDefinition;

    fn step(id: &str, deps: Vec<&str>) -> StepDefinition {
        StepDefinition::agent(id, "agent").with_depends_on(deps)
    }

    #[test]
    fn test_single_step_single_wave() {
        let resolver = DependencyResolver::new(&[step("a", vec![])]).unwrap();
        let waves = resolver.group_into_waves().unwrap();
        assert_eq!(waves, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn test_unknown_dependency_fails_early() {
        let err = DependencyResolver::new(&[step("a", vec!["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            FlowValidationError::UnknownDependency {
                step_id: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let err = DependencyResolver::new(&[step("a", vec!["b"]), step("b", vec!["a"])])
            .unwrap_err();
        match err {
            FlowValidationError::CycleDetected { path } => {
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        let err = DependencyResolver::new(&[step("a", vec!["a"])]).unwrap_err();
        assert!(matches!(err, FlowValidationError::CycleDetected { .. }));
    }

    #[test]
    fn test_topological_sort_respects_dependencies() {
        let resolver = DependencyResolver::new(&[
            step("c", vec!["a", "b"]),
            step("a", vec![]),
            step("b", vec!["a"]),
        ])
        .unwrap();
        let order = resolver.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("a") < pos("c"));
    }

    #[test]
    fn test_diamond_waves() {
        // a -> {b, c} -> d
        let resolver = DependencyResolver::new(&[
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ])
        .unwrap();
        let waves = resolver.group_into_waves().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["a".to_string()]);
        assert_eq!(waves[1], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(waves[2], vec!["d".to_string()]);
    }

    #[test]
    fn test_step_never_waits_for_unrelated_wave() {
        // long chain a -> b -> c, plus independent x: x must sit in wave 0.
        let resolver = DependencyResolver::new(&[
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
            step("x", vec![]),
        ])
        .unwrap();
        let waves = resolver.group_into_waves().unwrap();
        assert!(waves[0].contains(&"x".to_string()));
        assert!(waves[0].contains(&"a".to_string()));
        assert_eq!(waves[2], vec!["c".to_string()]);
    }

    #[test]
    fn test_waves_partition_step_set() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec![]),
            step("c", vec!["a", "b"]),
            step("d", vec!["c"]),
            step("e", vec!["a"]),
        ];
        let resolver = DependencyResolver::new(&steps).unwrap();
        let waves = resolver.group_into_waves().unwrap();

        let mut seen = HashSet::new();
        for wave in &waves {
            for id in wave {
                assert!(seen.insert(id.clone()), "{id} assigned to two waves");
            }
        }
        assert_eq!(seen.len(), steps.len());

        // Every dependency lies in a strictly earlier wave.
        let wave_of = |id: &str| {
            waves
                .iter()
                .position(|w| w.contains(&id.to_string()))
                .unwrap()
        };
        for s in &steps {
            for dep in &s.depends_on {
                assert!(wave_of(dep) < wave_of(&s.id));
            }
        }
    }

    #[test]
    fn test_deterministic_wave_order() {
        let steps = vec![
            step("b", vec![]),
            step("a", vec![]),
            step("c", vec!["a", "b"]),
        ];
        let first = DependencyResolver::new(&steps)
            .unwrap()
            .group_into_waves()
            .unwrap();
        for _ in 0..10 {
            let again = DependencyResolver::new(&steps)
                .unwrap()
                .group_into_waves()
                .unwrap();
            assert_eq!(first, again);
        }
        // Declaration order preserved within the wave.
        assert_eq!(first[0], vec!["b".to_string(), "a".to_string()]);
    }
}
