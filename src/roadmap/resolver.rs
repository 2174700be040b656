//! Dependency resolution for the roadmap.
//!
//! Cycle detection runs over every row, whatever its status, with a
//! three-colour depth-first search. Only then is a build order computed,
//! over pending features alone, with completed features counting as
//! satisfied dependencies.

use super::parser::{Feature, FeatureStatus};
use crate::errors::LoopError;
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// A pending feature that cannot be scheduled, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unschedulable {
    pub feature: Feature,
    pub reason: String,
}

/// The resolved build order.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    /// Pending features in dependency order.
    pub order: Vec<Feature>,
    /// Pending features whose dependencies can never be satisfied this run.
    pub unschedulable: Vec<Unschedulable>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Find a dependency cycle, returned as the id path with the first id
/// repeated at the end (`[1, 2, 1]`). Dependencies on ids that are not in
/// the roadmap are not edges.
pub fn find_cycle(features: &[Feature]) -> Option<Vec<u32>> {
    let index: HashMap<u32, usize> = features.iter().enumerate().map(|(i, f)| (f.id, i)).collect();
    let mut marks = vec![Mark::Unvisited; features.len()];
    let mut path: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        features: &[Feature],
        index: &HashMap<u32, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<u32>> {
        marks[node] = Mark::InProgress;
        path.push(node);

        for dep in &features[node].deps {
            let Some(&next) = index.get(dep) else {
                continue;
            };
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<u32> = path[start..].iter().map(|&n| features[n].id).collect();
                    cycle.push(features[next].id);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, features, index, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    for start in 0..features.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, features, &index, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Fail with [`LoopError::CircularDependency`] if the roadmap has a cycle.
pub fn check_cycles(features: &[Feature]) -> Result<()> {
    if let Some(cycle) = find_cycle(features) {
        return Err(LoopError::CircularDependency {
            cycle: cycle.iter().map(u32::to_string).collect(),
        }
        .into());
    }
    Ok(())
}

/// Compute the build order for the pending features of a roadmap.
pub fn resolve(features: &[Feature]) -> Result<BuildPlan> {
    let mut seen = HashSet::new();
    for f in features {
        if !seen.insert(f.id) {
            bail!("Duplicate feature id {} in roadmap", f.id);
        }
    }

    check_cycles(features)?;

    let status: HashMap<u32, FeatureStatus> = features.iter().map(|f| (f.id, f.status)).collect();
    let pending: Vec<&Feature> = features
        .iter()
        .filter(|f| f.status == FeatureStatus::Pending)
        .collect();

    // A pending feature is blocked when some dependency is neither completed
    // nor a schedulable pending feature. The graph is acyclic here, so a
    // fixed-point pass terminates.
    let mut blocked: HashMap<u32, String> = HashMap::new();
    loop {
        let mut changed = false;
        for f in &pending {
            if blocked.contains_key(&f.id) {
                continue;
            }
            let reason = f.deps.iter().find_map(|dep| match status.get(dep) {
                Some(FeatureStatus::Completed) => None,
                Some(FeatureStatus::Pending) if !blocked.contains_key(dep) => None,
                Some(FeatureStatus::Pending) => Some(format!("depends on unschedulable feature {}", dep)),
                Some(other) => Some(format!("depends on feature {} which is {}", dep, other)),
                None => Some(format!("depends on unknown feature {}", dep)),
            });
            if let Some(reason) = reason {
                blocked.insert(f.id, reason);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let schedulable: Vec<&Feature> = pending
        .iter()
        .copied()
        .filter(|f| !blocked.contains_key(&f.id))
        .collect();
    let schedulable_ids: HashSet<u32> = schedulable.iter().map(|f| f.id).collect();

    // Kahn's algorithm, seeded and drained in roadmap order.
    let mut in_degree: HashMap<u32, usize> = HashMap::new();
    let mut pending_deps: HashMap<u32, HashSet<u32>> = HashMap::new();
    for f in &schedulable {
        let deps: HashSet<u32> = f
            .deps
            .iter()
            .copied()
            .filter(|d| schedulable_ids.contains(d))
            .collect();
        in_degree.insert(f.id, deps.len());
        pending_deps.insert(f.id, deps);
    }

    let mut queue: Vec<u32> = schedulable
        .iter()
        .filter(|f| in_degree.get(&f.id) == Some(&0))
        .map(|f| f.id)
        .collect();
    let mut order_ids = Vec::with_capacity(schedulable.len());
    let mut qi = 0;
    while qi < queue.len() {
        let current = queue[qi];
        qi += 1;
        order_ids.push(current);
        for f in &schedulable {
            let depends = pending_deps
                .get(&f.id)
                .is_some_and(|deps| deps.contains(&current));
            if depends {
                if let Some(d) = in_degree.get_mut(&f.id) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        queue.push(f.id);
                    }
                }
            }
        }
    }

    let by_id: HashMap<u32, &Feature> = schedulable.iter().map(|f| (f.id, *f)).collect();
    let order = order_ids
        .iter()
        .filter_map(|id| by_id.get(id).map(|f| (*f).clone()))
        .collect();

    let unschedulable: Vec<Unschedulable> = pending
        .iter()
        .filter_map(|f| {
            blocked.get(&f.id).map(|reason| Unschedulable {
                feature: (*f).clone(),
                reason: reason.clone(),
            })
        })
        .collect();

    for u in &unschedulable {
        warn!(id = u.feature.id, name = %u.feature.name, "Feature cannot be scheduled: {}", u.reason);
    }

    Ok(BuildPlan {
        order,
        unschedulable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: u32, deps: &[u32], status: FeatureStatus) -> Feature {
        Feature {
            id,
            name: format!("F{}", id),
            source: String::new(),
            issue: String::new(),
            complexity: "S".into(),
            deps: deps.to_vec(),
            status,
        }
    }

    fn ids(plan: &BuildPlan) -> Vec<u32> {
        plan.order.iter().map(|f| f.id).collect()
    }

    #[test]
    fn test_linear_chain_orders_dependencies_first() {
        let features = vec![
            feature(1, &[], FeatureStatus::Pending),
            feature(2, &[1], FeatureStatus::Pending),
            feature(3, &[2, 1], FeatureStatus::Pending),
        ];
        assert_eq!(ids(&resolve(&features).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_roadmap_order_is_not_dependency_order() {
        let features = vec![
            feature(3, &[2], FeatureStatus::Pending),
            feature(2, &[1], FeatureStatus::Pending),
            feature(1, &[], FeatureStatus::Pending),
        ];
        assert_eq!(ids(&resolve(&features).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_two_node_cycle_reports_full_path() {
        let features = vec![
            feature(1, &[2], FeatureStatus::Pending),
            feature(2, &[1], FeatureStatus::Pending),
        ];
        assert_eq!(find_cycle(&features), Some(vec![1, 2, 1]));
        let err = resolve(&features).unwrap_err();
        match err.downcast_ref::<LoopError>() {
            Some(LoopError::CircularDependency { cycle }) => {
                assert_eq!(cycle.join(" -> "), "1 -> 2 -> 1");
            }
            other => panic!("expected CircularDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_path_is_a_real_cycle() {
        let features = vec![
            feature(1, &[2], FeatureStatus::Pending),
            feature(2, &[3], FeatureStatus::Pending),
            feature(3, &[4], FeatureStatus::Pending),
            feature(4, &[2], FeatureStatus::Pending),
        ];
        let cycle = find_cycle(&features).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        for pair in cycle.windows(2) {
            let f = features.iter().find(|f| f.id == pair[0]).unwrap();
            assert!(f.deps.contains(&pair[1]), "{:?} is not an edge", pair);
        }
        assert_eq!(cycle, vec![2, 3, 4, 2]);
    }

    #[test]
    fn test_cycle_among_completed_features_still_detected() {
        let features = vec![
            feature(1, &[2], FeatureStatus::Completed),
            feature(2, &[1], FeatureStatus::Completed),
            feature(3, &[], FeatureStatus::Pending),
        ];
        assert!(resolve(&features).is_err());
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let features = vec![feature(5, &[5], FeatureStatus::Pending)];
        assert_eq!(find_cycle(&features), Some(vec![5, 5]));
    }

    #[test]
    fn test_completed_features_excluded_but_satisfy_deps() {
        let features = vec![
            feature(1, &[], FeatureStatus::Completed),
            feature(2, &[1], FeatureStatus::Pending),
        ];
        assert_eq!(ids(&resolve(&features).unwrap()), vec![2]);
    }

    #[test]
    fn test_blocked_and_unknown_deps_are_unschedulable_transitively() {
        let features = vec![
            feature(1, &[], FeatureStatus::Blocked),
            feature(2, &[1], FeatureStatus::Pending),
            feature(3, &[2], FeatureStatus::Pending),
            feature(4, &[42], FeatureStatus::Pending),
            feature(5, &[], FeatureStatus::Pending),
        ];
        let plan = resolve(&features).unwrap();
        assert_eq!(ids(&plan), vec![5]);
        let blocked: Vec<u32> = plan.unschedulable.iter().map(|u| u.feature.id).collect();
        assert_eq!(blocked, vec![2, 3, 4]);
        assert!(plan.unschedulable[2].reason.contains("unknown feature 42"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let features = vec![
            feature(1, &[], FeatureStatus::Pending),
            feature(1, &[], FeatureStatus::Pending),
        ];
        assert!(resolve(&features).unwrap_err().to_string().contains("Duplicate"));
    }

    #[test]
    fn test_every_feature_after_its_dependencies() {
        let features = vec![
            feature(1, &[4], FeatureStatus::Pending),
            feature(2, &[], FeatureStatus::Pending),
            feature(3, &[1, 2], FeatureStatus::Pending),
            feature(4, &[2], FeatureStatus::Pending),
            feature(5, &[3, 4], FeatureStatus::Pending),
        ];
        let order = ids(&resolve(&features).unwrap());
        assert_eq!(order.len(), 5);
        let pos = |id: u32| order.iter().position(|&x| x == id).unwrap();
        for f in &features {
            for dep in &f.deps {
                assert!(pos(*dep) < pos(f.id));
            }
        }
    }

    #[test]
    fn test_repeated_dependency_is_counted_once() {
        let features = vec![
            feature(1, &[], FeatureStatus::Pending),
            feature(2, &[1, 1], FeatureStatus::Pending),
            feature(3, &[2, 1, 2], FeatureStatus::Pending),
        ];
        let plan = resolve(&features).unwrap();
        assert_eq!(ids(&plan), vec![1, 2, 3]);
        assert!(plan.unschedulable.is_empty());
    }

    #[test]
    fn test_repeated_dependency_in_roadmap_row_is_scheduled() {
        let content = "| # | Feature | Source | Jira | Complexity | Deps | Status |\n\
                       |---|---|---|---|---|---|---|\n\
                       | 1 | Auth | spec | - | S | - | \u{2b1c} |\n\
                       | 2 | Profile | spec | - | S | #1, 1 | \u{2b1c} |\n";
        let features = crate::roadmap::parse_roadmap(content);
        assert_eq!(features[1].deps, vec![1]);
        assert_eq!(ids(&resolve(&features).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_empty_roadmap() {
        assert!(resolve(&[]).unwrap().is_empty());
    }
}
