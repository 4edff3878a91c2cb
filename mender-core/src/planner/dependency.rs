use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::planner::model::DependencyGraph;
use crate::types::{PlanDocument, StepNumber};

pub(crate) fn build_step_dependency_graph(doc: &PlanDocument) -> Result<DependencyGraph, String> {
    let numbers: BTreeSet<StepNumber> = doc.steps.iter().map(|s| s.number).collect();
    let mut depends_on: BTreeMap<StepNumber, Vec<StepNumber>> = BTreeMap::new();

    for step in &doc.steps {
        let mut d: Vec<StepNumber> = step
            .depends_on
            .iter()
            .copied()
            .filter(|x| numbers.contains(x))
            .collect();
        d.sort_unstable();
        d.dedup();
        depends_on.insert(step.number, d);
    }

    let topo_order = topo_sort(&numbers, &depends_on)?;
    let levels = compute_levels(&topo_order, &depends_on);

    Ok(DependencyGraph {
        depends_on,
        levels,
        topo_order,
    })
}

fn topo_sort(
    nodes: &BTreeSet<StepNumber>,
    depends_on: &BTreeMap<StepNumber, Vec<StepNumber>>,
) -> Result<Vec<StepNumber>, String> {
    let mut indeg: BTreeMap<StepNumber, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut outgoing: BTreeMap<StepNumber, Vec<StepNumber>> = BTreeMap::new();

    for (n, deps) in depends_on {
        for d in deps {
            if !nodes.contains(d) {
                continue;
            }
            if let Some(e) = indeg.get_mut(n) {
                *e += 1;
            }
            outgoing.entry(*d).or_default().push(*n);
        }
    }

    for v in outgoing.values_mut() {
        v.sort_unstable();
    }

    let mut q: VecDeque<StepNumber> = nodes.iter().copied().filter(|n| indeg[n] == 0).collect();

    let mut out = Vec::with_capacity(nodes.len());
    while let Some(n) = q.pop_front() {
        out.push(n);
        if let Some(nexts) = outgoing.get(&n) {
            for m in nexts {
                if let Some(e) = indeg.get_mut(m) {
                    *e -= 1;
                    if *e == 0 {
                        q.push_back(*m);
                    }
                }
            }
        }
    }

    if out.len() != nodes.len() {
        return Err("cycle detected in step dependency graph".to_string());
    }
    Ok(out)
}

fn compute_levels(
    topo: &[StepNumber],
    depends_on: &BTreeMap<StepNumber, Vec<StepNumber>>,
) -> Vec<Vec<StepNumber>> {
    let mut level: BTreeMap<StepNumber, usize> = BTreeMap::new();
    for node in topo {
        let deps = depends_on.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
        let l = deps
            .iter()
            .filter_map(|d| level.get(d).copied())
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        level.insert(*node, l);
    }

    let max_level = level.values().copied().max().unwrap_or(0);
    let mut levels = vec![Vec::<StepNumber>::new(); max_level + 1];
    for node in topo {
        levels[level[node]].push(*node);
    }
    levels
}
