//! Agent dependency graph: deterministic topological order and cycle
//! detection.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domain::error::DependencyCycleError;
use crate::domain::manifest::AgentSpec;

#[derive(Debug, Clone)]
pub struct AgentGraph {
    /// Agent names in declaration order.
    names: Vec<String>,
    /// Dependencies per agent, restricted to declared agents.
    deps: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl AgentGraph {
    /// Build the graph; fails when the dependencies contain a cycle.
    pub fn new(agents: &[AgentSpec]) -> Result<Self, DependencyCycleError> {
        let names: Vec<String> = agents.iter().map(|a| a.name.clone()).collect();
        let known: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let deps: HashMap<String, Vec<String>> = agents
            .iter()
            .map(|a| {
                let declared = a
                    .depends_on
                    .iter()
                    .filter(|d| known.contains(d.as_str()))
                    .cloned()
                    .collect();
                (a.name.clone(), declared)
            })
            .collect();

        let order = topo_order(&names, &deps)?;
        Ok(Self { names, deps, order })
    }

    /// Every agent, dependencies before dependents. Ties keep declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, agent: &str) -> &[String] {
        self.deps.get(agent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.deps.contains_key(agent)
    }

    /// `selected` plus everything it transitively depends on, in run order.
    pub fn closure<'a, I>(&self, selected: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut wanted = BTreeSet::new();
        let mut stack: Vec<&str> = selected.into_iter().collect();
        while let Some(agent) = stack.pop() {
            if wanted.insert(agent.to_string()) {
                stack.extend(self.dependencies(agent).iter().map(String::as_str));
            }
        }
        self.order
            .iter()
            .filter(|a| wanted.contains(a.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn topo_order(
    names: &[String],
    deps: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, DependencyCycleError> {
    let position: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let mut indegree: Vec<usize> = names
        .iter()
        .map(|n| deps.get(n).map_or(0, Vec::len))
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    for (i, name) in names.iter().enumerate() {
        for dep in deps.get(name).into_iter().flatten() {
            if let Some(&d) = position.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..names.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(i) = ready.pop_front() {
        order.push(names[i].clone());
        let mut unlocked = Vec::new();
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                unlocked.push(j);
            }
        }
        unlocked.sort_unstable();
        ready.extend(unlocked);
    }

    if order.len() == names.len() {
        return Ok(order);
    }
    let stuck: BTreeSet<usize> = (0..names.len()).filter(|&i| indegree[i] > 0).collect();
    Err(DependencyCycleError {
        agents: find_cycle(names, deps, &position, &stuck),
    })
}

/// One concrete cycle among the agents Kahn's algorithm could not order.
fn find_cycle(
    names: &[String],
    deps: &HashMap<String, Vec<String>>,
    position: &HashMap<&str, usize>,
    stuck: &BTreeSet<usize>,
) -> Vec<String> {
    // Every stuck node has a stuck dependency, so walking dependencies from
    // any stuck node must revisit a node.
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let next = deps
            .get(&names[current])
            .into_iter()
            .flatten()
            .filter_map(|d| position.get(d.as_str()).copied())
            .find(|d| stuck.contains(d));
        let Some(next) = next else {
            return stuck.iter().map(|&i| names[i].clone()).collect();
        };
        if let Some(&at) = seen.get(&next) {
            return path[at..].iter().map(|&i| names[i].clone()).collect();
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
