use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    // `name?` marks a dependency that may be absent from the plan.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if self.tasks.contains_key(dep) {
            return Ok(Some(dep));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!("unknown dependency '{}'", dep)))
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let resolved = self.resolve_dep(&provides, dep.as_str()).map_err(|e| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?;
                if let Some(dep_id) = resolved {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|id| (id.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to) {
                if let Some(slot) = incoming.get_mut(to) {
                    *slot += 1;
                }
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            let Some(children) = outgoing.get(n) else {
                continue;
            };
            for &m in children {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph deploy {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", from, to));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_dependencies_and_tokens() {
        let mut plan = Plan::default();
        plan.add(task("c", &["token:b"], &[])).unwrap();
        plan.add(task("b", &["a"], &["token:b"])).unwrap();
        plan.add(task("a", &[], &[])).unwrap();

        let ids: Vec<&str> = plan
            .ordered()
            .unwrap()
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn optional_missing_dependency_is_skipped() {
        let mut plan = Plan::default();
        plan.add(task("a", &["missing?"], &[])).unwrap();
        assert_eq!(plan.ordered().unwrap().len(), 1);
    }

    #[test]
    fn rejects_unknown_dependency_and_cycles() {
        let mut plan = Plan::default();
        plan.add(task("a", &["nope"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("unknown dependency 'nope'"), "unexpected err: {err}");

        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut plan = Plan::default();
        plan.add(task("a", &[], &[])).unwrap();
        assert!(plan.add(task("a", &[], &[])).is_err());
    }
}
