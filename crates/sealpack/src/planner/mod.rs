use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};
use crate::pipeline::{BuildRequest, Stage};
use crate::targets::Target;

pub type TaskId = String;

pub const SOURCE_TASK: &str = "source.fingerprint";
pub const REPORT_TASK: &str = "report.write";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    /// `source`, `report`, or a target label.
    pub scope: String,
    pub phase: String,
    pub after: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    /// Source fingerprint, then one stage chain per selected target, then the
    /// report once every chain has ended.
    pub fn for_request(req: &BuildRequest) -> Result<Self> {
        let mut plan = Plan::default();
        plan.add(Task {
            id: SOURCE_TASK.into(),
            label: format!("Hash {}", req.entry_file.display()),
            scope: "source".into(),
            phase: "fingerprint".into(),
            after: Vec::new(),
        })?;

        let mut chain_ends = Vec::new();
        for target in Target::ordered(&req.targets) {
            let mut prev: TaskId = SOURCE_TASK.into();
            for stage in Stage::sequence(target.spec()) {
                let id = stage_task_id(target, stage);
                plan.add(Task {
                    id: id.clone(),
                    label: stage.label().into(),
                    scope: target.label().into(),
                    phase: stage.id().into(),
                    after: vec![prev],
                })?;
                prev = id;
            }
            chain_ends.push(prev);
        }

        plan.add(Task {
            id: REPORT_TASK.into(),
            label: "Write packaging report".into(),
            scope: "report".into(),
            phase: "report".into(),
            after: chain_ends,
        })?;
        Ok(plan)
    }

    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn check_dep(&self, task: &Task, dep: &str) -> Result<()> {
        if self.tasks.contains_key(dep) {
            Ok(())
        } else {
            Err(Error::msg(format!(
                "task '{}' has unknown dependency '{}'",
                task.id, dep
            )))
        }
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            let deps: BTreeSet<&str> = task.after.iter().map(String::as_str).collect();
            incoming.insert(id.as_str(), deps.len());
            outgoing.entry(id.as_str()).or_default();
            for dep in deps {
                self.check_dep(task, dep)?;
                outgoing.entry(dep).or_default().insert(id.as_str());
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
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.scope, task.phase
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                self.check_dep(task, dep)?;
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, task.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

pub fn stage_task_id(target: Target, stage: Stage) -> TaskId {
    format!("{target}.{stage}")
}
