use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::core::TaskKey;
use crate::store::Store;

/// Why a task body had to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// No record of a previous execution.
    New,
    /// A required task now produces an output with a different stamp.
    Call(TaskKey),
    /// A read resource now has a different stamp.
    Resource(Utf8PathBuf),
    /// The record refers to a task value that no longer decodes.
    Undecodable(TaskKey),
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::New => write!(f, "new task"),
            Reason::Call(key) => write!(f, "output of {key} changed"),
            Reason::Resource(path) => write!(f, "resource {path} changed"),
            Reason::Undecodable(key) => write!(f, "couldn't decode {key}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub key: TaskKey,
    pub reason: Reason,
    pub start: Instant,
    pub duration: Duration,
}

/// What a session did.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Every body execution, in completion order.
    pub executed: Vec<TaskExecution>,
    /// Number of tasks found consistent and reused without execution.
    pub reused: usize,
}

impl Report {
    pub fn executed_keys(&self) -> HashSet<&TaskKey> {
        self.executed.iter().map(|exec| &exec.key).collect()
    }

    pub fn was_executed(&self, key: &TaskKey) -> bool {
        self.executed.iter().any(|exec| &exec.key == key)
    }

    /// Number of executions of tasks with the given definition id.
    pub fn executions_of(&self, id: &str) -> usize {
        self.executed
            .iter()
            .filter(|exec| exec.key.id() == id)
            .count()
    }

    /// Renders the stored task graph as a Mermaid diagram, color-coded by
    /// execution duration in this session.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Reused (not executed)
    pub fn render_mermaid<O>(&self, store: &Store<O>) -> String {
        use std::fmt::Write;

        let times: HashMap<&TaskKey, Duration> = self
            .executed
            .iter()
            .map(|exec| (&exec.key, exec.duration))
            .collect();

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let (graph, _) = store.graph();
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for index in graph.node_indices() {
            let key = &graph[index];
            let name = key.to_string().replace('"', "\\\"");

            let (label, color) = match times.get(key) {
                Some(duration) => {
                    let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);

                    // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };

                    (format!("{duration:.2?}"), format!("#{r:02X}{g:02X}00"))
                }
                None => ("Reused".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in graph.edge_indices() {
            if let Some((source, target)) = graph.edge_endpoints(edge) {
                let _ = writeln!(f, "    {} --> {}", source.index(), target.index());
            }
        }

        f
    }
}
