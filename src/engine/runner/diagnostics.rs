use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use console::Style;
use serde::Serialize;

use crate::core::Hash32;
use crate::engine::ResolvedGraph;
use crate::task::Task;

const ANSI_GREEN: Style = Style::new().green();
const ANSI_YELLOW: Style = Style::new().yellow();
const ANSI_BLUE: Style = Style::new().blue();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// Every task was either executed or already committed.
    Completed,
    /// The cancel token fired before every task could start.
    Cancelled,
}

/// One payload invocation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExecution {
    /// Tasks handed to the invocation. More than one only for sequence batches.
    pub tasks: Vec<Task>,
    /// Offset from the start of the dispatch.
    pub start: Duration,
    pub duration: Duration,
}

/// Outcome and performance metrics of a single dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub status: DispatchStatus,
    /// Tasks executed by this dispatch, in completion order.
    pub committed: Vec<Task>,
    /// Tasks which were committed before they could be claimed.
    pub skipped: Vec<Task>,
    /// Tasks never started because the dispatch was cancelled.
    pub abandoned: Vec<Task>,
    pub batches: Vec<BatchExecution>,
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub(crate) fn empty() -> Self {
        Self {
            status: DispatchStatus::Completed,
            committed: Vec::new(),
            skipped: Vec::new(),
            abandoned: Vec::new(),
            batches: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == DispatchStatus::Cancelled
    }

    /// Duration of the invocation which ran `task`, if any did.
    pub fn duration_of(&self, task: &Task) -> Option<Duration> {
        self.batches
            .iter()
            .find(|batch| batch.tasks.contains(task))
            .map(|batch| batch.duration)
    }

    /// A single human readable line.
    pub fn summary(&self) -> String {
        let mut text = format!(
            "Dispatched {} task(s) in {} batch(es), {} skipped",
            self.committed.len(),
            self.batches.len(),
            self.skipped.len(),
        );

        let elapsed = ANSI_BLUE.apply_to(format!("({:.2?})", self.elapsed));

        match self.status {
            DispatchStatus::Completed => format!("{} {}", ANSI_GREEN.apply_to(text), elapsed),
            DispatchStatus::Cancelled => {
                let _ = write!(text, ", cancelled with {} abandoned", self.abandoned.len());
                format!("{} {}", ANSI_YELLOW.apply_to(text), elapsed)
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the resolved graph as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Skipped, committed earlier
    /// * **Grey**: Not executed
    pub fn render_mermaid(&self, graph: &ResolvedGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times: HashMap<Hash32, Duration> = self
            .batches
            .iter()
            .flat_map(|batch| batch.tasks.iter().map(|task| (task.hash(), batch.duration)))
            .collect();

        let (min_time, max_time) = bounds(times.values());

        for index in graph.graph.node_indices() {
            let task = &graph.graph[index];
            let name = task.to_string().replace('"', "\\\"");

            let (label, color) = if let Some(duration) = times.get(&task.hash()) {
                let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
                (format!("{duration:.2?}"), heat(t))
            } else if self.skipped.contains(task) {
                ("Skipped".to_string(), "#ADD8E6".to_string())
            } else {
                ("Not executed".to_string(), "#D3D3D3".to_string())
            };

            let _ = writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for edge in graph.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            );
        }

        f
    }
}

/// Smallest and largest duration in seconds, never equal.
fn bounds<'a>(times: impl Iterator<Item = &'a Duration>) -> (f64, f64) {
    let mut min_time = f64::MAX;
    let mut max_time = f64::MIN;

    for secs in times.map(Duration::as_secs_f64) {
        min_time = min_time.min(secs);
        max_time = max_time.max(secs);
    }

    if min_time > max_time {
        min_time = 0.0;
        max_time = 0.0;
    }

    if (max_time - min_time).abs() < f64::EPSILON {
        max_time = min_time + 1.0;
    }

    (min_time, max_time)
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heat_scale() {
        assert_eq!(heat(0.0), "#00FF00");
        assert_eq!(heat(0.5), "#FFFF00");
        assert_eq!(heat(1.0), "#FF0000");
        assert_eq!(heat(7.0), "#FF0000");
    }

    #[test]
    fn test_bounds_never_collapse() {
        let none: [Duration; 0] = [];
        assert_eq!(bounds(none.iter()), (0.0, 1.0));

        let same = [Duration::from_secs(2), Duration::from_secs(2)];
        assert_eq!(bounds(same.iter()), (2.0, 3.0));
    }

    #[test]
    fn test_empty_report_summary() {
        let report = ExecutionReport::empty();
        assert!(report.summary().contains("Dispatched 0 task(s) in 0 batch(es), 0 skipped"));
        assert!(!report.is_cancelled());
    }
}
