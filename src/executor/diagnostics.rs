use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::Instant;

use camino::Utf8Path;

use crate::executor::{ExecutionReport, TaskResult};
use crate::plan::ExecutionPlan;
use crate::task::TaskId;

/// Visual views of a finished run.
///
/// Pairs a report with the plan it was produced from; the plan supplies the
/// edges and descriptions, the report supplies timings and outcomes.
pub struct Diagnostics<'a, V> {
    plan: &'a ExecutionPlan,
    report: &'a ExecutionReport<V>,
}

impl<'a, V> Diagnostics<'a, V> {
    pub fn new(plan: &'a ExecutionPlan, report: &'a ExecutionReport<V>) -> Self {
        Self { plan, report }
    }

    /// Renders the task graph as a Mermaid diagram, one subgraph per level,
    /// color-coded by task duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Failed
    /// * **Blue**: No result
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for result in self.report.results() {
            let secs = result.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // All tasks took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        // Mermaid ids must be plain identifiers, task ids need not be.
        let mut nodes: HashMap<&TaskId, usize> = HashMap::new();

        for level in self.plan.levels() {
            writeln!(f, "    subgraph L{}[\"Level {}\"]", level.index(), level.index() + 1)?;

            for task in level.tasks() {
                let node = nodes.len();
                nodes.insert(&task.id, node);

                let name = task.id.as_str().replace('"', "#quot;");
                let (label_extra, color) = match self.report.result(&task.id) {
                    Some(result) if result.is_success() => {
                        let t = (result.duration.as_secs_f64() - min_time) / (max_time - min_time);
                        (format!("{:.2?}", result.duration), heat(t))
                    }
                    Some(result) => (format!("failed, {:.2?}", result.duration), "#D1D5DB".into()),
                    None => ("no result".into(), "#ADD8E6".into()),
                };

                writeln!(f, "        n{node}[\"{name}\\n{label_extra}\"]")?;
                writeln!(f, "        style n{node} fill:{color}")?;
            }

            writeln!(f, "    end")?;
        }

        for level in self.plan.levels() {
            for task in level.tasks() {
                for dependency in &task.depends_on {
                    if let (Some(source), Some(target)) = (nodes.get(dependency), nodes.get(&task.id))
                    {
                        writeln!(f, "    n{source} --> n{target}")?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Green (0.0) to yellow (0.5) to red (1.0).
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 30,
            label_width: 260,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, task_count: usize) -> u32 {
        self.header_height + (task_count as u32 * self.row_height) + self.padding
    }
}

struct TimelineStats {
    global_start: Instant,
    total_micros: f64,
}

impl TimelineStats {
    fn from_results<V>(results: &[&TaskResult<V>]) -> Option<Self> {
        let global_start = results.iter().map(|result| result.start).min()?;
        let global_end = results
            .iter()
            .map(|result| result.start + result.duration)
            .max()?;

        let total_micros = global_end.duration_since(global_start).as_micros().max(1) as f64;

        Some(Self {
            global_start,
            total_micros,
        })
    }

    fn format_duration(micros: f64) -> String {
        if micros < 1000.0 {
            format!("{micros:.0}µs")
        } else {
            format!("{:.2}ms", micros / 1000.0)
        }
    }
}

impl<V> Diagnostics<'_, V> {
    /// Renders the waterfall chart and writes it to `path`.
    pub fn render_waterfall_to_file(&self, path: impl AsRef<Utf8Path>) -> std::io::Result<()> {
        std::fs::write(path.as_ref(), self.render_waterfall())
    }

    /// Renders a waterfall chart of task start and end times as an SVG
    /// string. Each row is labelled with the task and the worker that ran it.
    pub fn render_waterfall(&self) -> String {
        let mut results: Vec<&TaskResult<V>> = self.report.results().collect();
        results.sort_by_key(|result| (result.start, result.level, result.slot));

        let Some(stats) = TimelineStats::from_results(&results) else {
            return render_empty_state();
        };
        let layout = WaterfallLayout::default();

        let mut svg = String::with_capacity(results.len() * 500);

        write_svg_header(&mut svg, &layout, results.len());
        write_grid(&mut svg, &layout, &stats);
        _ = write_tasks(&mut svg, &layout, &stats, &results);

        svg.push_str("</svg>");
        svg
    }
}

fn render_empty_state() -> String {
    r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg">
            <text x="10" y="30" font-family="sans-serif">No tasks ran</text>
        </svg>"#
        .to_string()
}

fn write_svg_header(buf: &mut String, layout: &WaterfallLayout, task_count: usize) {
    let w = layout.total_width();
    let h = layout.total_height(task_count);

    let css = r#"
        .task-row:nth-child(even) { fill: #f9f9f9; }
        .task-row:nth-child(odd) { fill: #ffffff; }
        text { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 12px; }
        .bar { fill: #3b82f6; rx: 4; }
        .bar:hover { fill: #2563eb; }
        .bar.failed { fill: #ef4444; }
        .label { fill: #333; }
        .time { fill: #666; font-size: 11px; }
        .grid-line { stroke: #e5e7eb; stroke-width: 1; }
        .axis-label { fill: #9ca3af; font-size: 10px; }"#;

    let _ = write!(
        buf,
        r#"<svg width="{w}" height="{h}" xmlns="http://www.w3.org/2000/svg"><style>{css}</style><rect width="100%" height="100%" fill="white" />"#,
    );
}

fn write_grid(buf: &mut String, layout: &WaterfallLayout, stats: &TimelineStats) {
    let steps = 5;
    for i in 0..=steps {
        let pct = i as f64 / steps as f64;
        let label = TimelineStats::format_duration(stats.total_micros * pct);

        let x = layout.label_width as f64 + layout.padding as f64 + (layout.chart_width as f64 * pct);

        let _ = write!(
            buf,
            r#"<line x1="{x:.1}" y1="{y1}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{y_text}" text-anchor="middle" class="axis-label">{label}</text>"#,
            y1 = layout.header_height,
            y_text = layout.header_height - 5,
        );
    }
}

fn write_tasks<V>(
    buf: &mut String,
    layout: &WaterfallLayout,
    stats: &TimelineStats,
    results: &[&TaskResult<V>],
) -> std::fmt::Result {
    for (i, result) in results.iter().enumerate() {
        let name = XmlSafe(result.task.as_str());

        let y_pos = layout.header_height + (i as u32 * layout.row_height);
        let y_center = y_pos + (layout.row_height / 2);

        write!(
            buf,
            r#"<rect x="0" y="{}" width="100%" height="{}" class="task-row" />"#,
            y_pos, layout.row_height
        )?;

        write!(
            buf,
            r#"<text x="{}" y="{}" class="label" dominant-baseline="middle">L{} {} ({})</text>"#,
            layout.padding, y_center, result.level, name, result.worker
        )?;

        let offset_micros = result.start.duration_since(stats.global_start).as_micros() as f64;
        let duration_micros = result.duration.as_micros() as f64;

        let bar_x = layout.label_width as f64
            + layout.padding as f64
            + (offset_micros / stats.total_micros * layout.chart_width as f64);

        let bar_w = (duration_micros / stats.total_micros * layout.chart_width as f64).max(1.0);
        let class = if result.is_success() { "bar" } else { "bar failed" };

        write!(
            buf,
            r#"<rect x="{x:.1}" y="{y}" width="{w:.1}" height="{h}" class="{class}"><title>{name}: {dur:.2?}</title></rect>"#,
            x = bar_x,
            y = y_pos + 5,
            w = bar_w,
            h = layout.row_height - 10,
            dur = result.duration
        )?;

        write!(
            buf,
            r#"<text x="{x:.1}" y="{y}" class="time" dominant-baseline="middle">{text}</text>"#,
            x = bar_x + bar_w + 5.0,
            y = y_center,
            text = TimelineStats::format_duration(duration_micros)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::error::TaskFailure;
    use crate::executor::{ResultStore, Worker};
    use crate::task::Task;

    fn run() -> (ExecutionPlan, ExecutionReport<i32>) {
        let plan = ExecutionPlan::from_tasks([
            Task::fetch("T1"),
            Task::fetch("T<2>"),
            Task::fetch("T3").depends_on_all(["T1", "T<2>"]),
        ])
        .unwrap();

        let start = Instant::now();
        let mut store = ResultStore::new();
        for (offset, (id, outcome)) in [
            ("T1", Ok(Arc::new(1))),
            ("T<2>", Err(TaskFailure::new("Error: no"))),
            ("T3", Ok(Arc::new(3))),
        ]
        .into_iter()
        .enumerate()
        {
            let id = TaskId::from(id);
            store.insert(TaskResult {
                level: plan.level_of(&id).unwrap(),
                task: id,
                outcome,
                slot: 0,
                worker: Worker::Pool(offset),
                start: start + Duration::from_millis(offset as u64 * 5),
                duration: Duration::from_millis(5 + offset as u64),
            });
        }

        let report =
            ExecutionReport::finalize(&plan, store, vec![], Duration::from_millis(20), 2);
        (plan, report)
    }

    #[test]
    fn test_mermaid_has_levels_and_edges() {
        let (plan, report) = run();
        let mermaid = Diagnostics::new(&plan, &report).render_mermaid();

        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("subgraph L0[\"Level 1\"]"));
        assert!(mermaid.contains("subgraph L1[\"Level 2\"]"));
        assert!(mermaid.contains("n0 --> n2"));
        assert!(mermaid.contains("n1 --> n2"));
        assert!(mermaid.contains("style n0 fill:#00FF00"));
        assert!(mermaid.contains("style n1 fill:#D1D5DB"));
        assert!(mermaid.contains("style n2 fill:#FF0000"));
    }

    #[test]
    fn test_waterfall_escapes_names() {
        let (plan, report) = run();
        let svg = Diagnostics::new(&plan, &report).render_waterfall();

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("T&lt;2&gt;"));
        assert!(!svg.contains("T<2>"));
        assert!(svg.contains("class=\"bar failed\""));
        assert!(svg.contains("(worker-2)"));
    }

    #[test]
    fn test_waterfall_empty() {
        let plan = ExecutionPlan::from_tasks(Vec::new()).unwrap();
        let report =
            ExecutionReport::<i32>::finalize(&plan, ResultStore::new(), vec![], Duration::ZERO, 1);
        let svg = Diagnostics::new(&plan, &report).render_waterfall();
        assert!(svg.contains("No tasks ran"));
    }
}
