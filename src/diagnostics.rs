use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Timing of one task that finished within a join.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    /// Registration index within the batch.
    pub index: usize,
    /// Trace label, present only for traced sessions.
    pub label: Option<Arc<str>>,
    pub start: Instant,
    pub duration: Duration,
}

impl TaskExecution {
    fn name(&self) -> String {
        match &self.label {
            Some(label) => label.to_string(),
            None => format!("task #{}", self.index),
        }
    }
}

/// Execution metrics of a successfully joined batch, ordered by registration.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub session: Arc<str>,
    pub executions: Vec<TaskExecution>,
}

#[derive(Serialize)]
struct Report<'a> {
    session: &'a str,
    wall_us: u128,
    tasks: Vec<ReportTask>,
}

#[derive(Serialize)]
struct ReportTask {
    index: usize,
    name: String,
    offset_us: u128,
    duration_us: u128,
}

impl Diagnostics {
    fn first_start(&self) -> Option<Instant> {
        self.executions.iter().map(|exec| exec.start).min()
    }

    /// Time from the first task starting to the last one finishing.
    pub fn wall_time(&self) -> Duration {
        let Some(start) = self.first_start() else {
            return Duration::ZERO;
        };

        self.executions
            .iter()
            .map(|exec| (exec.start + exec.duration).duration_since(start))
            .max()
            .unwrap_or_default()
    }

    /// Sum of all task durations; compared with [`wall_time`](Self::wall_time)
    /// this shows how much the fan-out saved.
    pub fn busy_time(&self) -> Duration {
        self.executions.iter().map(|exec| exec.duration).sum()
    }

    /// Renders a plain-text table of the batch, one task per line.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let start = self.first_start();

        let _ = writeln!(
            out,
            "{} tasks, wall {}, busy {}",
            self.executions.len(),
            format_duration(self.wall_time()),
            format_duration(self.busy_time())
        );

        for exec in &self.executions {
            let offset = start
                .map(|start| exec.start.duration_since(start))
                .unwrap_or_default();

            let _ = writeln!(
                out,
                "  {:>3}  +{:>10}  {:>10}  {}",
                exec.index,
                format_duration(offset),
                format_duration(exec.duration),
                exec.name()
            );
        }

        out
    }

    /// Renders the batch as an SVG timeline, one row per task.
    pub fn render_waterfall(&self) -> String {
        let Some(global_start) = self.first_start() else {
            return "<svg width=\"200\" height=\"50\" xmlns=\"http://www.w3.org/2000/svg\"><text x=\"10\" y=\"30\" font-family=\"sans-serif\">No tasks ran</text></svg>".to_string();
        };

        let total_micros = self.wall_time().as_micros().max(1) as f64;

        let row_height = 30;
        let label_width = 300;
        let chart_width = 800;
        let padding = 10;
        let header_height = 30;
        let text_space = 80;

        let width = label_width + chart_width + (padding * 3) + text_space;
        let height = header_height + (self.executions.len() as u32 * row_height) + padding;

        let mut out = String::new();
        let _ = write!(
            out,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <style>
        text {{ font-family: sans-serif; font-size: 12px; }}
        .bar {{ fill: #3b82f6; rx: 4; }}
        .label {{ fill: #333; }}
        .time {{ fill: #666; font-size: 11px; }}
        .grid-line {{ stroke: #e5e7eb; stroke-width: 1; }}
    </style>
    <rect width="100%" height="100%" fill="white" />
"#
        );

        for i in 0..=5 {
            let pct = i as f64 / 5.0;
            let x = (label_width + padding) as f64 + chart_width as f64 * pct;
            let _ = writeln!(
                out,
                r#"    <line x1="{x}" y1="{header_height}" x2="{x}" y2="{height}" class="grid-line" />
    <text x="{x}" y="{y}" text-anchor="middle" class="time">{text}</text>"#,
                y = header_height - 5,
                text = format_micros(total_micros * pct),
            );
        }

        for (row, exec) in self.executions.iter().enumerate() {
            let y = header_height + row as u32 * row_height;
            let offset = exec.start.duration_since(global_start).as_micros() as f64;
            let duration = exec.duration.as_micros() as f64;

            let bar_x = (label_width + padding) as f64 + offset / total_micros * chart_width as f64;
            let bar_width = (duration / total_micros * chart_width as f64).max(1.0);

            let _ = writeln!(
                out,
                r#"    <text x="{padding}" y="{ty}" class="label" dominant-baseline="middle">{name}</text>
    <rect x="{bar_x}" y="{by}" width="{bar_width}" height="{bh}" class="bar"><title>{name}: {dur:.2?}</title></rect>
    <text x="{lx}" y="{ty}" class="time" dominant-baseline="middle">{text}</text>"#,
                ty = y + row_height / 2,
                by = y + 5,
                bh = row_height - 10,
                name = escape_xml(&exec.name()),
                dur = exec.duration,
                lx = bar_x + bar_width + 5.0,
                text = format_micros(duration),
            );
        }

        out.push_str("</svg>");
        out
    }

    /// Serializes the batch timings, with offsets and durations in
    /// microseconds.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let start = self.first_start();
        let report = Report {
            session: &self.session,
            wall_us: self.wall_time().as_micros(),
            tasks: self
                .executions
                .iter()
                .map(|exec| ReportTask {
                    index: exec.index,
                    name: exec.name(),
                    offset_us: start
                        .map(|start| exec.start.duration_since(start).as_micros())
                        .unwrap_or_default(),
                    duration_us: exec.duration.as_micros(),
                })
                .collect(),
        };

        serde_json::to_string(&report)
    }
}

fn format_duration(duration: Duration) -> String {
    format_micros(duration.as_micros() as f64)
}

fn format_micros(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Diagnostics {
        let start = Instant::now();
        Diagnostics {
            session: "dash.rs:3@1".into(),
            executions: vec![
                TaskExecution {
                    index: 0,
                    label: Some("users<all>".into()),
                    start,
                    duration: Duration::from_millis(100),
                },
                TaskExecution {
                    index: 1,
                    label: None,
                    start: start + Duration::from_millis(10),
                    duration: Duration::from_millis(150),
                },
            ],
        }
    }

    #[test]
    fn test_wall_and_busy_time() {
        let diagnostics = sample();

        assert_eq!(diagnostics.wall_time(), Duration::from_millis(160));
        assert_eq!(diagnostics.busy_time(), Duration::from_millis(250));
    }

    #[test]
    fn test_summary_lists_tasks() {
        let summary = sample().render_summary();

        assert!(summary.starts_with("2 tasks, wall 160.00ms, busy 250.00ms"));
        assert!(summary.contains("users<all>"));
        assert!(summary.contains("task #1"));
    }

    #[test]
    fn test_waterfall_escapes_labels() {
        let svg = sample().render_waterfall();

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("users&lt;all&gt;"));
    }

    #[test]
    fn test_empty_waterfall() {
        let diagnostics = Diagnostics {
            session: "s".into(),
            executions: vec![],
        };

        assert!(diagnostics.render_waterfall().contains("No tasks ran"));
        assert_eq!(diagnostics.wall_time(), Duration::ZERO);
    }

    #[test]
    fn test_json_report() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();

        assert_eq!(json["session"], "dash.rs:3@1");
        assert_eq!(json["wall_us"], 160_000);
        assert_eq!(json["tasks"][1]["offset_us"], 10_000);
        assert_eq!(json["tasks"][1]["name"], "task #1");
    }
}
