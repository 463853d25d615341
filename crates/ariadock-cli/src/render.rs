//! Plain-text rendering of daemon responses.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRow {
    gid: String,
    status: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    download_speed: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TaskViewRows {
    #[serde(default)]
    active: Vec<TaskRow>,
    #[serde(default)]
    waiting: Vec<TaskRow>,
    #[serde(default)]
    stopped: Vec<TaskRow>,
}

/// Human-readable byte count, binary units.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn progress(completed: u64, total: u64) -> String {
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.1}%", completed as f64 * 100.0 / total as f64)
}

fn num(s: &str) -> u64 {
    s.parse().unwrap_or(0)
}

fn row_line(row: &TaskRow) -> String {
    let total = num(&row.total_length);
    let completed = num(&row.completed_length);
    let speed = num(&row.download_speed);
    let status = if row.archived {
        format!("{}*", row.status)
    } else {
        row.status.clone()
    };
    let mut line = format!(
        "{:<16}  {:<9}  {:>6}  {:>10}  {:>12}  {}",
        row.gid,
        status,
        progress(completed, total),
        human_bytes(total),
        if speed > 0 {
            format!("{}/s", human_bytes(speed))
        } else {
            "-".to_string()
        },
        row.name,
    );
    if let Some(err) = row.error_message.as_deref().filter(|e| !e.is_empty()) {
        line.push_str(&format!("  ({err})"));
    }
    line
}

/// Render the task view as one section per list. Returns `None` when the
/// payload does not look like a task view.
pub fn task_table(data: &serde_json::Value) -> Option<String> {
    let view: TaskViewRows = serde_json::from_value(data.clone()).ok()?;
    let mut out = String::new();
    for (title, rows) in [
        ("Active", &view.active),
        ("Waiting", &view.waiting),
        ("Stopped", &view.stopped),
    ] {
        out.push_str(&format!("{title} ({})\n", rows.len()));
        for row in rows {
            out.push_str("  ");
            out.push_str(&row_line(row));
            out.push('\n');
        }
    }
    Some(out)
}
