//! Rendering results for the terminal.

use std::fmt::Write as _;

use serde_json::Value;

use crate::builder::RequestEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Human,
    Quiet,
}

/// Render a projected result. `Quiet` renders nothing.
#[must_use]
pub fn render(value: &Value, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(value).unwrap_or_default(),
        OutputFormat::Human => render_human(value),
        OutputFormat::Quiet => String::new(),
    }
}

/// What a dry run would have sent.
#[must_use]
pub fn render_dry_run(envelope: &RequestEnvelope, format: OutputFormat) -> String {
    match format {
        OutputFormat::Quiet => String::new(),
        OutputFormat::Json => serde_json::to_string_pretty(envelope).unwrap_or_default(),
        OutputFormat::Human => format!(
            "What if: would call {} with\n{}",
            envelope.operation,
            serde_json::to_string_pretty(&envelope.payload).unwrap_or_default()
        ),
    }
}

fn render_human(v: &Value) -> String {
    let mut out = String::new();
    match v {
        Value::Null => {}
        Value::Object(map) => {
            let (tables, scalars): (Vec<_>, Vec<_>) =
                map.iter().partition(|(_, val)| is_record_list(val));
            let width = scalars.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
            for (k, val) in &scalars {
                let _ = writeln!(out, "{k:width$}: {}", cell_text(val));
            }
            for (k, val) in tables {
                if !out.is_empty() {
                    out.push('\n');
                }
                let _ = writeln!(out, "{k}:");
                if let Value::Array(items) = val {
                    write_table(&mut out, items);
                }
            }
        }
        Value::Array(items) if items.is_empty() => {}
        Value::Array(items) if is_record_list(v) => write_table(&mut out, items),
        Value::Array(items) => {
            for item in items {
                let _ = writeln!(out, "{}", cell_text(item));
            }
        }
        other => {
            let _ = writeln!(out, "{}", cell_text(other));
        }
    }
    out
}

fn is_record_list(v: &Value) -> bool {
    matches!(v, Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object))
}

fn write_table(out: &mut String, items: &[Value]) {
    let mut columns: Vec<&str> = Vec::new();
    for item in items {
        if let Value::Object(map) = item {
            for k in map.keys() {
                if !columns.contains(&k.as_str()) {
                    columns.push(k);
                }
            }
        }
    }
    let headers: Vec<String> = columns.iter().map(|c| humanize(c)).collect();
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            columns
                .iter()
                .map(|c| item.get(*c).map(cell_text).unwrap_or_default())
                .collect()
        })
        .collect();
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .map(|r| r[i].len())
                .chain(std::iter::once(h.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:w$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let _ = writeln!(out, "{}", line(&headers));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(out, "{}", line(&rule));
    for row in &rows {
        let _ = writeln!(out, "{}", line(row));
    }
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => v.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// `computeNodeGroupId` -> `Compute Node Group Id`
fn humanize(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in key.chars() {
        if c == '_' || c == '-' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
        .into_iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
