use std::collections::HashMap;
use std::io::IsTerminal;

use chrono::SecondsFormat;
use otq_core::model::Record;
use otq_core::query::{
    ClusterInfo, DetectedRange, DocumentPage, FieldInfo, MetricSeries, OperationStats,
    PerspectiveCount,
};
use owo_colors::OwoColorize;

fn colour() -> bool {
    std::io::stdout().is_terminal()
}

pub fn level_label(level: &str) -> String {
    paint_level(level, colour())
}

fn paint_level(level: &str, colour: bool) -> String {
    let label = if level.is_empty() { "-" } else { level };
    if !colour {
        return label.to_string();
    }
    match label {
        "TRACE" => label.blue().to_string(),
        "DEBUG" => label.bright_black().to_string(),
        "INFO" => label.green().to_string(),
        "WARN" | "WARNING" => label.yellow().to_string(),
        "ERROR" => label.red().to_string(),
        "FATAL" | "CRITICAL" => label.magenta().to_string(),
        _ => label.to_string(),
    }
}

fn service_label(service: &str) -> String {
    let service = if service.is_empty() { "-" } else { service };
    if colour() {
        service.cyan().to_string()
    } else {
        service.to_string()
    }
}

pub fn print_record(record: &Record) {
    let ts = record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = format!(
        "{ts} {} {} | {}",
        service_label(&record.service_name),
        level_label(&record.level),
        record.display_message()
    );
    if let Some(trace_id) = &record.trace_id {
        line.push_str(&format!(" trace={trace_id}"));
    }
    let metrics = record.metrics_summary();
    if !metrics.is_empty() {
        line.push_str(&format!(" [{metrics}]"));
    }
    println!("{line}");
}

pub fn print_page(page: &DocumentPage, show_query: bool) {
    if show_query {
        println!("{}", page.query);
        println!();
    }
    // Newest arrive first; print oldest first like a log.
    for record in page.records.iter().rev() {
        print_record(record);
    }
    println!("-- {} of {} records --", page.records.len(), page.total);
}

pub fn print_trace(trace_id: &str, spans: &[Record]) {
    let errors = spans
        .iter()
        .filter(|s| s.status_code().is_some_and(|c| c.eq_ignore_ascii_case("error")))
        .count();
    println!("TRACE {trace_id} spans={} errors={errors}", spans.len());

    let known = spans
        .iter()
        .filter_map(|s| s.span_id.as_deref())
        .collect::<Vec<_>>();
    let mut children: HashMap<Option<&str>, Vec<&Record>> = HashMap::new();
    for span in spans {
        // Spans whose parent was not fetched are shown as roots.
        let parent = span
            .parent_span_id
            .as_deref()
            .filter(|p| !p.is_empty() && known.contains(p));
        children.entry(parent).or_default().push(span);
    }
    if let Some(roots) = children.get(&None) {
        for root in roots {
            print_span(root, &children, 0);
        }
    }
}

fn print_span(span: &Record, children: &HashMap<Option<&str>, Vec<&Record>>, depth: usize) {
    let indent = "  ".repeat(depth);
    let duration = span.format_duration();
    let status = span.status_code().unwrap_or_else(|| "Unset".to_string());
    println!(
        "{indent}{} {} ({}) {}",
        service_label(&span.service_name),
        span.name.as_deref().unwrap_or("-"),
        if duration.is_empty() { "-" } else { duration.as_str() },
        status
    );
    if let Some(kids) = span.span_id.as_deref().and_then(|id| children.get(&Some(id))) {
        for child in kids {
            print_span(child, children, depth + 1);
        }
    }
}

pub fn print_metrics(series: &[MetricSeries]) {
    let fmt = |v: Option<f64>| v.map(|v| format!("{v:.3}")).unwrap_or_else(|| "-".into());
    for s in series {
        println!(
            "{} {} latest={} min={} max={} points={}",
            s.field,
            s.stat,
            fmt(s.latest),
            fmt(s.min),
            fmt(s.max),
            s.points.len()
        );
    }
    println!("-- {} series --", series.len());
}

pub fn print_operations(ops: &[OperationStats]) {
    let ms = |v: Option<f64>| v.map(|v| format!("{v:.1}ms")).unwrap_or_else(|| "-".into());
    for op in ops {
        println!(
            "{} count={} avg={} p95={}",
            op.name,
            op.count,
            ms(op.avg_duration_ms),
            ms(op.p95_duration_ms)
        );
    }
    println!("-- {} operations --", ops.len());
}

pub fn print_perspective(counts: &[PerspectiveCount]) {
    let width = counts.iter().map(|c| c.value.len()).max().unwrap_or(0);
    for c in counts {
        println!("{:<width$}  {}", c.value, c.count);
    }
    println!("-- {} values --", counts.len());
}

pub fn print_fields(fields: &[FieldInfo]) {
    for f in fields {
        let mut flags = Vec::new();
        if f.aggregatable {
            flags.push("agg");
        }
        if f.time_series_dimension {
            flags.push("dimension");
        }
        let metric = f
            .time_series_metric
            .as_deref()
            .map(|m| format!(" metric={m}"))
            .unwrap_or_default();
        println!("{} type={} [{}]{metric}", f.name, f.ty, flags.join(","));
    }
    println!("-- {} fields --", fields.len());
}

pub fn print_detected(detected: &DetectedRange) {
    println!("lookback={} count={}", detected.lookback, detected.count);
}

pub fn print_cluster(info: &ClusterInfo) {
    println!(
        "cluster={} node={} version={}",
        info.cluster_name, info.name, info.version
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_colours() {
        assert_eq!(paint_level("ERROR", false), "ERROR");
        assert_eq!(paint_level("", false), "-");
        let red = paint_level("ERROR", true);
        assert!(red.starts_with("\u{1b}[31m") && red.contains("ERROR"));
        assert_eq!(paint_level("NOTICE", true), "NOTICE");
    }
}
