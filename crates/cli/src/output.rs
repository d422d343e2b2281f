//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use tabled::{builder::Builder, settings::Style};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Render a table whose columns are only known at runtime
pub fn render_rows(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut builder = Builder::default();
    builder.push_record(columns.iter().cloned());
    for row in rows {
        builder.push_record(row.iter().cloned());
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "ready" => status.green().to_string(),
        "degraded" => status.yellow().to_string(),
        "unhealthy" | "not ready" => status.red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_rows_includes_header_and_cells() {
        let columns = vec!["namespace".to_string(), "total_cost".to_string()];
        let rows = vec![
            vec!["shop".to_string(), "3.46".to_string()],
            vec!["billing".to_string(), "0".to_string()],
        ];

        let table = render_rows(&columns, &rows);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[1].contains("namespace") && lines[1].contains("total_cost"));
        assert!(table.contains("shop") && table.contains("3.46"));
        assert!(table.contains("billing"));
        assert!(table.starts_with('╭'));
    }

    #[test]
    fn test_color_status_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(color_status("degraded"), "degraded");
        assert_eq!(color_status("unknown"), "unknown");
    }
}
