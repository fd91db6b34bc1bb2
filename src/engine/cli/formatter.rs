//! CLI Output Formatting Module
//! Provides consistent, colorized output for terminal UX

use colored::{ColoredString, Colorize};

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        eprintln!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print an info message
    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print a table header over fixed-width columns
    pub fn table_header(columns: &[(&str, usize)]) {
        let header = columns
            .iter()
            .map(|(name, width)| format!("{:<width$}", name, width = width))
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {}", header.bright_white().bold());
        println!("  {}", "─".repeat(header.chars().count()).bright_black());
    }

    /// Print a table row; widths as for `table_header`
    pub fn table_row(values: &[(String, usize)]) {
        let row = values
            .iter()
            .map(|(value, width)| pad(value, *width))
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {}", row);
    }

    /// Print a divider
    pub fn divider() {
        println!("{}", "─".repeat(60).bright_black());
    }

    /// Print an empty line
    pub fn blank() {
        println!();
    }
}

/// Left-align to `width` display characters
fn pad(value: &str, width: usize) -> String {
    let len = value.chars().count();
    if len >= width {
        value.to_string()
    } else {
        format!("{}{}", value, " ".repeat(width - len))
    }
}

/// Color a device status label by severity
pub fn colorize_status(status: &str, label: &str) -> ColoredString {
    match status {
        "confirmed" | "stable" | "idle" => label.green(),
        "downloading" | "update_available" | "verifying_signature" | "self_test_running" | "rebooting" => {
            label.yellow()
        }
        "rejected" | "signature_failed" | "download_failed" | "rolled_back" => label.red().bold(),
        _ => label.bright_black(),
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Format duration in human-readable format
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500.00 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3661), "1h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }

    #[test]
    fn test_pad_counts_chars() {
        assert_eq!(pad("⟲ rolled back", 15), "⟲ rolled back  ");
        assert_eq!(pad("long-value", 4), "long-value");
    }
}
