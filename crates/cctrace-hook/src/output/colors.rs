//! Color helpers for terminal output

use colored::Colorize;

/// Get colored header
pub fn header(text: &str) -> String {
    text.bold().underline().to_string()
}

/// Get colored label
pub fn label(text: &str) -> String {
    text.white().dimmed().to_string()
}

/// Get colored value
pub fn value(text: &str) -> String {
    text.white().to_string()
}

/// Get colored success message
pub fn success(text: &str) -> String {
    format!("{} {}", "✓".green(), text)
}

/// Get colored warning message
pub fn warning(text: &str) -> String {
    format!("{} {}", "⚠".yellow(), text)
}

/// Get colored error message
pub fn error(text: &str) -> String {
    format!("{} {}", "✗".red(), text)
}

/// Get colored tool name
pub fn colored_tool(name: &str) -> String {
    name.bright_white().to_string()
}

/// Color a buffered event by phase
pub fn colored_phase(phase: &str) -> String {
    match phase {
        "before" => phase.yellow().to_string(),
        "after" => phase.cyan().to_string(),
        _ => phase.white().to_string(),
    }
}

/// Format size in human-readable form
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.1} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp as "Jan 25, 14:30:02"
pub fn format_date(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%b %d, %H:%M:%S").to_string()
}
