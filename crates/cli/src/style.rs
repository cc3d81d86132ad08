//! Terminal styling for status lines.

use console::Style;

/// Success line (green check).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Failure line (red cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Warning line (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Dimmed hint.
pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}
