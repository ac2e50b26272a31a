//! Output formatting utilities

use console::{style, Style};

use signet_signing::SignCompletionResult;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// Print the captured tool output and error text of a finished operation.
///
/// Error text always goes to stderr, even with `quiet`.
pub fn completion(result: &SignCompletionResult, quiet: bool) {
    if !quiet {
        for line in result.output.lines() {
            println!("  {}", style(line).dim());
        }
    }
    for line in result.error.lines() {
        error(line);
    }
}
