//! Output formatting utilities for the CLI
//!
//! Tables for whitelists and key pairs, plus colored one-line status
//! messages.

use tabled::{settings::Style, Table, Tabled};

use dmsg_protocol::PubKey;

/// Format whitelisted keys as a table
///
/// Returns "Whitelist is empty" when there is nothing to show.
pub fn format_whitelist(keys: &[PubKey]) -> String {
    if keys.is_empty() {
        return "Whitelist is empty".to_string();
    }

    #[derive(Tabled)]
    struct KeyRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "PUBLIC KEY")]
        key: String,
    }

    let rows: Vec<KeyRow> = keys
        .iter()
        .enumerate()
        .map(|(i, pk)| KeyRow {
            index: i + 1,
            key: pk.to_hex(),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format the sections of a loaded configuration as a summary table
pub fn format_settings(settings: &[(&str, String)]) -> String {
    #[derive(Tabled)]
    struct SettingRow {
        #[tabled(rename = "SETTING")]
        name: String,
        #[tabled(rename = "VALUE")]
        value: String,
    }

    let rows: Vec<SettingRow> = settings
        .iter()
        .map(|(name, value)| SettingRow {
            name: name.to_string(),
            value: value.clone(),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_protocol::cipher::generate_keypair;

    #[test]
    fn test_format_empty_whitelist() {
        assert_eq!(format_whitelist(&[]), "Whitelist is empty");
    }

    #[test]
    fn test_format_whitelist_lists_every_key() {
        let keys: Vec<PubKey> = (0..3).map(|_| generate_keypair().0).collect();
        let table = format_whitelist(&keys);
        assert!(table.contains("PUBLIC KEY"));
        for pk in &keys {
            assert!(table.contains(&pk.to_hex()));
        }
    }

    #[test]
    fn test_format_settings() {
        let table = format_settings(&[("pty.port", "22".to_string())]);
        assert!(table.contains("pty.port"));
        assert!(table.contains("22"));
    }
}
