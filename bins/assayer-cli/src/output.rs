//! Output formatting for CLI commands

use anyhow::Result;
use serde::Serialize;
use tabled::builder::Builder;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows either as a table or as pretty JSON.
pub fn print_output<T: Serialize + Tabled>(data: Vec<T>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("No results");
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&data)?),
    }
    Ok(())
}

/// Render a header row plus body rows whose width is only known at runtime.
pub fn render_grid(header: Vec<String>, body: Vec<Vec<String>>) -> String {
    let mut records = Vec::with_capacity(body.len() + 1);
    records.push(header);
    records.extend(body);
    Builder::from(records).build().to_string()
}

pub fn print_section(title: &str) {
    println!();
    println!("→ {}", title);
}

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_warning(message: &str) {
    println!("⚠ {}", message);
}

/// One decimal, or a dash for a missing value.
pub fn fmt_score(value: Option<f64>) -> String {
    value.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string())
}
