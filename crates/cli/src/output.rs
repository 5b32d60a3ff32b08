//! Terminal output for the CLI.
//!
//! Progress and summaries go to stdout in text mode; errors, warnings and
//! captured module output go to stderr. In json mode stdout carries exactly
//! one document and nothing else.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn from_json_flag(json: bool) -> Self {
    if json { OutputFormat::Json } else { OutputFormat::Text }
  }

  pub fn is_json(self) -> bool {
    self == OutputFormat::Json
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const CACHED: &str = "=";
}

/// Identifiers are shown by their first 12 hex digits.
pub fn truncate_hash(hash: &str) -> &str {
  hash.get(..12).unwrap_or(hash)
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

  if bytes < 1024 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

/// Durations are rounded to milliseconds, or to seconds past a minute.
pub fn format_duration(duration: Duration) -> String {
  let rounded = if duration.as_secs() >= 60 {
    Duration::from_secs(duration.as_secs())
  } else {
    Duration::from_millis(duration.as_millis() as u64)
  };
  humantime::format_duration(rounded).to_string()
}

pub fn print_success(message: &str) {
  println!("{} {message}", symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()));
}

pub fn print_info(message: &str) {
  println!("{} {message}", symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()));
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

/// An indented `label: value` line.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

/// One step line of a build summary.
pub fn print_step(id: &str, kind: &str, cached: bool, success: bool, duration: Duration) {
  let symbol = match (cached, success) {
    (true, _) => symbols::CACHED.if_supports_color(Stream::Stdout, |s| s.dimmed()).to_string(),
    (false, true) => symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
    (false, false) => symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
  };
  let detail = match (cached, success) {
    (true, _) => "cached".to_string(),
    (false, true) => format_duration(duration),
    (false, false) => "failed".to_string(),
  };
  println!(
    "    {symbol} {} {kind} {}",
    truncate_hash(id).if_supports_color(Stream::Stdout, |s| s.dimmed()),
    format!("({detail})").if_supports_color(Stream::Stdout, |s| s.dimmed())
  );
}

/// Indent captured module output under a failure message.
pub fn print_captured(label: &str, text: &str) {
  let text = text.trim_end();
  if text.is_empty() {
    return;
  }
  eprintln!("  {}:", label.if_supports_color(Stream::Stderr, |s| s.dimmed()));
  for line in text.lines() {
    eprintln!("    {line}");
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}
