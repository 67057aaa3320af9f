use std::sync::OnceLock;

use owo_colors::OwoColorize as _;
use regex::Regex;

fn ansi_regex() -> &'static Regex {
  static ANSI_RE: OnceLock<Regex> = OnceLock::new();
  ANSI_RE.get_or_init(|| {
    Regex::new(
      r"(?x)
      \x1B\[[0-?]*[ -/]*[@-~]    # CSI sequence
      |                            # or
      \x1B\][^\x07\x1B]*(?:\x07|\x1B\\)  # OSC sequence terminated by BEL or ST
    ",
    )
    .expect("valid ANSI regex")
  })
}

#[must_use]
pub fn strip_ansi_control_codes(input: &str) -> String {
  ansi_regex().replace_all(input, "").into_owned()
}

fn visible_len(s: &str) -> usize {
  strip_ansi_control_codes(s).chars().count()
}

/// Render rows as aligned columns. Widths come from the visible length of
/// headers and cells, so tinted cells line up with plain ones.
#[must_use]
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
  let cols = headers.len();
  let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
  for row in rows {
    for (i, cell) in row.iter().enumerate().take(cols) {
      widths[i] = widths[i].max(visible_len(cell));
    }
  }

  let pad = |i: usize, len: usize| " ".repeat(widths[i].saturating_sub(len) + 1);
  let mut lines = Vec::with_capacity(rows.len() + 1);

  let mut header_line = String::new();
  for (i, text) in headers.iter().enumerate() {
    header_line.push_str(text);
    if i + 1 < cols {
      header_line.push_str(&pad(i, text.len()));
    }
  }
  lines.push(format!("{}", header_line.dimmed()));

  for row in rows {
    let mut line = String::new();
    for (i, cell) in row.iter().enumerate().take(cols) {
      line.push_str(cell);
      if i + 1 < cols {
        line.push_str(&pad(i, visible_len(cell)));
      }
    }
    lines.push(line);
  }
  lines
}

/// Print a simple table through the shared logger.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
  for line in render_table(headers, rows) {
    crate::log_info!("{}", line);
  }
}

/// Fixed-width usage bar, e.g. `[#####-----] 50%`.
#[must_use]
pub fn usage_bar(ratio: f64, width: usize) -> String {
  let ratio = if ratio.is_finite() { ratio.max(0.0) } else { 0.0 };
  #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
  let filled = ((ratio.min(1.0) * width as f64).round() as usize).min(width);
  let bar = format!(
    "[{}{}] {:>3.0}%",
    "#".repeat(filled),
    "-".repeat(width - filled),
    ratio * 100.0
  );
  if ratio >= 1.0 {
    format!("{}", bar.red())
  } else if ratio >= 0.8 {
    format!("{}", bar.yellow())
  } else {
    bar
  }
}
