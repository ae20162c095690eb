//! Shell-word escaping for generated commands.
//!
//! The lowered commands run under `/bin/sh`-compatible shells from arbitrary
//! working directories, so every path and argument that reaches a command
//! line goes through these helpers.

/// Characters that never need quoting in a POSIX shell word.
fn is_safe_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || matches!(c, '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '_' | '-')
}

/// Quote a single word for a POSIX shell.
///
/// Empty strings become `''` so they survive joining into a command line.
pub fn escape(arg: &str) -> String {
  if arg.is_empty() {
    return "''".to_string();
  }
  if arg.chars().all(is_safe_char) {
    return arg.to_string();
  }
  format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join an argument vector into a single shell command line, quoting each
/// argument.
pub fn join_args(args: &[String]) -> String {
  args.iter().map(|arg| escape(arg)).collect::<Vec<_>>().join(" ")
}

/// Escape text for embedding inside a double-quoted shell string.
///
/// Backslash, dollar, backtick, double quote and newline take a backslash
/// escape; single quotes use the `'"'"'` form so the result also survives an
/// enclosing single-quoted `bash -c` argument. Newlines come out as the
/// two-character sequence `\n`; the emitting command pipes through `sed` to
/// restore them.
pub fn escape_for_double_quotes(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '\\' => out.push_str(r"\\"),
      '$' => out.push_str(r"\$"),
      '`' => out.push_str(r"\`"),
      '"' => out.push_str("\\\""),
      '\n' => out.push_str(r"\n"),
      '\'' => out.push_str(r#"'"'"'"#),
      _ => out.push(c),
    }
  }
  out
}
