//! Parsing of `MONITOR` feed lines.
//!
//! While the connection is in monitor mode the server pushes one status
//! line per executed command, shaped like:
//!
//! ```text
//! 1470823600.420180 [0 127.0.0.1:59404] "SET" "foo" "bar"
//! ```
//!
//! Anything that does not match this shape (notably the `+OK` reply to the
//! `MONITOR` command itself) is handed back to the normal dispatcher.

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorLine {
    /// Unix timestamp with fractional seconds, kept as text.
    pub timestamp: String,
    /// The executed command and its arguments, unescaped.
    pub args: Vec<String>,
    /// The raw line as received.
    pub raw: String,
}

/// Try to interpret a status reply as a monitor feed line.
pub fn parse_monitor_line(line: &str) -> Option<MonitorLine> {
    let (timestamp, rest) = line.split_once(' ')?;
    if !is_timestamp(timestamp) {
        return None;
    }

    // [db addr] section
    let rest = rest.strip_prefix('[')?;
    let (_, rest) = rest.split_once("] ")?;

    let args = parse_quoted_args(rest)?;
    if args.is_empty() {
        return None;
    }

    Some(MonitorLine {
        timestamp: timestamp.to_string(),
        args,
        raw: line.to_string(),
    })
}

/// `<10-11 digits>.<digits>`
fn is_timestamp(s: &str) -> bool {
    let Some((secs, frac)) = s.split_once('.') else {
        return false;
    };
    (10..=11).contains(&secs.len())
        && !frac.is_empty()
        && secs.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}

/// Space-separated `"…"` tokens with backslash escapes inside.
fn parse_quoted_args(mut rest: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            return Some(args);
        }
        rest = rest.strip_prefix('"')?;

        let mut arg = String::new();
        let mut chars = rest.char_indices();
        let end = loop {
            let (idx, ch) = chars.next()?;
            match ch {
                '\\' => {
                    let (_, escaped) = chars.next()?;
                    arg.push(escaped);
                }
                '"' => break idx,
                other => arg.push(other),
            }
        };
        args.push(arg);
        rest = &rest[end + 1..];
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_line() {
        let line = r#"1470823600.420180 [0 127.0.0.1:59404] "SET" "foo" "bar""#;
        let parsed = parse_monitor_line(line).unwrap();
        assert_eq!(parsed.timestamp, "1470823600.420180");
        assert_eq!(parsed.args, vec!["SET", "foo", "bar"]);
        assert_eq!(parsed.raw, line);
    }

    #[test]
    fn parses_single_arg() {
        let line = r#"1470823600.1 [3 [::1]:6379] "PING""#;
        let parsed = parse_monitor_line(line).unwrap();
        assert_eq!(parsed.args, vec!["PING"]);
    }

    #[test]
    fn unescapes_embedded_quotes() {
        let line = r#"1470823600.420180 [0 127.0.0.1:59404] "SET" "k" "va\"lue""#;
        let parsed = parse_monitor_line(line).unwrap();
        assert_eq!(parsed.args[2], "va\"lue");
    }

    #[test]
    fn rejects_plain_ok() {
        assert!(parse_monitor_line("OK").is_none());
    }

    #[test]
    fn rejects_missing_bracket_section() {
        assert!(parse_monitor_line(r#"1470823600.420180 "SET" "foo""#).is_none());
    }

    #[test]
    fn rejects_short_timestamp() {
        assert!(parse_monitor_line(r#"12345.6 [0 x] "PING""#).is_none());
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(parse_monitor_line(r#"1470823600.420180 [0 x] "SET"#).is_none());
    }
}
