//! Utility functions and helpers

pub mod certificates;
pub mod duration;

pub use duration::{format_duration, parse_duration, DurationError};

/// Escape regular expression metacharacters the way Go's `regexp.QuoteMeta`
/// does.
///
/// `regex::escape` also escapes `-`, `#`, `&` and `~`, which would change the
/// emitted header regexes for ordinary hostnames.
pub fn quote_meta(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 2);
    for c in input.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_meta_escapes_only_go_metacharacters() {
        assert_eq!(quote_meta(".example.com"), r"\.example\.com");
        assert_eq!(quote_meta("my-host.io"), r"my-host\.io");
        assert_eq!(quote_meta("a+b(c)"), r"a\+b\(c\)");
    }
}
