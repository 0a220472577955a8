//! `.mpdignore` handling.
//!
//! Each line of an ignore file is a shell glob matched against entry names
//! of the directory holding it and of every directory below.

use lark_storage::StorageBackend;
use regex::{Regex, escape as regex_escape};
use std::path::Path;

pub const IGNORE_FILE: &str = ".mpdignore";

#[derive(Debug, Clone, Default)]
pub struct ExcludeList {
    patterns: Vec<Regex>,
}

impl ExcludeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Add every pattern from the contents of an ignore file. Invalid
    /// patterns are logged and skipped.
    pub fn parse(&mut self, contents: &str) {
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Regex::new(&glob_to_regex(line)) {
                Ok(pattern) => self.patterns.push(pattern),
                Err(err) => tracing::warn!(pattern = line, error = %err, "Invalid ignore pattern"),
            }
        }
    }

    /// Add the patterns from the ignore file in `directory`, if there is one.
    pub async fn load(&mut self, storage: &dyn StorageBackend, directory: &Path) {
        let path = directory.join(IGNORE_FILE);
        match storage.read(&path).await {
            Ok(data) => self.parse(&String::from_utf8_lossy(&data)),
            Err(err) if err.is_not_found() => {},
            Err(err) => tracing::warn!(path = %path.display(), error = ?err, "Failed to read ignore file"),
        }
    }

    /// Whether an entry called `name` is excluded.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(name))
    }
}

/// Translate an fnmatch-style glob into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => regex.push_str(&regex_escape(&escaped.to_string())),
                None => regex.push_str(r"\\"),
            },
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if matches!(chars.peek(), Some('!' | '^')) {
                    chars.next();
                    class.push('^');
                }
                // A `]` right after the opening bracket is literal.
                if chars.peek() == Some(&']') {
                    chars.next();
                    class.push_str(r"\]");
                }
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        },
                        '\\' | '[' | '&' | '~' => {
                            class.push('\\');
                            class.push(c);
                        },
                        _ => class.push(c),
                    }
                }
                if closed {
                    regex.push('[');
                    regex.push_str(&class);
                    regex.push(']');
                } else {
                    // Unterminated: match the text literally.
                    regex.push_str(r"\[");
                    regex.push_str(&regex_escape(&class));
                }
            },
            _ => regex.push_str(&regex_escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex
}
