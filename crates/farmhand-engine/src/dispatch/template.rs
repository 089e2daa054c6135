//! Job script templates.
//!
//! A template is a shell script containing `$$NAME$$` placeholders. Rendering
//! is a single left-to-right pass: substituted values are never expanded
//! again, and tokens without a value are left as they are.
//!
//! The dispatcher escapes values for use inside double quotes
//! (`BENCH="$$BENCH$$"`); placeholders used outside of quotes are subject to
//! word splitting.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context as _;
use anyhow::Result;

/// The delimiter around placeholder names.
const DELIMITER: &str = "$$";

/// Determines if a string is a valid placeholder name.
fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Quotes a value for use inside double quotes in a shell script.
pub fn shell_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Renders a bash array assignment, one element per line.
///
/// An empty list renders as an empty string.
pub fn bash_array<I, S>(name: &str, values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| format!("{name}[{i}]=\"{v}\"\n", v = shell_escape(v.as_ref())))
        .collect()
}

/// Represents a loaded job script template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTemplate {
    /// The template source.
    source: String,
}

impl ScriptTemplate {
    /// Constructs a template from its source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Reads a template from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read job script template `{path}`",
                path = path.display()
            )
        })?;
        Ok(Self::new(source))
    }

    /// Gets the template source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the template with the given placeholder values.
    ///
    /// Keys are placeholder names without the surrounding `$$`.
    pub fn render(&self, values: &HashMap<&str, String>) -> String {
        let mut output = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find(DELIMITER) {
            output.push_str(&rest[..start]);
            let after = &rest[start + DELIMITER.len()..];

            let Some(end) = after.find(DELIMITER) else {
                output.push_str(DELIMITER);
                rest = after;
                continue;
            };

            let name = &after[..end];
            if !is_placeholder_name(name) {
                // Not a placeholder (for example the shell's `$$`)
                output.push_str(DELIMITER);
                rest = after;
                continue;
            }

            match values.get(name) {
                Some(value) => {
                    output.push_str(value);
                    rest = &after[end + DELIMITER.len()..];
                }
                None => {
                    output.push_str(DELIMITER);
                    output.push_str(name);
                    output.push_str(DELIMITER);
                    rest = &after[end + DELIMITER.len()..];
                }
            }
        }

        output.push_str(rest);
        output
    }
}
