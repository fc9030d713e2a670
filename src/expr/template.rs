//! `${name}` command templates
//!
//! Templates are split once into literal text and named slots. Rendering asks
//! a resolver for each slot; values are inserted verbatim, so callers quote
//! paths with [`shell_quote`] before handing them over.

use super::ExprError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot(String),
}

/// Parsed command template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("${") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find('}').ok_or_else(|| ExprError::Template {
                template: source.to_string(),
                reason: "unterminated '${'".to_string(),
            })?;
            let name = &after[..close];
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ExprError::Template {
                    template: source.to_string(),
                    reason: format!("invalid placeholder name '{}'", name),
                });
            }
            segments.push(Segment::Slot(name.to_string()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Slot names in order of appearance (duplicates included)
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Slot(name) => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    pub fn references(&self, name: &str) -> bool {
        self.slots().any(|slot| slot == name)
    }

    /// Substitute every slot through `resolve`.
    ///
    /// Fails with the first slot name the resolver does not know.
    pub fn render<F>(&self, mut resolve: F) -> Result<String, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Slot(name) => match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }
}

/// Single-quote a value for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
