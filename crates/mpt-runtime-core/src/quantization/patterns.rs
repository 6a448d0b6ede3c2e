//! Tensor name patterns for quantizer include/exclude lists.
//!
//! A pattern is matched against the whole name. `*` and `.*` match any run
//! of characters (including none); everything else is literal.

/// A whole-name wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    source: String,
    /// Literal pieces between wildcards.
    parts: Vec<String>,
    leading_wildcard: bool,
    trailing_wildcard: bool,
}

impl NamePattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Self {
        let normalized = pattern.replace(".*", "*");
        let parts = normalized
            .split('*')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            source: pattern.to_string(),
            parts,
            leading_wildcard: normalized.starts_with('*'),
            trailing_wildcard: normalized.ends_with('*'),
        }
    }

    /// Whether `name` matches the whole pattern.
    pub fn matches(&self, name: &str) -> bool {
        if self.parts.is_empty() {
            return self.leading_wildcard || name.is_empty();
        }

        let mut rest = name;
        let last = self.parts.len() - 1;
        for (i, part) in self.parts.iter().enumerate() {
            if i == 0 && !self.leading_wildcard {
                match rest.strip_prefix(part.as_str()) {
                    Some(tail) => rest = tail,
                    None => return false,
                }
                if i == last && !self.trailing_wildcard {
                    return rest.is_empty();
                }
                continue;
            }
            if i == last && !self.trailing_wildcard {
                return rest.ends_with(part.as_str());
            }
            // leftmost occurrence keeps the most room for later parts
            match rest.find(part.as_str()) {
                Some(at) => rest = &rest[at + part.len()..],
                None => return false,
            }
        }
        true
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl From<&str> for NamePattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

/// True when any pattern in `patterns` matches `name`.
pub fn any_match(patterns: &[NamePattern], name: &str) -> bool {
    patterns.iter().any(|p| p.matches(name))
}
