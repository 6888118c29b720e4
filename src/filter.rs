//! Type-name filtering for recorded keys
//!
//! When the host application is large, reports drown in types the user does
//! not own. The filter restricts recording to concrete types whose names
//! match a comma-separated allowlist:
//!
//! - plain entries match as prefixes: `myapp::,othercrate::model`
//! - entries starting with `re:` compile as regular expressions:
//!   `re:^myapp::(api|core)::`
//!
//! An empty specification allows everything.

use anyhow::{bail, Result};
use regex::Regex;

#[derive(Debug, Clone)]
enum Rule {
    Prefix(String),
    Pattern(Regex),
}

/// Allowlist over concrete type names. Empty = allow all.
#[derive(Debug, Clone, Default)]
pub struct TypeNameFilter {
    rules: Vec<Rule>,
}

impl TypeNameFilter {
    /// A filter that accepts every type name.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse a comma-separated filter specification.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(pattern) = part.strip_prefix("re:") {
                if pattern.is_empty() {
                    bail!("empty regex entry in filter spec: {spec:?}");
                }
                match Regex::new(pattern) {
                    Ok(regex) => rules.push(Rule::Pattern(regex)),
                    Err(e) => bail!("invalid regex {pattern:?} in filter spec: {e}"),
                }
            } else {
                rules.push(Rule::Prefix(part.to_string()));
            }
        }
        Ok(TypeNameFilter { rules })
    }

    /// Whether recording is restricted at all.
    pub fn is_restrictive(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Whether `type_name` should be recorded.
    pub fn matches(&self, type_name: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        self.rules.iter().any(|rule| match rule {
            Rule::Prefix(prefix) => type_name.starts_with(prefix.as_str()),
            Rule::Pattern(regex) => regex.is_match(type_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_spec_allows_everything() {
        let filter = TypeNameFilter::from_spec("").unwrap();
        assert!(!filter.is_restrictive());
        assert!(filter.matches("anything::at::all"));
    }

    #[test]
    fn test_blank_entries_are_ignored() {
        let filter = TypeNameFilter::from_spec(" , ,").unwrap();
        assert!(!filter.is_restrictive());
    }

    #[test]
    fn test_prefix_matching() {
        let filter = TypeNameFilter::from_spec("myapp::,vendor::model").unwrap();
        assert!(filter.matches("myapp::api::Handler"));
        assert!(filter.matches("vendor::model::Row"));
        assert!(!filter.matches("vendor::util::Row"));
        assert!(!filter.matches("other::Thing"));
    }

    #[test]
    fn test_regex_matching() {
        let filter = TypeNameFilter::from_spec("re:^app::(core|api)::").unwrap();
        assert!(filter.matches("app::core::Store"));
        assert!(filter.matches("app::api::Request"));
        assert!(!filter.matches("app::web::Request"));
    }

    #[test]
    fn test_mixed_rules() {
        let filter = TypeNameFilter::from_spec("legacy::,re:Widget$").unwrap();
        assert!(filter.matches("legacy::Anything"));
        assert!(filter.matches("gui::button::Widget"));
        assert!(!filter.matches("gui::button::WidgetFactory"));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        assert!(TypeNameFilter::from_spec("re:([unclosed").is_err());
        assert!(TypeNameFilter::from_spec("re:").is_err());
    }
}
