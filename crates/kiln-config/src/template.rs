//! Template interpolation for synthesized Dockerfiles.
//!
//! Supports:
//! - `${NAME}` - value of `NAME`, left untouched when unset
//! - `${NAME:default}` - value of `NAME`, or `default` when unset or empty

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// Regex for matching ${NAME} and ${NAME:default}
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").unwrap()
});

/// A parameterized text template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Names of every variable the template references.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = VAR_REGEX
            .captures_iter(&self.source)
            .map(|caps| caps[1].to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Render against a variable map.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        VAR_REGEX
            .replace_all(&self.source, |caps: &regex::Captures| {
                let name = &caps[1];
                let value = vars.get(name).filter(|v| !v.is_empty());
                match (value, caps.get(2)) {
                    (Some(v), _) => v.clone(),
                    (None, Some(default)) => default.as_str().to_string(),
                    (None, None) => caps[0].to_string(),
                }
            })
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_interpolation() {
        let t = Template::new("FROM sdk:${SDK_VERSION}\nRUN ${RESTORE}");
        let out = t.render(&vars(&[("SDK_VERSION", "8.0"), ("RESTORE", "dotnet restore")]));
        assert_eq!(out, "FROM sdk:8.0\nRUN dotnet restore");
    }

    #[test]
    fn test_default_used_when_unset_or_empty() {
        let t = Template::new("FROM sdk:${SDK_VERSION:6.0}");
        assert_eq!(t.render(&HashMap::new()), "FROM sdk:6.0");
        assert_eq!(t.render(&vars(&[("SDK_VERSION", "")])), "FROM sdk:6.0");
        assert_eq!(t.render(&vars(&[("SDK_VERSION", "7.0")])), "FROM sdk:7.0");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let t = Template::new("echo ${UNKNOWN}");
        assert_eq!(t.render(&HashMap::new()), "echo ${UNKNOWN}");
    }

    #[test]
    fn test_empty_default() {
        let t = Template::new("ARGS=${EXTRA:}");
        assert_eq!(t.render(&HashMap::new()), "ARGS=");
    }

    #[test]
    fn test_variables_listed_once() {
        let t = Template::new("${A} ${B:x} ${A}");
        assert_eq!(t.variables(), vec!["A", "B"]);
    }

    #[test]
    fn test_shell_syntax_untouched() {
        let t = Template::new(r#"RUN echo "$HOME" && echo {a,b}"#);
        assert_eq!(t.render(&HashMap::new()), r#"RUN echo "$HOME" && echo {a,b}"#);
    }
}
