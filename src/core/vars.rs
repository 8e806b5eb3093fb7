//! Variable substitution for command templates

use regex::Regex;
use std::collections::HashMap;

/// Replace `:name:` tokens in a template with values from `bindings`
///
/// Tokens without a matching binding are left untouched. The bindings map is
/// read-only here; callers that mutate globals rely on the pipeline's strict
/// sequential execution.
pub fn substitute(template: &str, bindings: &HashMap<String, String>) -> String {
    let token = match Regex::new(r":([A-Za-z_][A-Za-z0-9_]*):") {
        Ok(re) => re,
        Err(_) => return template.to_string(),
    };

    token
        .replace_all(template, |caps: &regex::Captures| {
            match bindings.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_single_token() {
        let vars = bindings(&[("branch", "main")]);
        assert_eq!(substitute("git checkout :branch:", &vars), "git checkout main");
    }

    #[test]
    fn test_substitute_multiple_tokens() {
        let vars = bindings(&[("host", "web1"), ("app", "api")]);
        assert_eq!(
            substitute("deploy :app: to :host: and restart :app:", &vars),
            "deploy api to web1 and restart api"
        );
    }

    #[test]
    fn test_unbound_token_left_as_is() {
        let vars = bindings(&[("known", "yes")]);
        assert_eq!(substitute("echo :known: :unknown:", &vars), "echo yes :unknown:");
    }

    #[test]
    fn test_no_tokens() {
        let vars = bindings(&[("x", "1")]);
        assert_eq!(substitute("plain command", &vars), "plain command");
    }
}
