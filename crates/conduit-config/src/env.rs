use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `{{ env.VAR }}` with an optional `| default("value")`
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#)
            .unwrap_or_else(|e| unreachable!("placeholder pattern is valid: {e}"))
    })
}

/// Expand `{{ env.VAR }}` placeholders in raw config text
///
/// `{{ env.VAR | default("fallback") }}` substitutes the fallback when the
/// variable is unset. Comment lines are left untouched.
pub fn expand_env(input: &str) -> Result<String, String> {
    let mut lines = Vec::new();

    for line in input.lines() {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut failure = None;
        let expanded = placeholder().replace_all(line, |caps: &Captures<'_>| {
            match resolve(caps) {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }
        lines.push(expanded.into_owned());
    }

    let mut output = lines.join("\n");
    if input.ends_with('\n') {
        output.push('\n');
    }

    Ok(output)
}

fn resolve(caps: &Captures<'_>) -> Result<String, String> {
    let key = &caps[1];
    let Some(var) = key.strip_prefix("env.").filter(|var| !var.contains('.')) else {
        return Err(format!("only variables scoped with 'env.' are supported: `{key}`"));
    };

    match (std::env::var(var), caps.get(2)) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(default)) => Ok(default.as_str().to_string()),
        (Err(_), None) => Err(format!("environment variable not found: `{var}`")),
    }
}
