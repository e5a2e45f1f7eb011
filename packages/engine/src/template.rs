//! `{{dot.path}}` interpolation into a JSON context, used to build trigger
//! prompts and condition-poller expressions from a webhook payload or
//! condition snapshot.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").unwrap());

/// Looks up `path` (dot-separated) in `context`, returning `None` if any
/// segment is missing or not an object/array index.
pub fn extract_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = if let Ok(index) = segment.parse::<usize>() {
            current.as_array()?.get(index)?
        } else {
            current.as_object()?.get(segment)?
        };
    }
    Some(current)
}

/// Replaces every `{{dot.path}}` placeholder in `template` with the
/// stringified value found at that path in `context`. A missing path is
/// left as the literal placeholder text rather than silently becoming an
/// empty string, so a bad template is visible in the rendered prompt.
pub fn render(template: &str, context: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let path = &caps[1];
            match extract_path(context, path) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interpolates_nested_path() {
        let ctx = json!({ "order": { "total": 42, "customer": "Jo" } });
        let out = render("Order for {{order.customer}}: ${{order.total}}", &ctx);
        assert_eq!(out, "Order for Jo: $42");
    }

    #[test]
    fn leaves_missing_path_as_literal() {
        let ctx = json!({ "order": { "total": 42 } });
        let out = render("Shipping to {{order.address}}", &ctx);
        assert_eq!(out, "Shipping to {{order.address}}");
    }

    #[test]
    fn indexes_into_arrays() {
        let ctx = json!({ "items": ["first", "second"] });
        let out = render("{{items.1}}", &ctx);
        assert_eq!(out, "second");
    }
}
