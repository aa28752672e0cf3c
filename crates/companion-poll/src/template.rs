//! Request templates with `{name}` placeholders
//!
//! A template is a JSON document describing one API call:
//!
//! ```json
//! {
//!   "name": "search",
//!   "method": "POST",
//!   "url": "https://host/{component_name}/command",
//!   "headers": {"X-BLAZE-SESSION": "{ticket}"},
//!   "query": {"requestId": "{request_sequence}"},
//!   "json": {"messageAuthData": {"authCode": "{auth_code}"}},
//!   "context": {"component_name": "mut"}
//! }
//! ```
//!
//! Placeholders appear in the url, header values, query values, and any
//! string inside `json`. `{{` and `}}` produce literal braces. `context`
//! supplies defaults that per-cycle values override.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use capability::HttpRequest;
use serde::Deserialize;

use crate::error::TemplateError;

/// Placeholder bindings for one render.
pub type TemplateContext = BTreeMap<String, String>;

fn default_method() -> String {
    "POST".to_string()
}

fn default_name() -> String {
    "default".to_string()
}

/// Parameterized request description for one polling stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestTemplate {
    /// Stream name used in logs and metric labels
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, alias = "params")]
    pub query: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    /// Default placeholder bindings
    #[serde(default)]
    pub context: TemplateContext,
}

impl RequestTemplate {
    pub fn from_json_str(json: &str) -> Result<Self, TemplateError> {
        let template: Self =
            serde_json::from_str(json).map_err(|e| TemplateError::Load(e.to_string()))?;
        template.check_syntax()?;
        Ok(template)
    }

    /// Load a template file. Placeholder syntax is checked up front so a
    /// broken template fails at start-up rather than on the first poll.
    pub async fn load(path: &Path) -> Result<Self, TemplateError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TemplateError::Load(format!("reading {}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }

    /// Rename the stream.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Layer extra default bindings on top of the template's own.
    pub fn with_context(mut self, overrides: TemplateContext) -> Self {
        self.context.extend(overrides);
        self
    }

    /// Every placeholder name the template references.
    pub fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for s in self.strings() {
            // Syntax was validated at load; a malformed string contributes nothing.
            let _ = scan(s, "", &mut |name: &str| {
                keys.insert(name.to_string());
                Ok(String::new())
            });
        }
        keys
    }

    /// Substitute placeholders. `context` wins over the template defaults.
    pub fn render(&self, context: &TemplateContext) -> Result<HttpRequest, TemplateError> {
        let lookup = |name: &str| -> Result<String, TemplateError> {
            context
                .get(name)
                .or_else(|| self.context.get(name))
                .cloned()
                .ok_or_else(|| TemplateError::MissingKey(name.to_string()))
        };

        let url = substitute(&self.url, "url", &lookup)?;

        let mut headers = BTreeMap::new();
        for (name, value) in &self.headers {
            headers.insert(
                name.clone(),
                substitute(value, &format!("header {name}"), &lookup)?,
            );
        }

        let mut query = Vec::with_capacity(self.query.len());
        for (name, value) in &self.query {
            let rendered = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => {
                    substitute(s, &format!("query {name}"), &lookup)?
                }
                other => other.to_string(),
            };
            query.push((name.clone(), rendered));
        }

        let body = match &self.json {
            Some(json) => {
                let rendered = render_value(json, &lookup)?;
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    headers.insert("Content-Type".to_string(), "application/json".to_string());
                }
                Some(rendered.to_string())
            }
            None => None,
        };

        Ok(HttpRequest {
            method: self.method.to_uppercase(),
            url,
            headers,
            query,
            body,
        })
    }

    fn check_syntax(&self) -> Result<(), TemplateError> {
        let mut ok = |_: &str| Ok(String::new());
        scan(&self.url, "url", &mut ok)?;
        for (name, value) in &self.headers {
            scan(value, &format!("header {name}"), &mut ok)?;
        }
        for (name, value) in &self.query {
            if let serde_json::Value::String(s) = value {
                scan(s, &format!("query {name}"), &mut ok)?;
            }
        }
        if let Some(json) = &self.json {
            for s in json_strings(json) {
                scan(s, "json", &mut ok)?;
            }
        }
        Ok(())
    }

    fn strings(&self) -> Vec<&str> {
        let mut out = vec![self.url.as_str()];
        out.extend(self.headers.values().map(String::as_str));
        out.extend(self.query.values().filter_map(|v| v.as_str()));
        if let Some(json) = &self.json {
            out.extend(json_strings(json));
        }
        out
    }
}

fn json_strings(value: &serde_json::Value) -> Vec<&str> {
    match value {
        serde_json::Value::String(s) => vec![s.as_str()],
        serde_json::Value::Array(items) => items.iter().flat_map(json_strings).collect(),
        serde_json::Value::Object(map) => map.values().flat_map(json_strings).collect(),
        _ => Vec::new(),
    }
}

fn render_value<F>(value: &serde_json::Value, lookup: &F) -> Result<serde_json::Value, TemplateError>
where
    F: Fn(&str) -> Result<String, TemplateError>,
{
    Ok(match value {
        serde_json::Value::String(s) => serde_json::Value::String(substitute(s, "json", lookup)?),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| render_value(v, lookup))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, lookup)?);
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    })
}

fn substitute<F>(input: &str, field: &str, lookup: &F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Result<String, TemplateError>,
{
    scan(input, field, &mut |name: &str| lookup(name))
}

/// Walk `input`, copying literal text and replacing each `{name}` with
/// `resolve(name)`.
fn scan<F>(input: &str, field: &str, resolve: &mut F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Result<String, TemplateError>,
{
    let malformed = |detail: String| TemplateError::Malformed {
        field: field.to_string(),
        detail,
    };

    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(malformed(format!("unclosed '{{' at byte {pos}")));
                }
                if name.is_empty() || !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                    return Err(malformed(format!("invalid placeholder name '{name}'")));
                }
                out.push_str(&resolve(&name)?);
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(malformed(format!("unmatched '}}' at byte {pos}"))),
            other => out.push(other),
        }
    }
    Ok(out)
}
