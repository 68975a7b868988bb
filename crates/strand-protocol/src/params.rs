//! Query parameter encoding.
//!
//! Nested structures are flattened with bracket keys: `{"user": {"id": 1}}`
//! becomes `user[id]=1` and `{"tags": ["a", "b"]}` becomes
//! `tags[]=a&tags[]=b`. Keys and values are percent-encoded the way browsers
//! encode URI components. The same encoding serves the connection URL and any
//! HTTP query string.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

/// Connection parameters: a JSON object.
pub type Params = Map<String, Value>;

/// Characters left unescaped by `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_component(input: &str) -> String {
    utf8_percent_encode(input, COMPONENT).to_string()
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn push_pairs(out: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (child, child_value) in map {
                push_pairs(out, &format!("{key}[{child}]"), child_value);
            }
        }
        Value::Array(items) => {
            let item_key = format!("{key}[]");
            for item in items {
                push_pairs(out, &item_key, item);
            }
        }
        scalar_value => out.push(format!(
            "{}={}",
            encode_component(key),
            encode_component(&scalar(scalar_value))
        )),
    }
}

/// Serialize parameters into a query string (without the leading `?`).
#[must_use]
pub fn serialize(params: &Params) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        push_pairs(&mut pairs, key, value);
    }
    pairs.join("&")
}

/// Append parameters to a URL, respecting an existing query string.
#[must_use]
pub fn append_params(url: &str, params: &Params) -> String {
    let query = serialize(params);
    if query.is_empty() {
        return url.to_string();
    }
    let prefix = if url.contains('?') { '&' } else { '?' };
    format!("{url}{prefix}{query}")
}
