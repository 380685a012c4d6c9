//! JUnit XML output
//!
//! The compiled program sends the summary as a JSON object shaped like the XML
//! document: `@key` entries become attributes, `#text` becomes text content,
//! arrays repeat their element, and every other key is a child element. The
//! supervisor appends the buffered results to `testsuite.testcase` and writes
//! the whole document at once.

use std::borrow::Cow;
use std::fmt::Write as _;

use quick_xml::escape::escape;
use serde_json::{Map, Value};

use crate::protocol::ProtocolError;

const DECLARATION: &str = "<?xml version=\"1.0\"?>";

/// Merge `results` into the summary and render the document.
pub fn render(mut summary: Value, results: Vec<Value>) -> Result<String, ProtocolError> {
    let suite = summary
        .get_mut("testsuite")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ProtocolError::BadResult("junit summary has no `testsuite` object".to_string()))?;

    let cases = suite.entry("testcase").or_insert_with(|| Value::Array(Vec::new()));
    match cases {
        Value::Array(existing) => existing.extend(results),
        other => {
            let first = other.take();
            *other = Value::Array(std::iter::once(first).chain(results).collect());
        }
    }

    let Value::Object(root) = summary else {
        return Err(ProtocolError::BadResult("junit summary is not an object".to_string()));
    };
    let mut out = String::from(DECLARATION);
    for (name, value) in &root {
        write_element(&mut out, name, value);
    }
    out.push('\n');
    Ok(out)
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(out, name, item);
            }
        }
        Value::Object(fields) => write_object(out, name, fields),
        Value::Null => {
            let _ = write!(out, "<{name}/>");
        }
        scalar => {
            let _ = write!(out, "<{name}>{}</{name}>", text(&scalar_text(scalar)));
        }
    }
}

fn write_object(out: &mut String, name: &str, fields: &Map<String, Value>) {
    out.push('<');
    out.push_str(name);
    for (key, value) in fields {
        if let Some(attribute) = key.strip_prefix('@') {
            let _ = write!(out, " {attribute}=\"{}\"", text(&scalar_text(value)));
        }
    }

    let mut body = String::new();
    for (key, value) in fields {
        if key.starts_with('@') {
            continue;
        }
        if key == "#text" {
            body.push_str(&text(&scalar_text(value)));
        } else {
            write_element(&mut body, key, value);
        }
    }

    if body.is_empty() {
        out.push_str("/>");
    } else {
        let _ = write!(out, ">{body}</{name}>");
    }
}

fn scalar_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

/// Escape markup and replace characters XML cannot carry at all.
fn text(raw: &str) -> String {
    escape(replace_invalid_chars(raw).as_ref()).into_owned()
}

/// `\u{1b}` becomes the literal text `\u{001b}` instead of breaking the document.
pub fn replace_invalid_chars(raw: &str) -> Cow<'_, str> {
    if raw.chars().all(is_xml_char) {
        return Cow::Borrowed(raw);
    }
    let mut cleaned = String::with_capacity(raw.len());
    for c in raw.chars() {
        if is_xml_char(c) {
            cleaned.push(c);
        } else {
            let _ = write!(cleaned, "\\u{{{:04x}}}", u32::from(c));
        }
    }
    Cow::Owned(cleaned)
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}')
}
