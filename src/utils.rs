use std::fmt;

use serde_json::Value;

/// Writes `value` with strings left unquoted and unescaped.
///
/// `{:#}` selects an indented multi-line layout, which keeps backtraces sent in
/// error `data` readable.
pub(crate) fn write_string_no_escape(value: &Value, f: &mut fmt::Formatter) -> fmt::Result {
    let indent = if f.alternate() { Some(0) } else { None };
    write_value(value, f, indent)
}

fn write_value(value: &Value, f: &mut fmt::Formatter, indent: Option<usize>) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Number(n) => write!(f, "{n}"),
        Value::String(s) => write!(f, "{s}"),
        Value::Array(items) => write_seq(
            f,
            ('[', ']'),
            items.iter().map(|item| (None, item)),
            items.len(),
            indent,
        ),
        Value::Object(entries) => write_seq(
            f,
            ('{', '}'),
            entries.iter().map(|(key, value)| (Some(key.as_str()), value)),
            entries.len(),
            indent,
        ),
    }
}

fn write_seq<'a>(
    f: &mut fmt::Formatter,
    (open, close): (char, char),
    items: impl Iterator<Item = (Option<&'a str>, &'a Value)>,
    len: usize,
    indent: Option<usize>,
) -> fmt::Result {
    let Some(indent) = indent else {
        write!(f, "{open}")?;
        for (i, (key, value)) in items.enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            if let Some(key) = key {
                write!(f, "{key}:")?;
            }
            write_value(value, f, None)?;
        }
        return write!(f, "{close}");
    };
    if len == 0 {
        return write!(f, "{open}{close}");
    }
    writeln!(f, "{open}")?;
    let inner = indent + 2;
    for (i, (key, value)) in items.enumerate() {
        write!(f, "{:inner$}", "")?;
        if let Some(key) = key {
            write!(f, "\"{key}\": ")?;
        }
        write_value(value, f, Some(inner))?;
        if i + 1 < len {
            writeln!(f, ",")?;
        } else {
            writeln!(f)?;
        }
    }
    write!(f, "{:indent$}{close}", "")
}
