//! Lazy depth-first walk over the scalar leaves of a JSON document

use crate::redact::REDACTED;
use serde_json::Value;

/// One scannable leaf (string or number)
#[derive(Debug)]
pub struct Field<'a> {
    /// Dotted display path, e.g. `customer.phones[1]`
    pub path: String,
    /// JSON pointer, e.g. `/customer/phones/1`
    pub pointer: String,
    /// Nearest enclosing object key; array elements inherit it
    pub name: Option<&'a str>,
    /// The leaf itself
    pub value: &'a mut Value,
}

struct Frame<'a> {
    value: &'a mut Value,
    path: String,
    pointer: String,
    name: Option<&'a str>,
    depth: usize,
}

/// Explicit-stack iterator yielding leaves in document order.
///
/// Containers nested deeper than `max_depth` are replaced by the
/// full-redaction marker instead of being descended into.
pub struct FieldWalker<'a> {
    stack: Vec<Frame<'a>>,
    max_depth: usize,
    depth_limited: bool,
}

impl<'a> FieldWalker<'a> {
    /// Walk `root` with the given nesting limit (the root container is depth 1)
    pub fn new(root: &'a mut Value, max_depth: usize) -> Self {
        let mut stack = Vec::with_capacity(16);
        stack.push(Frame {
            value: root,
            path: String::new(),
            pointer: String::new(),
            name: None,
            depth: 1,
        });
        Self {
            stack,
            max_depth,
            depth_limited: false,
        }
    }

    /// Whether any subtree was replaced for exceeding the depth limit
    pub fn depth_limited(&self) -> bool {
        self.depth_limited
    }
}

fn child_key_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn child_pointer(parent: &str, token: &str) -> String {
    let escaped = token.replace('~', "~0").replace('/', "~1");
    format!("{parent}/{escaped}")
}

impl<'a> Iterator for FieldWalker<'a> {
    type Item = Field<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frame) = self.stack.pop() {
            let Frame { value, path, pointer, name, depth } = frame;

            let is_container = matches!(value, Value::Object(_) | Value::Array(_));
            if is_container && depth > self.max_depth {
                *value = Value::String(REDACTED.to_string());
                self.depth_limited = true;
                continue;
            }

            match value {
                Value::Object(map) => {
                    // Reverse so the first key is popped first.
                    for (key, child) in map.iter_mut().rev() {
                        self.stack.push(Frame {
                            path: child_key_path(&path, key),
                            pointer: child_pointer(&pointer, key),
                            name: Some(key.as_str()),
                            value: child,
                            depth: depth + 1,
                        });
                    }
                }
                Value::Array(items) => {
                    for (i, child) in items.iter_mut().enumerate().rev() {
                        self.stack.push(Frame {
                            path: format!("{path}[{i}]"),
                            pointer: format!("{pointer}/{i}"),
                            name,
                            value: child,
                            depth: depth + 1,
                        });
                    }
                }
                Value::String(_) | Value::Number(_) => {
                    let path = if path.is_empty() { "$".to_string() } else { path };
                    return Some(Field { path, pointer, name, value });
                }
                Value::Bool(_) | Value::Null => {}
            }
        }
        None
    }
}
