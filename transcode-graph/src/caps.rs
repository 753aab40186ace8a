//! Capability descriptors.
//!
//! A [`Caps`] is an ordered list of alternatives. Each alternative is a media
//! type name plus typed fields, written in the familiar text form:
//!
//! ```text
//! video/x-raw, width=1280, height=720, framerate=30/1; image/jpeg
//! ```
//!
//! `ANY` matches every descriptor and `EMPTY` matches none.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid caps {input:?}: {reason}")]
pub struct ParseCapsError {
    pub input: String,
    pub reason: String,
}

impl ParseCapsError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Fraction(i32, i32),
    Str(String),
}

impl Value {
    fn parse(raw: &str) -> Self {
        let mut raw = raw.trim();
        // "(int)4", "(string)main", "(fraction)30/1"
        if raw.starts_with('(') {
            if let Some(end) = raw.find(')') {
                raw = raw[end + 1..].trim();
            }
        }

        if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            return Value::Str(unescape(&raw[1..raw.len() - 1]));
        }
        match raw {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Value::Int(v);
        }
        if let Some((num, den)) = raw.split_once('/') {
            if let (Ok(num), Ok(den)) = (num.trim().parse::<i32>(), den.trim().parse::<i32>()) {
                return Value::Fraction(num, den);
            }
        }
        Value::Str(raw.to_string())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Fraction(n, d) => write!(f, "{}/{}", n, d),
            Value::Str(v) => {
                let needs_quotes = v.is_empty()
                    || v.chars()
                        .any(|c| matches!(c, ',' | ';' | '=' | '"' | '/') || c.is_whitespace())
                    || matches!(Value::parse(v), Value::Int(_) | Value::Bool(_));
                if needs_quotes {
                    write!(f, "\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))
                } else {
                    write!(f, "{}", v)
                }
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One alternative of a [`Caps`]: a media type name and its fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Structure {
    name: String,
    fields: Vec<(String, Value)>,
}

impl Structure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Same media type and no field both sides set to different values.
    fn can_intersect(&self, other: &Structure) -> bool {
        self.name == other.name
            && self
                .fields
                .iter()
                .all(|(k, v)| other.get(k).is_none_or(|ov| ov == v))
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.fields {
            write!(f, ", {}={}", k, v)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Caps {
    Any,
    Alternatives(Vec<Structure>),
}

impl Caps {
    pub fn any() -> Self {
        Caps::Any
    }

    pub fn empty() -> Self {
        Caps::Alternatives(Vec::new())
    }

    pub fn new_simple(name: &str) -> Self {
        Caps::Alternatives(vec![Structure::new(name)])
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Caps::Any)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Caps::Alternatives(s) if s.is_empty())
    }

    /// Number of alternatives; `ANY` has none.
    pub fn size(&self) -> usize {
        match self {
            Caps::Any => 0,
            Caps::Alternatives(s) => s.len(),
        }
    }

    pub fn structure(&self, index: usize) -> Option<&Structure> {
        match self {
            Caps::Any => None,
            Caps::Alternatives(s) => s.get(index),
        }
    }

    /// Media type name of the first alternative.
    pub fn first_name(&self) -> Option<&str> {
        self.structure(0).map(Structure::name)
    }

    pub fn append(&mut self, structure: Structure) {
        match self {
            Caps::Any => {}
            Caps::Alternatives(s) => s.push(structure),
        }
    }

    pub fn can_intersect(&self, other: &Caps) -> bool {
        match (self, other) {
            (Caps::Any, o) | (o, Caps::Any) => !o.is_empty(),
            (Caps::Alternatives(a), Caps::Alternatives(b)) => a
                .iter()
                .any(|sa| b.iter().any(|sb| sa.can_intersect(sb))),
        }
    }
}

impl From<Structure> for Caps {
    fn from(s: Structure) -> Self {
        Caps::Alternatives(vec![s])
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caps::Any => write!(f, "ANY"),
            Caps::Alternatives(s) if s.is_empty() => write!(f, "EMPTY"),
            Caps::Alternatives(s) => {
                for (i, structure) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", structure)?;
                }
                Ok(())
            }
        }
    }
}

/// Splits on `sep` outside of double quotes. Inside quotes a backslash
/// escapes the next character.
fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if in_quotes && c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if c == sep && !in_quotes {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

fn quotes_balanced(input: &str) -> bool {
    let mut in_quotes = false;
    let mut escaped = false;
    for c in input.chars() {
        if escaped {
            escaped = false;
        } else if in_quotes && c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        }
    }
    !in_quotes
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

fn parse_structure(raw: &str, input: &str) -> Result<Structure, ParseCapsError> {
    let mut parts = split_unquoted(raw, ',').into_iter();
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() || name.contains('=') {
        return Err(ParseCapsError::new(input, "missing media type name"));
    }

    let mut structure = Structure::new(name);
    for field in parts {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| ParseCapsError::new(input, format!("field {:?} has no value", field)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ParseCapsError::new(input, "empty field name"));
        }
        structure.set(key, Value::parse(value));
    }
    Ok(structure)
}

impl FromStr for Caps {
    type Err = ParseCapsError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed {
            "ANY" => return Ok(Caps::Any),
            "" | "EMPTY" => return Ok(Caps::empty()),
            _ => {}
        }
        if !quotes_balanced(trimmed) {
            return Err(ParseCapsError::new(input, "unbalanced quotes"));
        }

        let structures = split_unquoted(trimmed, ';')
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_structure(s, input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Caps::Alternatives(structures))
    }
}

impl TryFrom<String> for Caps {
    type Error = ParseCapsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Caps> for String {
    fn from(caps: Caps) -> Self {
        caps.to_string()
    }
}
