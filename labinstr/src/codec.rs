/// Command templates and reply parsers.
///
/// A template such as `FREQ:CW {value:.0}HZ` is parsed once, when the instrument profile is
/// loaded, and rendered with named arguments afterwards. Supported format specs:
///
/// * `{name}`      shortest decimal representation
/// * `{name:.N}`   fixed point with `N` decimals
/// * `{name:d}`    rounded integer
/// * `{name:x}`, `{name:0Nx}`  lower-case hex, optionally zero-padded to `N` digits
///
/// Literal braces are written as `{{` and `}}`.
use std::fmt;

use anyhow::anyhow;
use serde::{Deserialize, Deserializer};

use crate::Error;

#[derive(Clone, Debug, PartialEq)]
enum FormatSpec {
    Shortest,
    Fixed(usize),
    Integer,
    Hex { width: usize },
}

impl FormatSpec {
    fn parse(spec: &str) -> Option<Self> {
        if spec.is_empty() {
            return Some(FormatSpec::Shortest);
        }
        if spec == "d" {
            return Some(FormatSpec::Integer);
        }
        if let Some(decimals) = spec.strip_prefix('.') {
            return decimals.parse().ok().map(FormatSpec::Fixed);
        }
        if let Some(width) = spec.strip_suffix('x') {
            if width.is_empty() {
                return Some(FormatSpec::Hex { width: 0 });
            }
            let width = width.strip_prefix('0')?;
            return width.parse().ok().map(|width| FormatSpec::Hex { width });
        }
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Part {
    Literal(String),
    Placeholder { name: String, spec: FormatSpec },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Float(f64),
    Int(i64),
}

impl Arg {
    fn as_f64(&self) -> f64 {
        match self {
            Arg::Float(x) => *x,
            Arg::Int(x) => *x as f64,
        }
    }

    fn as_i64(&self) -> i64 {
        match self {
            Arg::Float(x) => x.round() as i64,
            Arg::Int(x) => *x,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    raw: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let invalid = |why: &str| Error::argument(anyhow!("Invalid template `{}`: {}", raw, why));
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched `}`")),
                '{' => {
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(invalid("unterminated placeholder")),
                            Some(x) => inner.push(x),
                        }
                    }
                    let (name, spec) = inner.split_once(':').unwrap_or((inner.as_str(), ""));
                    if name.is_empty() || !name.chars().all(|x| x.is_ascii_alphanumeric() || x == '_') {
                        return Err(invalid("placeholder needs a name"));
                    }
                    let spec = FormatSpec::parse(spec).ok_or_else(|| invalid("unsupported format spec"))?;
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Placeholder {
                        name: name.to_string(),
                        spec,
                    });
                }
                x => literal.push(x),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|x| match x {
            Part::Placeholder { name, .. } => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Fails if the template refers to anything not in `known`.
    pub fn check_placeholders(&self, known: &[&str]) -> crate::Result<()> {
        for name in self.placeholders() {
            if !known.contains(&name) {
                return Err(Error::argument(anyhow!(
                    "Template `{}` refers to unknown argument `{}`",
                    self.raw,
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn render(&self, args: &[(&str, Arg)]) -> crate::Result<String> {
        let mut ret = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(x) => ret.push_str(x),
                Part::Placeholder { name, spec } => {
                    let arg = args
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v)
                        .ok_or_else(|| Error::argument(anyhow!("Missing argument `{}` for `{}`", name, self.raw)))?;
                    let formatted = match spec {
                        FormatSpec::Shortest => match arg {
                            Arg::Int(x) => x.to_string(),
                            Arg::Float(x) => x.to_string(),
                        },
                        FormatSpec::Fixed(decimals) => format!("{:.*}", decimals, arg.as_f64()),
                        FormatSpec::Integer => arg.as_i64().to_string(),
                        FormatSpec::Hex { width } => {
                            let x = arg.as_i64();
                            if x < 0 {
                                return Err(Error::argument(anyhow!("Cannot format {} as hex", x)));
                            }
                            format!("{:0width$x}", x, width = *width)
                        }
                    };
                    ret.push_str(&formatted);
                }
            }
        }
        Ok(ret)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Template::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// How to extract a number from a textual reply.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyParser {
    Float,
    Int,
    Hex,
    /// The n-th whitespace separated token, e.g. `FR 10000000.0 HZ`.
    Token { index: usize },
    /// The n-th field of a separated list.
    Field { index: usize, separator: char },
}

impl Default for ReplyParser {
    fn default() -> Self {
        ReplyParser::Float
    }
}

impl ReplyParser {
    pub fn parse(&self, reply: &str) -> crate::Result<f64> {
        let unexpected = || Error::unexpected_response(reply.to_string());
        let reply_trimmed = reply.trim();
        match self {
            ReplyParser::Float => reply_trimmed.parse::<f64>().map_err(|_| unexpected()),
            ReplyParser::Int => reply_trimmed
                .parse::<i64>()
                .map(|x| x as f64)
                .map_err(|_| unexpected()),
            ReplyParser::Hex => u64::from_str_radix(reply_trimmed, 16)
                .map(|x| x as f64)
                .map_err(|_| unexpected()),
            ReplyParser::Token { index } => reply_trimmed
                .split_whitespace()
                .nth(*index)
                .ok_or_else(unexpected)?
                .parse::<f64>()
                .map_err(|_| unexpected()),
            ReplyParser::Field { index, separator } => reply_trimmed
                .split(*separator)
                .nth(*index)
                .ok_or_else(unexpected)?
                .trim()
                .parse::<f64>()
                .map_err(|_| unexpected()),
        }
    }
}
