//! # Format Templates
//!
//! Turns a user template such as `"${volume[@% ]}%"` into a reusable
//! `CompiledTemplate`, then renders it against whatever values a plugin has
//! at hand.
//!
//! ## Syntax
//!
//! - `${name}` substitutes token `name`.
//! - `${name[spec]}` also passes `spec` to the type-specific renderer.
//!   Inside the brackets `\]` and `\\` escape.
//! - Anything else, including a `$` not followed by `{`, is literal text.
//!
//! ## Inner specs by type
//!
//! | Type           | Spec                              | Default            |
//! |----------------|-----------------------------------|--------------------|
//! | `Bool`         | `yes|no`                          | `true` / `false`   |
//! | `Byte`         | `zero|one|two` (pick by value)    | number             |
//! | `UInt64`       | same as a one-element list        | number             |
//! | `ListOfUInt64` | `elem[@separator][;suffix]`       | joined with `,`    |
//!
//! An element spec is `[%N][/N][W|0W]`: percentage of `N`, integer division,
//! then minimum width (zero padded with a leading `0`). Widths are capped at
//! 64 columns.
//!
//! Compiled templates are immutable and cheap to clone (`Arc`), so one
//! template can serve every section of a plugin, from any thread.

use std::fmt;
use std::sync::Arc;

const MAX_ELEMENT_WIDTH: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// A value handed to the renderer for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedValue {
    Bool(bool),
    UInt64(u64),
    Byte(u8),
    ListOfUInt64(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Token { id: usize, spec: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTemplate {
    pieces: Arc<[Piece]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Token name not in the plugin's token table.
    UnknownToken(String),
    /// `${` or `[` without its closing delimiter.
    Unterminated { position: usize },
    /// `${}` or a name with characters outside `[A-Za-z0-9_-]`.
    InvalidName { position: usize },
    /// Something other than `}` after a token's inner spec.
    TrailingGarbage { position: usize },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnknownToken(name) => write!(f, "unknown token '{name}'"),
            CompileError::Unterminated { position } => {
                write!(f, "unterminated token starting at byte {position}")
            }
            CompileError::InvalidName { position } => {
                write!(f, "invalid token name at byte {position}")
            }
            CompileError::TrailingGarbage { position } => {
                write!(f, "expected '}}' at byte {position}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

// ============================================================================
// Compilation
// ============================================================================

/// Compiles `template`, or `default_template` when the former is absent or empty.
///
/// Unknown token names are an error either way; a failing default is a bug in
/// the calling plugin.
pub fn compile(
    template: Option<&str>,
    known_tokens: &[&str],
    default_template: &str,
) -> Result<CompiledTemplate, CompileError> {
    let source = match template {
        Some(t) if !t.is_empty() => t,
        _ => default_template,
    };
    parse(source, known_tokens).map(|pieces| CompiledTemplate {
        pieces: pieces.into(),
    })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn parse(source: &str, known_tokens: &[&str]) -> Result<Vec<Piece>, CompileError> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut rest = source;

    while let Some(start) = rest.find("${") {
        literal.push_str(&rest[..start]);
        let offset = source.len() - rest.len() + start;
        let body = &rest[start + 2..];

        let name_len = body.find(|c: char| !is_name_char(c)).unwrap_or(body.len());
        let name = &body[..name_len];
        let after_name = &body[name_len..];
        if after_name.is_empty() {
            return Err(CompileError::Unterminated { position: offset });
        }
        if name.is_empty() {
            return Err(CompileError::InvalidName { position: offset });
        }

        let (spec, after_spec) = if let Some(spec_body) = after_name.strip_prefix('[') {
            let (spec, consumed) = read_spec(spec_body)
                .ok_or(CompileError::Unterminated { position: offset })?;
            (Some(spec), &spec_body[consumed..])
        } else {
            (None, after_name)
        };

        let Some(tail) = after_spec.strip_prefix('}') else {
            let position = source.len() - after_spec.len();
            return Err(if after_spec.is_empty() {
                CompileError::Unterminated { position: offset }
            } else if spec.is_none() {
                CompileError::InvalidName { position: offset }
            } else {
                CompileError::TrailingGarbage { position }
            });
        };

        let id = known_tokens
            .iter()
            .position(|&t| t == name)
            .ok_or_else(|| CompileError::UnknownToken(name.to_string()))?;

        if !literal.is_empty() {
            pieces.push(Piece::Literal(std::mem::take(&mut literal)));
        }
        pieces.push(Piece::Token { id, spec });
        rest = tail;
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    Ok(pieces)
}

/// Reads an inner spec up to the closing `]`, returning it unescaped along
/// with the number of bytes consumed (closing bracket included).
fn read_spec(body: &str) -> Option<(String, usize)> {
    let mut spec = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            ']' => return Some((spec, i + 1)),
            '\\' => match chars.next() {
                Some((_, escaped @ (']' | '\\'))) => spec.push(escaped),
                Some((_, other)) => {
                    spec.push('\\');
                    spec.push(other);
                }
                None => return None,
            },
            _ => spec.push(c),
        }
    }
    None
}

// ============================================================================
// Rendering
// ============================================================================

impl CompiledTemplate {
    /// Renders against `source`. Tokens with no value render as nothing;
    /// surrounding literal text is always kept.
    pub fn render<F>(&self, mut source: F) -> String
    where
        F: FnMut(usize) -> Option<TypedValue>,
    {
        let mut out = String::new();
        for piece in self.pieces.iter() {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Token { id, spec } => {
                    if let Some(value) = source(*id) {
                        render_value(&mut out, &value, spec.as_deref().unwrap_or(""));
                    }
                }
            }
        }
        out
    }

    /// Ids of the tokens this template references, in order of appearance.
    pub fn tokens(&self) -> impl Iterator<Item = usize> + '_ {
        self.pieces.iter().filter_map(|piece| match piece {
            Piece::Token { id, .. } => Some(*id),
            Piece::Literal(_) => None,
        })
    }

    pub fn uses_token(&self, id: usize) -> bool {
        self.tokens().any(|t| t == id)
    }
}

fn render_value(out: &mut String, value: &TypedValue, spec: &str) {
    match value {
        TypedValue::Bool(b) => match spec.split_once('|') {
            Some((yes, no)) => out.push_str(if *b { yes } else { no }),
            None if spec.is_empty() => out.push_str(if *b { "true" } else { "false" }),
            None => {
                if *b {
                    out.push_str(spec);
                }
            }
        },
        TypedValue::Byte(n) => match spec.split('|').nth(usize::from(*n)) {
            Some(name) if !spec.is_empty() => out.push_str(name),
            _ => out.push_str(&n.to_string()),
        },
        TypedValue::UInt64(n) => render_list(out, std::slice::from_ref(n), spec),
        TypedValue::ListOfUInt64(values) => render_list(out, values, spec),
    }
}

/// A scalar is rendered as a one-element list so both share suffix rules.
fn render_list(out: &mut String, values: &[u64], spec: &str) {
    let list = ListSpec::parse(spec);
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(list.separator);
        }
        list.element.write(out, *v);
    }
    out.push_str(list.suffix);
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ElementSpec {
    percent_of: Option<u64>,
    divide_by: Option<u64>,
    width: usize,
    zero_pad: bool,
}

impl ElementSpec {
    /// Lenient: parts that do not parse are ignored.
    fn parse(spec: &str) -> Self {
        let mut parsed = ElementSpec::default();
        let mut rest = spec;
        while !rest.is_empty() {
            let marker = rest.chars().next().unwrap_or_default();
            let (digits, tail) = split_digits(&rest[marker.len_utf8()..]);
            match marker {
                '%' => parsed.percent_of = digits.parse().ok().filter(|&n| n > 0),
                '/' => parsed.divide_by = digits.parse().ok().filter(|&n| n > 0),
                '0'..='9' => {
                    let (width, tail) = split_digits(rest);
                    parsed.zero_pad = width.starts_with('0');
                    // Only overflow fails here: the run is all digits
                    parsed.width = width
                        .parse::<usize>()
                        .unwrap_or(usize::MAX)
                        .min(MAX_ELEMENT_WIDTH);
                    rest = tail;
                    continue;
                }
                _ => {}
            }
            rest = if matches!(marker, '%' | '/') {
                tail
            } else {
                &rest[marker.len_utf8()..]
            };
        }
        parsed
    }

    fn write(&self, out: &mut String, value: u64) {
        let mut n = u128::from(value);
        if let Some(base) = self.percent_of {
            let base = u128::from(base);
            n = (n * 100 + base / 2) / base;
        }
        if let Some(divisor) = self.divide_by {
            n /= u128::from(divisor);
        }
        if self.zero_pad {
            out.push_str(&format!("{:0width$}", n, width = self.width));
        } else {
            out.push_str(&format!("{:width$}", n, width = self.width));
        }
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

struct ListSpec<'a> {
    element: ElementSpec,
    separator: &'a str,
    suffix: &'a str,
}

impl<'a> ListSpec<'a> {
    fn parse(spec: &'a str) -> Self {
        let (element, separator, suffix) = match spec.split_once('@') {
            Some((element, rest)) => {
                let (separator, suffix) = rest.split_once(';').unwrap_or((rest, ""));
                (element, separator, suffix)
            }
            None => {
                let (element, suffix) = spec.split_once(';').unwrap_or((spec, ""));
                (element, ",", suffix)
            }
        };
        Self {
            element: ElementSpec::parse(element),
            separator,
            suffix,
        }
    }
}
