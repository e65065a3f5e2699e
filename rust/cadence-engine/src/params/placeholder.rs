//! Placeholder detection.
//!
//! Three syntaxes are recognised:
//!
//! | Syntax      | Where                                        |
//! |-------------|----------------------------------------------|
//! | `{{ name }}`| anywhere, including inside `'...'`           |
//! | `:name`     | in plain SQL text only, not after `:`        |
//! | `$name`     | in plain SQL text only, not after `$`        |
//!
//! Plain SQL text excludes `'...'` literals, `"..."` identifiers, `--`
//! line comments and `/* */` block comments. `:name` and `$name` are also
//! ignored after a word character, so `a::date`, `x:y` and `price$usd` are
//! left alone. Names match `[A-Za-z_][A-Za-z0-9_]*`.

use std::collections::BTreeSet;

/// Which syntax a placeholder was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderSyntax {
    Braces,
    Colon,
    Dollar,
}

/// One placeholder occurrence in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence<'a> {
    pub name: &'a str,
    pub syntax: PlaceholderSyntax,
    /// Byte offset of the first character of the placeholder.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Offset of the opening quote when inside a string literal.
    pub literal_start: Option<usize>,
}

impl Occurrence<'_> {
    #[must_use]
    pub const fn in_literal(&self) -> bool {
        self.literal_start.is_some()
    }
}

/// A template split into raw text and placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Placeholder(Occurrence<'a>),
}

/// Lexical region the scanner is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    /// String literal opened at the given offset.
    Literal(usize),
    QuotedIdentifier,
    LineComment,
    BlockComment,
}

/// Split `template` into segments.
#[must_use]
pub fn scan(template: &str) -> Vec<Segment<'_>> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut region = Region::Code;
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        match region {
            Region::Code => {
                let opened = match (b, next) {
                    (b'\'', _) => Some((Region::Literal(i), 1)),
                    (b'"', _) => Some((Region::QuotedIdentifier, 1)),
                    (b'-', Some(b'-')) => Some((Region::LineComment, 2)),
                    (b'/', Some(b'*')) => Some((Region::BlockComment, 2)),
                    _ => None,
                };
                if let Some((opened, width)) = opened {
                    region = opened;
                    i += width;
                    continue;
                }
            }
            // doubled quotes are escapes
            Region::Literal(_) if b == b'\'' => {
                if next == Some(b'\'') {
                    i += 2;
                } else {
                    region = Region::Code;
                    i += 1;
                }
                continue;
            }
            Region::QuotedIdentifier if b == b'"' => {
                if next == Some(b'"') {
                    i += 2;
                } else {
                    region = Region::Code;
                    i += 1;
                }
                continue;
            }
            Region::LineComment if b == b'\n' => {
                region = Region::Code;
                i += 1;
                continue;
            }
            Region::BlockComment if b == b'*' && next == Some(b'/') => {
                region = Region::Code;
                i += 2;
                continue;
            }
            _ => {}
        }

        let literal_start = match region {
            Region::Literal(start) => Some(start),
            _ => None,
        };
        let found = if b == b'{' && next == Some(b'{') {
            braces_at(template, i)
        } else if region == Region::Code && (b == b':' || b == b'$') {
            sigil_at(bytes, i)
        } else {
            None
        };

        match found {
            Some((syntax, name_start, name_end, end)) => {
                if text_start < i {
                    segments.push(Segment::Text(&template[text_start..i]));
                }
                segments.push(Segment::Placeholder(Occurrence {
                    name: &template[name_start..name_end],
                    syntax,
                    start: i,
                    end,
                    literal_start,
                }));
                i = end;
                text_start = end;
            }
            None => i += 1,
        }
    }

    if text_start < template.len() {
        segments.push(Segment::Text(&template[text_start..]));
    }
    segments
}

/// Every distinct placeholder name in `template`.
#[must_use]
pub fn detect_placeholders(template: &str) -> BTreeSet<String> {
    scan(template)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Placeholder(occurrence) => Some(occurrence.name.to_string()),
            Segment::Text(_) => None,
        })
        .collect()
}

/// `{{ name }}` starting at `start`.
fn braces_at(template: &str, start: usize) -> Option<(PlaceholderSyntax, usize, usize, usize)> {
    let inner_start = start + 2;
    let close = template[inner_start..].find("}}")? + inner_start;
    let inner = &template[inner_start..close];
    let leading = inner.len() - inner.trim_start().len();
    let name = inner.trim();
    if !is_identifier(name) {
        return None;
    }
    let name_start = inner_start + leading;
    Some((
        PlaceholderSyntax::Braces,
        name_start,
        name_start + name.len(),
        close + 2,
    ))
}

/// `:name` or `$name` starting at `start`.
fn sigil_at(bytes: &[u8], start: usize) -> Option<(PlaceholderSyntax, usize, usize, usize)> {
    let sigil = bytes[start];
    if let Some(&prev) = start.checked_sub(1).and_then(|p| bytes.get(p)) {
        if is_word_byte(prev) || prev == b':' || prev == b'$' {
            return None;
        }
    }

    let name_start = start + 1;
    let first = *bytes.get(name_start)?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let name_end = bytes[name_start..]
        .iter()
        .position(|b| !is_word_byte(*b))
        .map_or(bytes.len(), |offset| name_start + offset);

    let syntax = if sigil == b':' {
        PlaceholderSyntax::Colon
    } else {
        PlaceholderSyntax::Dollar
    };
    Some((syntax, name_start, name_end, name_end))
}

const fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
        && bytes.all(is_word_byte)
}
