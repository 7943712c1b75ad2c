//! Minimal PostgreSQL SQL tokenizer.
//!
//! Produces byte spans into the original text so callers can rebuild it with
//! substitutions. Only the token classes needed for literal normalization and
//! relation extraction are distinguished; everything else is an operator or a
//! punctuation token.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Keyword or unquoted identifier.
    Word,
    /// `"Double Quoted"` identifier.
    QuotedIdent,
    /// Any string constant: `'..'`, `E'..'`, `B'..'`, `X'..'`, `N'..'`, `$tag$..$tag$`.
    String,
    Number,
    /// Positional parameter `$1`.
    Param,
    Operator,
    /// `( ) , ; [ ] . : ::` and stray characters.
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }

    pub fn is_punct(&self, src: &str, p: &str) -> bool {
        self.kind == TokenKind::Punct && self.text(src) == p
    }

    /// Case-insensitive keyword comparison (`kw` must be upper case).
    pub fn is_word(&self, src: &str, kw: &str) -> bool {
        self.kind == TokenKind::Word && self.text(src).eq_ignore_ascii_case(kw)
    }
}

/// Lexing failure; the offset is where the unterminated construct starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unterminated string literal at byte {0}")]
    UnterminatedString(usize),
    #[error("unterminated quoted identifier at byte {0}")]
    UnterminatedIdent(usize),
    #[error("unterminated comment at byte {0}")]
    UnterminatedComment(usize),
    #[error("unterminated dollar-quoted string at byte {0}")]
    UnterminatedDollarQuote(usize),
}

const OPERATOR_CHARS: &[u8] = b"+-*/<>=~!@#%^&|`?";
/// An operator ending in `+`/`-` keeps it only if it contains one of these.
const OPERATOR_SPECIAL: &[u8] = b"~!@#%^&|`?";

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_cont(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit() || b == b'$'
}

/// Tokenize `src`, skipping whitespace and comments.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        let start = i;

        let kind = match b {
            _ if b.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'-' if next == Some(b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(bytes.len(), |p| i + p);
                continue;
            }
            b'/' if next == Some(b'*') => {
                i = skip_block_comment(bytes, i)?;
                continue;
            }
            b'\'' => {
                i = scan_string(bytes, i + 1, false).ok_or(LexError::UnterminatedString(start))?;
                TokenKind::String
            }
            b'E' | b'e' if next == Some(b'\'') => {
                i = scan_string(bytes, i + 2, true).ok_or(LexError::UnterminatedString(start))?;
                TokenKind::String
            }
            b'B' | b'b' | b'X' | b'x' | b'N' | b'n' if next == Some(b'\'') => {
                i = scan_string(bytes, i + 2, false).ok_or(LexError::UnterminatedString(start))?;
                TokenKind::String
            }
            b'"' => {
                i = scan_quoted_ident(bytes, i + 1).ok_or(LexError::UnterminatedIdent(start))?;
                TokenKind::QuotedIdent
            }
            b'$' => match next {
                Some(d) if d.is_ascii_digit() => {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    TokenKind::Param
                }
                _ => match dollar_tag_end(bytes, i) {
                    Some(tag_end) => {
                        let tag = &bytes[i..=tag_end];
                        i = find_subslice(bytes, tag_end + 1, tag)
                            .map(|p| p + tag.len())
                            .ok_or(LexError::UnterminatedDollarQuote(start))?;
                        TokenKind::String
                    }
                    None => {
                        i += 1;
                        TokenKind::Punct
                    }
                },
            },
            b'0'..=b'9' => {
                i = scan_number(bytes, i);
                TokenKind::Number
            }
            b'.' if next.is_some_and(|d| d.is_ascii_digit()) => {
                i = scan_number(bytes, i);
                TokenKind::Number
            }
            _ if is_ident_start(b) => {
                i += 1;
                while i < bytes.len() && is_ident_cont(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            b':' if next == Some(b':') => {
                i += 2;
                TokenKind::Punct
            }
            _ if OPERATOR_CHARS.contains(&b) => {
                i = scan_operator(bytes, i);
                TokenKind::Operator
            }
            _ => {
                i += 1;
                TokenKind::Punct
            }
        };

        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }

    Ok(tokens)
}

/// Returns the index just past the closing `*/`. Block comments nest.
fn skip_block_comment(bytes: &[u8], start: usize) -> Result<usize, LexError> {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => i += 1,
        }
    }
    Err(LexError::UnterminatedComment(start))
}

/// Scans a single-quoted body starting after the opening quote.
/// Returns the index past the closing quote.
fn scan_string(bytes: &[u8], mut i: usize, backslash_escapes: bool) -> Option<usize> {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if backslash_escapes => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn scan_quoted_ident(bytes: &[u8], mut i: usize) -> Option<usize> {
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// If `$tag$` starts at `start`, returns the index of its closing `$`.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if i < bytes.len() && bytes[i].is_ascii_digit() {
        return None;
    }
    while i < bytes.len() && bytes[i] != b'$' {
        if !is_ident_start(bytes[i]) && !bytes[i].is_ascii_digit() {
            return None;
        }
        i += 1;
    }
    (i < bytes.len()).then_some(i)
}

fn find_subslice(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    let digits = |bytes: &[u8], mut i: usize| {
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
            i += 1;
        }
        i
    };
    i = digits(bytes, i);
    if i < bytes.len() && bytes[i] == b'.' && bytes.get(i + 1) != Some(&b'.') {
        i = digits(bytes, i + 1);
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = digits(bytes, j);
        }
    }
    i
}

fn scan_operator(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && OPERATOR_CHARS.contains(&bytes[i]) {
        // A comment start terminates the operator.
        if i > start
            && ((bytes[i] == b'-' && bytes.get(i + 1) == Some(&b'-'))
                || (bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*')))
        {
            break;
        }
        i += 1;
    }
    let op = &bytes[start..i];
    if op.len() > 1 && !op.iter().any(|c| OPERATOR_SPECIAL.contains(c)) {
        while i - start > 1 && matches!(bytes[i - 1], b'+' | b'-') {
            i -= 1;
        }
    }
    i
}
