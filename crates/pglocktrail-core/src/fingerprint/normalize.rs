//! Literal normalization of SQL text.
//!
//! Replaces constants with positional placeholders (`$1`, `$2`, ...) so that
//! `WHERE id = 1` and `WHERE id = 2` produce the same text. Whitespace and
//! comments between tokens collapse to a single space; the original spelling
//! of everything else is kept.

use super::lexer::{LexError, Token, TokenKind, tokenize};

/// Keywords after which a `-` starts a negative constant rather than a subtraction.
const UNARY_CONTEXT_KEYWORDS: &[&str] = &[
    "SELECT", "WHERE", "AND", "OR", "NOT", "SET", "VALUES", "THEN", "ELSE", "WHEN", "BY", "IN",
    "IS", "AS", "LIKE", "BETWEEN", "LIMIT", "OFFSET", "RETURN", "ON", "CASE",
];

/// Normalize a query, failing only when it cannot be tokenized.
pub fn normalize(query: &str) -> Result<String, LexError> {
    let tokens = tokenize(query)?;

    // Placeholders continue after the highest existing parameter. Once the
    // numbering is exhausted, remaining literals are kept as written.
    let mut next_param = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Param)
        .filter_map(|t| t.text(query)[1..].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        .checked_add(1);

    let mut out = String::with_capacity(query.len());
    let mut prev: Option<Token> = None;
    let mut i = 0;

    while i < tokens.len() {
        let tok = tokens[i];
        if let Some(p) = prev
            && tok.start > p.end
        {
            out.push(' ');
        }

        let folds_negative = next_param.is_some()
            && tok.kind == TokenKind::Operator
            && tok.text(query) == "-"
            && tokens
                .get(i + 1)
                .is_some_and(|n| n.kind == TokenKind::Number && n.start == tok.end)
            && starts_operand(prev, query);

        if folds_negative {
            push_param(&mut out, &mut next_param);
            prev = Some(tokens[i + 1]);
            i += 2;
            continue;
        }

        match tok.kind {
            TokenKind::String | TokenKind::Number if next_param.is_some() => {
                push_param(&mut out, &mut next_param);
            }
            _ => out.push_str(tok.text(query)),
        }
        prev = Some(tok);
        i += 1;
    }

    Ok(out)
}

fn push_param(out: &mut String, next_param: &mut Option<u32>) {
    if let Some(n) = *next_param {
        out.push('$');
        out.push_str(&n.to_string());
        *next_param = n.checked_add(1);
    }
}

/// True when the token after `prev` begins an operand (so `-` is unary).
fn starts_operand(prev: Option<Token>, src: &str) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    match prev.kind {
        TokenKind::Operator => true,
        TokenKind::Punct => !matches!(prev.text(src), ")" | "]"),
        TokenKind::Word => UNARY_CONTEXT_KEYWORDS
            .iter()
            .any(|kw| prev.text(src).eq_ignore_ascii_case(kw)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_literals() {
        assert_eq!(
            normalize("UPDATE accounts SET balance = balance - 10 WHERE id = 2").unwrap(),
            "UPDATE accounts SET balance = balance - $1 WHERE id = $2"
        );
        assert_eq!(
            normalize("SELECT * FROM t WHERE name = 'bob' AND x IN (1, 2.5)").unwrap(),
            "SELECT * FROM t WHERE name = $1 AND x IN ($2, $3)"
        );
    }

    #[test]
    fn test_keeps_spacing_style() {
        assert_eq!(
            normalize("SELECT * FROM t WHERE id=1").unwrap(),
            "SELECT * FROM t WHERE id=$1"
        );
    }

    #[test]
    fn test_collapses_whitespace_and_comments() {
        assert_eq!(
            normalize("SELECT  a\n\t FROM /* hint */ t").unwrap(),
            "SELECT a FROM t"
        );
    }

    #[test]
    fn test_negative_constants() {
        assert_eq!(
            normalize("SELECT * FROM t WHERE id = -5").unwrap(),
            "SELECT * FROM t WHERE id = $1"
        );
        assert_eq!(
            normalize("SELECT a-1 FROM t").unwrap(),
            "SELECT a-$1 FROM t"
        );
    }

    #[test]
    fn test_continues_after_existing_params() {
        assert_eq!(
            normalize("SELECT * FROM t WHERE a = $2 AND b = 'x'").unwrap(),
            "SELECT * FROM t WHERE a = $2 AND b = $3"
        );
    }

    #[test]
    fn test_highest_param_number_keeps_literals() {
        assert_eq!(
            normalize("SELECT * FROM t WHERE a = $4294967295 AND b = 'x' AND c = -1").unwrap(),
            "SELECT * FROM t WHERE a = $4294967295 AND b = 'x' AND c = -1"
        );
        assert_eq!(
            normalize("SELECT * FROM t WHERE a = $4294967294 AND b = 1 AND c = 2").unwrap(),
            "SELECT * FROM t WHERE a = $4294967294 AND b = $4294967295 AND c = 2"
        );
    }

    #[test]
    fn test_casts_and_identifiers_kept() {
        assert_eq!(
            normalize(r#"SELECT "Col" FROM s.t WHERE d > '2024-01-01'::date"#).unwrap(),
            r#"SELECT "Col" FROM s.t WHERE d > $1::date"#
        );
    }

    #[test]
    fn test_unterminated_is_error() {
        assert!(normalize("SELECT 'oops").is_err());
    }
}
