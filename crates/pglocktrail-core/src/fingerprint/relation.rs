//! Statement-level parsing for relation extraction.
//!
//! This is not a SQL grammar: it recognizes the statement kind and the
//! table positions that matter for lock analysis (DML targets and the
//! top-level FROM list of a SELECT), and rejects text that is not SQL.

use thiserror::Error;

use super::lexer::{LexError, Token, TokenKind, tokenize};

/// A (possibly schema-qualified) table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Plain table references of the top-level FROM list, in order.
    Select { from: Vec<TableRef> },
    Insert { target: TableRef },
    Update { target: TableRef },
    Delete { target: TableRef },
    /// Any other recognized statement (DDL, utility, VALUES, ...).
    Other { keyword: String },
}

impl Statement {
    /// The primary relation of the statement, if any.
    pub fn relation(&self) -> Option<&TableRef> {
        match self {
            Statement::Insert { target }
            | Statement::Update { target }
            | Statement::Delete { target } => Some(target),
            Statement::Select { from } => from.first(),
            Statement::Other { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("empty statement")]
    Empty,
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("expected {expected}, found {found:?}")]
    Unexpected {
        expected: &'static str,
        found: String,
    },
    #[error("unknown statement {0:?}")]
    UnknownStatement(String),
}

/// Statement keywords that are valid SQL but carry no extractable relation.
const OTHER_STATEMENTS: &[&str] = &[
    "ABORT", "ALTER", "ANALYZE", "BEGIN", "CALL", "CHECKPOINT", "CLOSE", "CLUSTER", "COMMENT",
    "COMMIT", "COPY", "CREATE", "DEALLOCATE", "DECLARE", "DISCARD", "DO", "DROP", "END",
    "EXECUTE", "EXPLAIN", "FETCH", "GRANT", "IMPORT", "LISTEN", "LOAD", "LOCK", "MERGE", "MOVE",
    "NOTIFY", "PREPARE", "REASSIGN", "REFRESH", "REINDEX", "RELEASE", "RESET", "REVOKE",
    "ROLLBACK", "SAVEPOINT", "SECURITY", "SET", "SHOW", "START", "TRUNCATE", "UNLISTEN",
    "VACUUM", "VALUES",
];

/// Keywords that end a SELECT's FROM list.
const FROM_TERMINATORS: &[&str] = &[
    "WHERE",
    "GROUP",
    "HAVING",
    "WINDOW",
    "ORDER",
    "LIMIT",
    "OFFSET",
    "FETCH",
    "FOR",
    "UNION",
    "INTERSECT",
    "EXCEPT",
    "RETURNING",
];

/// Parse every `;`-separated statement of `query`.
pub fn parse(query: &str) -> Result<Vec<Statement>, ParseError> {
    let tokens = tokenize(query)?;
    check_balanced(&tokens, query)?;

    let statements: Vec<Statement> = tokens
        .split(|t| t.is_punct(query, ";"))
        .filter(|s| !s.is_empty())
        .map(|s| Parser::new(query, s).statement())
        .collect::<Result<_, _>>()?;

    if statements.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(statements)
}

fn check_balanced(tokens: &[Token], src: &str) -> Result<(), ParseError> {
    let mut depth: i64 = 0;
    for t in tokens {
        if t.is_punct(src, "(") {
            depth += 1;
        } else if t.is_punct(src, ")") {
            depth -= 1;
            if depth < 0 {
                return Err(ParseError::UnbalancedParens);
            }
        }
    }
    if depth == 0 {
        Ok(())
    } else {
        Err(ParseError::UnbalancedParens)
    }
}

struct Parser<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            src,
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn found(&self) -> String {
        self.peek()
            .map(|t| t.text(self.src).to_string())
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn eat_word(&mut self, kw: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_word(self.src, kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, kw: &'static str) -> Result<(), ParseError> {
        if self.eat_word(kw) {
            Ok(())
        } else {
            Err(ParseError::Unexpected {
                expected: kw,
                found: self.found(),
            })
        }
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_punct(self.src, p)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skips a balanced `( ... )` group; the cursor must be on `(`.
    fn skip_group(&mut self) {
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            if t.is_punct(self.src, "(") {
                depth += 1;
            } else if t.is_punct(self.src, ")") {
                depth -= 1;
                if depth == 0 {
                    self.pos += 1;
                    return;
                }
            }
            self.pos += 1;
        }
    }

    fn statement(mut self) -> Result<Statement, ParseError> {
        // Parenthesized statements: `(SELECT ...)`.
        while self.eat_punct("(") {}

        if self.eat_word("WITH") {
            self.skip_cte_list()?;
        }

        let Some(first) = self.peek().copied() else {
            return Err(ParseError::Empty);
        };
        if first.kind != TokenKind::Word {
            return Err(ParseError::Unexpected {
                expected: "statement keyword",
                found: first.text(self.src).to_string(),
            });
        }
        let keyword = first.text(self.src).to_ascii_uppercase();
        self.pos += 1;

        match keyword.as_str() {
            "SELECT" | "TABLE" => Ok(Statement::Select {
                from: self.select_from(keyword == "TABLE"),
            }),
            "INSERT" => {
                self.expect_word("INTO")?;
                Ok(Statement::Insert {
                    target: self.table_name()?,
                })
            }
            "UPDATE" => {
                self.eat_word("ONLY");
                Ok(Statement::Update {
                    target: self.table_name()?,
                })
            }
            "DELETE" => {
                self.expect_word("FROM")?;
                self.eat_word("ONLY");
                Ok(Statement::Delete {
                    target: self.table_name()?,
                })
            }
            kw if OTHER_STATEMENTS.contains(&kw) => Ok(Statement::Other { keyword }),
            _ => Err(ParseError::UnknownStatement(keyword)),
        }
    }

    /// `[RECURSIVE] name [(cols)] AS [NOT] [MATERIALIZED] ( ... ) [, ...]`
    fn skip_cte_list(&mut self) -> Result<(), ParseError> {
        self.eat_word("RECURSIVE");
        loop {
            self.table_name()?;
            if self.peek().is_some_and(|t| t.is_punct(self.src, "(")) {
                self.skip_group();
            }
            self.expect_word("AS")?;
            self.eat_word("NOT");
            self.eat_word("MATERIALIZED");
            if !self.peek().is_some_and(|t| t.is_punct(self.src, "(")) {
                return Err(ParseError::Unexpected {
                    expected: "(",
                    found: self.found(),
                });
            }
            self.skip_group();
            if !self.eat_punct(",") {
                return Ok(());
            }
        }
    }

    /// Collects plain table references from the top-level FROM list.
    /// `TABLE name` is shorthand for `SELECT * FROM name`.
    fn select_from(&mut self, table_shorthand: bool) -> Vec<TableRef> {
        if table_shorthand {
            return self.table_name().into_iter().collect();
        }

        // Find FROM at depth zero.
        loop {
            let Some(t) = self.peek().copied() else {
                return Vec::new();
            };
            if t.is_punct(self.src, "(") {
                self.skip_group();
                continue;
            }
            self.pos += 1;
            if t.is_word(self.src, "FROM") {
                break;
            }
            if FROM_TERMINATORS.iter().any(|kw| t.is_word(self.src, kw)) {
                return Vec::new();
            }
        }

        let mut tables = Vec::new();
        let mut expect_item = true;
        while let Some(t) = self.peek().copied() {
            if FROM_TERMINATORS.iter().any(|kw| t.is_word(self.src, kw)) {
                break;
            }
            if t.is_punct(self.src, "(") {
                self.skip_group();
                expect_item = false;
                continue;
            }
            if t.is_punct(self.src, ",") || t.is_word(self.src, "JOIN") {
                self.pos += 1;
                expect_item = true;
                continue;
            }
            if expect_item && (t.is_word(self.src, "ONLY") || t.is_word(self.src, "LATERAL")) {
                self.pos += 1;
                continue;
            }
            if expect_item && matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent) {
                if let Ok(table) = self.table_name() {
                    // `name(...)` is a set-returning function, not a table.
                    if !self.peek().is_some_and(|n| n.is_punct(self.src, "(")) {
                        tables.push(table);
                    }
                }
                expect_item = false;
                continue;
            }
            self.pos += 1;
        }
        tables
    }

    /// `[schema.]name` with unquoted parts folded to lower case.
    fn table_name(&mut self) -> Result<TableRef, ParseError> {
        let mut parts = vec![self.name_part()?];
        while self.eat_punct(".") {
            parts.push(self.name_part()?);
        }
        let name = parts.pop().unwrap_or_default();
        Ok(TableRef {
            schema: parts.pop(),
            name,
        })
    }

    fn name_part(&mut self) -> Result<String, ParseError> {
        let Some(t) = self.peek().copied() else {
            return Err(ParseError::Unexpected {
                expected: "table name",
                found: "end of input".to_string(),
            });
        };
        let text = t.text(self.src);
        let part = match t.kind {
            TokenKind::Word => text.to_lowercase(),
            TokenKind::QuotedIdent => text[1..text.len() - 1].replace("\"\"", "\""),
            _ => {
                return Err(ParseError::Unexpected {
                    expected: "table name",
                    found: text.to_string(),
                });
            }
        };
        self.pos += 1;
        Ok(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_relation(q: &str) -> Option<String> {
        parse(q)
            .ok()?
            .iter()
            .find_map(|s| s.relation().map(|t| t.name.clone()))
    }

    #[test]
    fn test_dml_targets() {
        assert_eq!(
            first_relation("UPDATE accounts SET balance = 1 WHERE id = 2;"),
            Some("accounts".into())
        );
        assert_eq!(
            first_relation("DELETE FROM ONLY public.Orders WHERE id = 1"),
            Some("orders".into())
        );
        assert_eq!(
            first_relation("INSERT INTO \"Audit Log\" (a) VALUES (1)"),
            Some("Audit Log".into())
        );
    }

    #[test]
    fn test_schema_is_split() {
        let stmts = parse("UPDATE billing.invoices SET paid = true").unwrap();
        assert_eq!(
            stmts[0],
            Statement::Update {
                target: TableRef {
                    schema: Some("billing".into()),
                    name: "invoices".into(),
                }
            }
        );
    }

    #[test]
    fn test_select_from_list() {
        assert_eq!(
            first_relation("SELECT * FROM items i JOIN stock s ON s.id = i.id FOR UPDATE"),
            Some("items".into())
        );
        let stmts = parse("SELECT a FROM x, y WHERE x.id = y.id").unwrap();
        assert_eq!(
            stmts[0],
            Statement::Select {
                from: vec![
                    TableRef {
                        schema: None,
                        name: "x".into()
                    },
                    TableRef {
                        schema: None,
                        name: "y".into()
                    },
                ]
            }
        );
    }

    #[test]
    fn test_select_skips_subqueries_and_functions() {
        assert_eq!(
            first_relation("SELECT (SELECT max(id) FROM other) FROM generate_series(1, 3) g, real_t"),
            Some("real_t".into())
        );
        assert_eq!(first_relation("SELECT 1"), None);
    }

    #[test]
    fn test_with_prefix_skipped() {
        assert_eq!(
            first_relation(
                "WITH moved AS (DELETE FROM queue RETURNING *) INSERT INTO archive SELECT * FROM moved"
            ),
            Some("archive".into())
        );
    }

    #[test]
    fn test_other_statements_have_no_relation() {
        assert_eq!(first_relation("LOCK TABLE accounts IN EXCLUSIVE MODE"), None);
        assert!(matches!(
            parse("VACUUM accounts").unwrap()[0],
            Statement::Other { .. }
        ));
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            parse("this is not sql"),
            Err(ParseError::UnknownStatement(_))
        ));
        assert!(matches!(parse("UPDATE 42"), Err(ParseError::Unexpected { .. })));
        assert!(matches!(
            parse("SELECT (1"),
            Err(ParseError::UnbalancedParens)
        ));
        assert!(matches!(parse("   "), Err(ParseError::Empty)));
        assert!(matches!(parse("SELECT 'x"), Err(ParseError::Lex(_))));
    }
}
