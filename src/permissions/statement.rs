//! SQL statement analysis for the permission rewriter.
//!
//! Statements are lexed with the configured dialect's tokenizer. Each
//! significant token carries its byte span and parenthesis depth, which is
//! enough to classify the statement, find the tables it operates on at the
//! top level and locate clause boundaries for the filter splice. The full
//! parse is used to account for every relation the statement reads, so a
//! table the token walk does not see as a target is still checked.

use std::ops::ControlFlow;

use sqlparser::ast::{self, ObjectName, Query, SetExpr, Visit, Visitor};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Token as SqlToken, Tokenizer, Whitespace};

use crate::error::PermissionError;
use crate::permissions::model::{Operation, SqlDialect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier, keyword or number.
    Word,
    /// Quoted identifier; text holds the inner name.
    QuotedIdent,
    /// String literal; text holds the raw source.
    Literal,
    Punct(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Parenthesis depth; both parentheses of a pair sit at the outer depth.
    pub depth: usize,
}

impl Token {
    fn is_word(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    fn is_name(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }
}

/// Words that end a table reference instead of being read as its alias.
const NON_ALIAS_WORDS: &[&str] = &[
    "AS", "CROSS", "EXCEPT", "FETCH", "FOR", "FROM", "FULL", "GROUP", "HAVING", "INNER",
    "INTERSECT", "JOIN", "LATERAL", "LEFT", "LIMIT", "NATURAL", "OFFSET", "ON", "ORDER", "OUTER",
    "RETURNING", "RIGHT", "SELECT", "SET", "UNION", "USING", "VALUES", "WHERE", "WINDOW",
];

const SET_OPERATIONS: &[&str] = &["UNION", "INTERSECT", "EXCEPT"];

/// Single-word clauses that follow the WHERE clause.
const TRAILING_CLAUSES: &[&str] = &[
    "HAVING", "WINDOW", "LIMIT", "OFFSET", "FETCH", "FOR", "RETURNING",
];

fn parser_dialect(dialect: SqlDialect) -> Box<dyn Dialect> {
    match dialect {
        SqlDialect::MySql => Box::new(MySqlDialect {}),
        SqlDialect::PostgreSql => Box::new(PostgreSqlDialect {}),
        SqlDialect::Generic => Box::new(GenericDialect {}),
    }
}

/// Split `sql` into significant tokens using `dialect`'s lexical rules.
///
/// Whitespace and comments are dropped, so a token's `end` is exact and text
/// spliced after it cannot land inside a comment. Constructs the server
/// would read differently from the tokenizer are refused.
pub fn tokenize(sql: &str, dialect: SqlDialect) -> Result<Vec<Token>, PermissionError> {
    let lexer = parser_dialect(dialect);
    let raw = Tokenizer::new(&*lexer, sql)
        .tokenize_with_location()
        .map_err(|e| PermissionError::denied(format!("Malformed statement: {e}")))?;

    let index = LineIndex::new(sql);
    let starts: Vec<usize> = raw.iter().map(|t| index.offset(&t.location)).collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;

    for (idx, item) in raw.iter().enumerate() {
        let start = starts[idx];
        let end = starts.get(idx + 1).copied().unwrap_or(sql.len());
        let source = sql.get(start..end).unwrap_or_default();

        if dialect == SqlDialect::MySql {
            if let Some(reason) = mysql_hazard(&item.token, source) {
                return Err(PermissionError::denied(reason));
            }
        }

        let kind = match &item.token {
            SqlToken::Whitespace(_) | SqlToken::EOF => continue,
            SqlToken::Word(word) if word.quote_style.is_some() => {
                tokens.push(Token {
                    kind: TokenKind::QuotedIdent,
                    text: word.value.clone(),
                    start,
                    end,
                    depth,
                });
                continue;
            }
            SqlToken::Word(_) | SqlToken::Number(..) => TokenKind::Word,
            SqlToken::SingleQuotedString(_)
            | SqlToken::DoubleQuotedString(_)
            | SqlToken::NationalStringLiteral(_)
            | SqlToken::EscapedStringLiteral(_)
            | SqlToken::HexStringLiteral(_) => TokenKind::Literal,
            SqlToken::LParen => TokenKind::Punct('('),
            SqlToken::RParen => TokenKind::Punct(')'),
            SqlToken::Comma => TokenKind::Punct(','),
            SqlToken::Period => TokenKind::Punct('.'),
            SqlToken::SemiColon => TokenKind::Punct(';'),
            _ => TokenKind::Punct(source.chars().next().unwrap_or_default()),
        };

        if kind == TokenKind::Punct(')') {
            depth = depth.saturating_sub(1);
        }
        tokens.push(Token {
            kind,
            text: source.to_string(),
            start,
            end,
            depth,
        });
        if kind == TokenKind::Punct('(') {
            depth += 1;
        }
    }

    Ok(tokens)
}

/// MySQL constructs the tokenizer can read differently from the
/// server: `#` comments, `--` not followed by whitespace, executable
/// `/*! */` comments and backslash escapes.
fn mysql_hazard(token: &SqlToken, source: &str) -> Option<&'static str> {
    match token {
        SqlToken::Whitespace(Whitespace::SingleLineComment { prefix, comment }) => {
            if prefix.starts_with('#') {
                Some("Statement contains a '#' comment")
            } else if comment.chars().next().is_some_and(|c| !c.is_whitespace()) {
                Some("Statement contains a '--' sequence that MySQL does not read as a comment")
            } else {
                None
            }
        }
        SqlToken::Whitespace(Whitespace::MultiLineComment(body)) if body.starts_with('!') => {
            Some("Statement contains an executable comment")
        }
        SqlToken::Whitespace(_) | SqlToken::EOF => None,
        SqlToken::Sharp => Some("Statement contains a '#' comment"),
        _ if source.contains('\\') => Some("Backslash escapes are not supported"),
        _ => None,
    }
}

/// Converts tokenizer locations (1-based line and character column) into
/// byte offsets.
struct LineIndex<'a> {
    sql: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(sql: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { sql, line_starts }
    }

    fn offset(&self, location: &Location) -> usize {
        let line = usize::try_from(location.line).unwrap_or(usize::MAX);
        let Some(&line_start) = line.checked_sub(1).and_then(|l| self.line_starts.get(l)) else {
            return self.sql.len();
        };
        let column = usize::try_from(location.column).unwrap_or(usize::MAX);
        self.sql[line_start..]
            .char_indices()
            .nth(column.saturating_sub(1))
            .map_or(self.sql.len(), |(i, _)| line_start + i)
    }
}

/// Every relation a parsed statement names, in visiting order, including
/// the `TABLE name` query form.
#[derive(Default)]
struct RelationCollector {
    names: Vec<String>,
    unnamed: bool,
}

impl RelationCollector {
    fn collect_table_bodies(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Table(table) => match &table.table_name {
                Some(name) => self.names.push(name.clone()),
                None => self.unnamed = true,
            },
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_table_bodies(left);
                self.collect_table_bodies(right);
            }
            _ => {}
        }
    }
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.collect_table_bodies(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        match relation.0.last() {
            Some(ident) => self.names.push(ident.value.clone()),
            None => self.unnamed = true,
        }
        ControlFlow::Continue(())
    }
}

/// Parse `sql` as exactly one statement of kind `operation` and return every
/// relation it names.
fn parsed_relations(
    sql: &str,
    dialect: SqlDialect,
    operation: Operation,
) -> Result<Vec<String>, PermissionError> {
    let parser = parser_dialect(dialect);
    let statements = Parser::parse_sql(&*parser, sql)
        .map_err(|e| PermissionError::denied(format!("Unable to parse statement: {e}")))?;
    let [statement] = statements.as_slice() else {
        return Err(PermissionError::denied("Multiple statements are not allowed"));
    };

    let matches_operation = match (operation, statement) {
        (Operation::Select, ast::Statement::Query(_)) => true,
        (Operation::Insert, ast::Statement::Insert { .. }) => true,
        (Operation::Update, ast::Statement::Update { .. }) => true,
        (Operation::Delete, ast::Statement::Delete { .. }) => true,
        _ => false,
    };
    if !matches_operation {
        return Err(PermissionError::denied(format!(
            "Unsupported statement type: {operation}"
        )));
    }

    let mut collector = RelationCollector::default();
    let _ = statement.visit(&mut collector);
    if collector.unnamed {
        return Err(PermissionError::denied("Could not determine table name"));
    }
    Ok(collector.names)
}

/// A table named by a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Unqualified, unquoted name as written.
    pub name: String,
}

/// A classified single statement with the tables it touches.
#[derive(Debug, Clone)]
pub struct Statement<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    pub operation: Operation,
    /// Tables the statement operates on at the top level; these receive row
    /// filters.
    pub targets: Vec<TableRef>,
    /// Every other relation the statement names: sub-queries, set-operation
    /// branches (including `TABLE name`), `UPDATE ... FROM` and
    /// `INSERT ... SELECT` sources.
    pub reads: Vec<TableRef>,
}

impl<'a> Statement<'a> {
    /// Classify `sql` under `dialect`. Blank input yields `Ok(None)`.
    pub fn parse(sql: &'a str, dialect: SqlDialect) -> Result<Option<Self>, PermissionError> {
        let tokens = tokenize(sql, dialect)?;
        let Some(first) = tokens.first() else {
            return Ok(None);
        };

        let operation = match first.kind {
            TokenKind::Word => first.text.parse::<Operation>().map_err(|_| {
                PermissionError::denied(format!(
                    "Unsupported statement type: {}",
                    first.text.to_ascii_uppercase()
                ))
            })?,
            _ => {
                return Err(PermissionError::denied(format!(
                    "Unsupported statement type: {}",
                    first.text
                )));
            }
        };

        check_well_formed(&tokens)?;
        if let Some(semi) = tokens.iter().position(|t| t.depth == 0 && t.is_punct(';')) {
            if tokens[semi + 1..].iter().any(|t| !t.is_punct(';')) {
                return Err(PermissionError::denied("Multiple statements are not allowed"));
            }
        }
        let relations = parsed_relations(sql, dialect, operation)?;

        let mut statement = Self {
            sql,
            tokens,
            operation,
            targets: Vec::new(),
            reads: Vec::new(),
        };
        statement.targets = statement.collect_targets()?;
        statement.reads = claim_targets(&statement.targets, relations);
        Ok(Some(statement))
    }

    pub fn sql(&self) -> &'a str {
        self.sql
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Index of the first top-level set operation, or the token count.
    fn top_level_end(&self) -> usize {
        self.tokens
            .iter()
            .position(|t| t.depth == 0 && SET_OPERATIONS.iter().any(|op| t.is_word(op)))
            .unwrap_or(self.tokens.len())
    }

    /// Tables operated on at the top level of the first query block.
    fn collect_targets(&self) -> Result<Vec<TableRef>, PermissionError> {
        let top_end = self.top_level_end();
        let mut targets = Vec::new();

        match self.operation {
            Operation::Update => {
                let at = skip_words(&self.tokens, 1, &["ONLY"]);
                let (name, _) = table_name(&self.tokens, at)
                    .ok_or_else(|| PermissionError::denied("Could not determine target table"))?;
                targets.push(TableRef { name });
            }
            Operation::Insert => {
                let at = skip_words(&self.tokens, 1, &["IGNORE", "INTO"]);
                let (name, _) = table_name(&self.tokens, at)
                    .ok_or_else(|| PermissionError::denied("Could not determine target table"))?;
                targets.push(TableRef { name });
            }
            Operation::Select | Operation::Delete => {}
        }

        let mut seen_top_from = false;
        for (idx, token) in self.tokens.iter().enumerate() {
            if token.depth != 0 || idx >= top_end {
                continue;
            }
            let is_from = token.is_word("FROM");
            if !is_from && !token.is_word("JOIN") {
                continue;
            }
            let is_target = match self.operation {
                Operation::Select => true,
                Operation::Delete => !is_from || !seen_top_from,
                Operation::Update => !is_from,
                Operation::Insert => false,
            };
            if is_from {
                seen_top_from = true;
            }
            if is_target {
                let names = table_list(&self.tokens, idx + 1, is_from);
                targets.extend(names.into_iter().map(|name| TableRef { name }));
            }
        }

        if self.operation == Operation::Delete && targets.is_empty() {
            return Err(PermissionError::denied("Could not determine target table"));
        }
        Ok(targets)
    }

    /// Top-level `WHERE` of the first query block, as a token index.
    fn where_index(&self) -> Option<usize> {
        let end = self.top_level_end();
        self.tokens[..end]
            .iter()
            .position(|t| t.depth == 0 && t.is_word("WHERE"))
    }

    /// Index of the first top-level clause token that must stay after the
    /// WHERE clause, searching from token `from`.
    fn boundary_after(&self, from: usize) -> Option<usize> {
        let tokens = &self.tokens;
        tokens
            .iter()
            .enumerate()
            .skip(from)
            .find(|(idx, t)| {
                if t.depth != 0 {
                    return false;
                }
                let followed_by_by = tokens.get(idx + 1).is_some_and(|n| n.is_word("BY"));
                ((t.is_word("ORDER") || t.is_word("GROUP")) && followed_by_by)
                    || TRAILING_CLAUSES.iter().any(|kw| t.is_word(kw))
                    || SET_OPERATIONS.iter().any(|op| t.is_word(op))
                    || t.is_punct(';')
            })
            .map(|(idx, _)| idx)
    }

    /// Where to look for trailing clauses when there is no WHERE: past the
    /// top-level `FROM` (or `SET` for UPDATE), so select-list columns named
    /// like clause keywords are not mistaken for clauses.
    fn clause_search_start(&self) -> usize {
        let anchor = match self.operation {
            Operation::Update => "SET",
            _ => "FROM",
        };
        self.tokens
            .iter()
            .position(|t| t.depth == 0 && t.is_word(anchor))
            .map_or(1, |idx| idx + 1)
    }

    /// Byte offset just past the last token before token `idx`. Trailing
    /// comments are cut off so they cannot swallow appended text.
    fn end_before(&self, idx: usize) -> usize {
        idx.checked_sub(1)
            .and_then(|prev| self.tokens.get(prev))
            .map_or(0, |t| t.end)
    }

    /// Conjoin `filter` with the top-level WHERE clause, inserting one if
    /// needed. The existing predicate is parenthesised.
    pub fn splice_filter(&self, filter: &str) -> Result<String, PermissionError> {
        let sql = self.sql;
        let (insert_from, boundary) = match self.where_index() {
            Some(where_idx) => (where_idx + 1, self.boundary_after(where_idx + 1)),
            None => {
                let from = self.clause_search_start();
                (from, self.boundary_after(from))
            }
        };
        let boundary = boundary.unwrap_or(self.tokens.len());
        let head_end = self.end_before(boundary);
        let rest = self.tokens.get(boundary).map_or("", |t| &sql[t.start..]);

        let mut out = match self.where_index() {
            Some(where_idx) => {
                let body_start = self.tokens[where_idx].end;
                if boundary <= insert_from {
                    return Err(PermissionError::denied("Malformed WHERE clause"));
                }
                let body = sql[body_start..head_end].trim();
                format!("{} ({body}) AND {filter}", &sql[..body_start])
            }
            None => format!("{} WHERE {filter}", &sql[..head_end]),
        };
        append_rest(&mut out, rest);
        Ok(out)
    }
}

fn check_well_formed(tokens: &[Token]) -> Result<(), PermissionError> {
    let mut open = 0usize;
    for token in tokens {
        if token.is_punct('(') {
            open += 1;
        } else if token.is_punct(')') {
            open = open
                .checked_sub(1)
                .ok_or_else(|| PermissionError::denied("Unbalanced parentheses"))?;
        }
    }
    if open != 0 {
        return Err(PermissionError::denied("Unbalanced parentheses"));
    }
    Ok(())
}

/// Match each target against one parsed relation occurrence; whatever is
/// left over is only read.
fn claim_targets(targets: &[TableRef], relations: Vec<String>) -> Vec<TableRef> {
    let mut unclaimed: Vec<&TableRef> = targets.iter().collect();
    let mut reads = Vec::new();
    for name in relations {
        match unclaimed
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                unclaimed.remove(pos);
            }
            None => reads.push(TableRef { name }),
        }
    }
    reads
}

fn append_rest(out: &mut String, rest: &str) {
    let rest = rest.trim_start();
    if rest.is_empty() {
        return;
    }
    if !rest.starts_with(';') {
        out.push(' ');
    }
    out.push_str(rest);
}

fn skip_words(tokens: &[Token], mut at: usize, words: &[&str]) -> usize {
    while tokens
        .get(at)
        .is_some_and(|t| words.iter().any(|w| t.is_word(w)))
    {
        at += 1;
    }
    at
}

/// Possibly qualified name at `at`; returns the last segment and the index
/// after the name.
fn table_name(tokens: &[Token], at: usize) -> Option<(String, usize)> {
    let first = tokens.get(at)?;
    if !first.is_name() || (first.kind == TokenKind::Word && is_non_alias(&first.text)) {
        return None;
    }
    let mut name = first.text.clone();
    let mut next = at + 1;
    while tokens.get(next).is_some_and(|t| t.is_punct('.'))
        && tokens.get(next + 1).is_some_and(Token::is_name)
    {
        name = tokens[next + 1].text.clone();
        next += 2;
    }
    Some((name, next))
}

/// Table names following a `FROM` (comma list) or `JOIN` (single).
/// Derived tables are skipped; the parse reports what they read.
fn table_list(tokens: &[Token], mut at: usize, allow_list: bool) -> Vec<String> {
    let mut names = Vec::new();
    loop {
        at = skip_words(tokens, at, &["ONLY", "LATERAL"]);
        let Some(token) = tokens.get(at) else {
            break;
        };
        if token.is_punct('(') {
            at = matching_paren(tokens, at) + 1;
        } else if let Some((name, next)) = table_name(tokens, at) {
            names.push(name);
            at = next;
        } else {
            break;
        }
        at = skip_alias(tokens, at);
        if allow_list && tokens.get(at).is_some_and(|t| t.is_punct(',')) {
            at += 1;
            continue;
        }
        break;
    }
    names
}

fn skip_alias(tokens: &[Token], at: usize) -> usize {
    match tokens.get(at) {
        Some(t) if t.is_word("AS") => {
            if tokens.get(at + 1).is_some_and(Token::is_name) {
                at + 2
            } else {
                at + 1
            }
        }
        Some(t) if t.kind == TokenKind::QuotedIdent => at + 1,
        Some(t) if t.kind == TokenKind::Word && !is_non_alias(&t.text) => at + 1,
        _ => at,
    }
}

fn matching_paren(tokens: &[Token], open: usize) -> usize {
    let depth = tokens[open].depth;
    tokens
        .iter()
        .enumerate()
        .skip(open + 1)
        .find(|(_, t)| t.depth == depth && t.is_punct(')'))
        .map_or(tokens.len(), |(idx, _)| idx)
}

fn is_non_alias(word: &str) -> bool {
    NON_ALIAS_WORDS.iter().any(|w| w.eq_ignore_ascii_case(word))
}
