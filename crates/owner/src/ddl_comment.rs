// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wraps TiDB specific table and column options of a DDL query into executable comments,
//! so that downstream MySQL compatible databases skip them while TiDB still applies them.
//!
//! The query text is otherwise preserved. Runs of whitespace are collapsed and a trailing
//! `;` is dropped. Options which already sit in an executable comment are unwrapped first
//! and annotated again.

#[derive(Debug, thiserror::Error)]
pub enum DdlCommentError {
    #[error("invalid ddlQuery statement size: {0}")]
    StatementCount(usize),
    #[error("unterminated {what} in ddl query")]
    Unterminated { what: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Space,
    Word(String),
    /// Backtick quoted identifier, quotes included.
    Quoted(String),
    Number(String),
    /// String literal, quotes included.
    Str(String),
    Comment(String),
    Punct(char),
    Semicolon,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Space => " ".to_owned(),
            Token::Word(text)
            | Token::Quoted(text)
            | Token::Number(text)
            | Token::Str(text)
            | Token::Comment(text) => text.clone(),
            Token::Punct(c) => c.to_string(),
            Token::Semicolon => ";".to_owned(),
        }
    }
}

pub fn add_special_comment(query: &str) -> Result<String, DdlCommentError> {
    let tokens = expand_executable_comments(tokenize(query)?)?;

    let statements = count_statements(&tokens);
    if statements != 1 {
        return Err(DdlCommentError::StatementCount(statements));
    }

    let tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|token| *token != Token::Semicolon)
        .collect();
    Ok(render(annotate(&tokens)))
}

fn tokenize(input: &str) -> Result<Vec<Token>, DdlCommentError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let take_while = |mut j: usize, pred: &dyn Fn(char) -> bool| {
        while j < chars.len() && pred(chars[j]) {
            j += 1;
        }
        j
    };
    let collect = |from: usize, to: usize| chars[from..to].iter().collect::<String>();

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => {
                i = take_while(i, &|c| c.is_whitespace());
                tokens.push(Token::Space);
            }
            '/' if next == Some('*') => {
                let end = (i + 2..chars.len().saturating_sub(1))
                    .find(|&j| chars[j] == '*' && chars[j + 1] == '/')
                    .ok_or(DdlCommentError::Unterminated { what: "comment" })?;
                tokens.push(Token::Comment(collect(i, end + 2)));
                i = end + 2;
            }
            '#' => {
                i = take_while(i, &|c| c != '\n');
                tokens.push(Token::Space);
            }
            '-' if next == Some('-')
                && chars.get(i + 2).map_or(true, |c| c.is_whitespace()) =>
            {
                i = take_while(i, &|c| c != '\n');
                tokens.push(Token::Space);
            }
            '`' | '\'' | '"' => {
                let end = closing_quote(&chars, i)?;
                let text = collect(i, end + 1);
                tokens.push(if c == '`' {
                    Token::Quoted(text)
                } else {
                    Token::Str(text)
                });
                i = end + 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let end = take_while(i, &|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
                tokens.push(Token::Number(collect(i, end)));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let end = take_while(i, &|c| c.is_alphanumeric() || c == '_' || c == '$');
                tokens.push(Token::Word(collect(i, end)));
                i = end;
            }
            other => {
                tokens.push(Token::Punct(other));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

/// Index of the quote closing the quoted token starting at `open`.
fn closing_quote(chars: &[char], open: usize) -> Result<usize, DdlCommentError> {
    let quote = chars[open];
    let mut j = open + 1;
    while j < chars.len() {
        match chars[j] {
            '\\' if quote != '`' => j += 2,
            c if c == quote => {
                // doubled quotes escape themselves
                if chars.get(j + 1) == Some(&quote) {
                    j += 2;
                } else {
                    return Ok(j);
                }
            }
            _ => j += 1,
        }
    }
    Err(DdlCommentError::Unterminated {
        what: if quote == '`' {
            "identifier"
        } else {
            "string literal"
        },
    })
}

/// Content of an executable comment (`/*T![feature] ..*/`, `/*T! ..*/`, `/*!50100 ..*/`).
fn executable_body(comment: &str) -> Option<&str> {
    let inner = comment.strip_prefix("/*")?.strip_suffix("*/")?;
    if let Some(rest) = inner.strip_prefix("T![") {
        rest.split_once(']').map(|(_, body)| body)
    } else if let Some(rest) = inner.strip_prefix("T!") {
        Some(rest)
    } else {
        inner
            .strip_prefix('!')
            .map(|rest| rest.trim_start_matches(|c: char| c.is_ascii_digit()))
    }
}

/// Replaces executable comments by their tokens and drops all other comments.
fn expand_executable_comments(tokens: Vec<Token>) -> Result<Vec<Token>, DdlCommentError> {
    let mut expanded = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::Comment(comment) => {
                expanded.push(Token::Space);
                if let Some(body) = executable_body(&comment) {
                    expanded.extend(expand_executable_comments(tokenize(body)?)?);
                    expanded.push(Token::Space);
                }
            }
            other => expanded.push(other),
        }
    }
    Ok(expanded)
}

fn count_statements(tokens: &[Token]) -> usize {
    let mut statements = 0;
    let mut has_content = false;
    for token in tokens {
        match token {
            Token::Semicolon => {
                statements += usize::from(has_content);
                has_content = false;
            }
            Token::Space | Token::Comment(_) => {}
            _ => has_content = true,
        }
    }
    statements + usize::from(has_content)
}

struct Piece {
    text: String,
    space_before: bool,
}

fn annotate(tokens: &[Token]) -> Vec<Piece> {
    let mut pieces: Vec<Piece> = Vec::with_capacity(tokens.len());
    let mut space = false;
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == Token::Space {
            space = true;
            i += 1;
            continue;
        }

        if let Some((comment, next)) = special_comment(tokens, i, pieces.last()) {
            pieces.push(Piece {
                text: comment,
                space_before: true,
            });
            i = next;
        } else {
            pieces.push(Piece {
                text: tokens[i].text(),
                space_before: space,
            });
            i += 1;
        }
        space = false;
    }
    pieces
}

fn render(pieces: Vec<Piece>) -> String {
    let mut out = String::new();
    for piece in pieces {
        if piece.space_before && !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&piece.text);
    }
    out
}

fn next_significant(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&j| tokens[j] != Token::Space)
}

/// Matches `<option> [=] <number>` with the option at `at`.
fn option_value(tokens: &[Token], at: usize) -> Option<(String, usize)> {
    let mut j = next_significant(tokens, at + 1)?;
    if tokens[j] == Token::Punct('=') {
        j = next_significant(tokens, j + 1)?;
    }
    match &tokens[j] {
        Token::Number(value) => Some((value.clone(), j + 1)),
        _ => None,
    }
}

/// Matches `AUTO_RANDOM[(n[, m])]` with the keyword at `at`.
fn auto_random_args(tokens: &[Token], at: usize) -> Option<(Vec<String>, usize)> {
    let Some(open) = next_significant(tokens, at + 1).filter(|&j| tokens[j] == Token::Punct('('))
    else {
        return Some((Vec::new(), at + 1));
    };

    let mut args = Vec::new();
    let mut j = open + 1;
    loop {
        j = next_significant(tokens, j)?;
        match &tokens[j] {
            Token::Number(arg) => args.push(arg.clone()),
            Token::Punct(',') => {}
            Token::Punct(')') if !args.is_empty() => return Some((args, j + 1)),
            _ => return None,
        }
        j += 1;
    }
}

/// The executable comment replacing the tokens starting at `at`, plus the index of the
/// first token after them.
fn special_comment(tokens: &[Token], at: usize, previous: Option<&Piece>) -> Option<(String, usize)> {
    let Token::Word(word) = &tokens[at] else {
        return None;
    };
    let keyword = word.to_ascii_uppercase();
    match keyword.as_str() {
        "SHARD_ROW_ID_BITS" | "PRE_SPLIT_REGIONS" => option_value(tokens, at)
            .map(|(value, next)| (format!("/*T! {keyword} = {value} */"), next)),
        "AUTO_RANDOM_BASE" => option_value(tokens, at).map(|(value, next)| {
            (
                format!("/*T![auto_rand_base] {keyword} = {value} */"),
                next,
            )
        }),
        "AUTO_ID_CACHE" => option_value(tokens, at).map(|(value, next)| {
            (format!("/*T![auto_id_cache] {keyword} = {value} */"), next)
        }),
        "AUTO_RANDOM" => auto_random_args(tokens, at).map(|(args, next)| {
            if args.is_empty() {
                (format!("/*T![auto_rand] {keyword} */"), next)
            } else {
                (
                    format!("/*T![auto_rand] {keyword}({}) */", args.join(", ")),
                    next,
                )
            }
        }),
        "CLUSTERED" | "NONCLUSTERED" => previous
            .filter(|piece| piece.text == ")" || piece.text.eq_ignore_ascii_case("KEY"))
            .map(|_| (format!("/*T![clustered_index] {keyword} */"), at + 1)),
        "FORCE" => next_significant(tokens, at + 1)
            .filter(|&j| {
                matches!(&tokens[j], Token::Word(next) if next.eq_ignore_ascii_case("AUTO_INCREMENT"))
            })
            .map(|_| ("/*T![force_inc] FORCE */".to_owned(), at + 1)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    #[test]
    fn wraps_table_options() {
        let cases = [
            (
                "create table t1 (id int ) shard_row_id_bits=2;",
                "create table t1 (id int ) /*T! SHARD_ROW_ID_BITS = 2 */",
            ),
            (
                "create table t1 (id int ) shard_row_id_bits=2 pre_split_regions=2;",
                "create table t1 (id int ) /*T! SHARD_ROW_ID_BITS = 2 */ /*T! PRE_SPLIT_REGIONS = 2 */",
            ),
            (
                "create table t (a int) auto_id_cache = 10",
                "create table t (a int) /*T![auto_id_cache] AUTO_ID_CACHE = 10 */",
            ),
            (
                "create table t (a bigint primary key auto_random) auto_random_base 100",
                "create table t (a bigint primary key /*T![auto_rand] AUTO_RANDOM */) /*T![auto_rand_base] AUTO_RANDOM_BASE = 100 */",
            ),
        ];
        for (query, expected) in cases {
            assert_eq!(add_special_comment(query).unwrap(), expected);
        }
    }

    #[test]
    fn wraps_column_options() {
        assert_eq!(
            add_special_comment("create table t1 (id int primary key auto_random(2));").unwrap(),
            "create table t1 (id int primary key /*T![auto_rand] AUTO_RANDOM(2) */)"
        );
        assert_eq!(
            add_special_comment("CREATE TABLE t (a INT, b INT, PRIMARY KEY (a, b) NONCLUSTERED)")
                .unwrap(),
            "CREATE TABLE t (a INT, b INT, PRIMARY KEY (a, b) /*T![clustered_index] NONCLUSTERED */)"
        );
        assert_eq!(
            add_special_comment("create table t1 (id int primary key clustered)").unwrap(),
            "create table t1 (id int primary key /*T![clustered_index] CLUSTERED */)"
        );
        assert_eq!(
            add_special_comment("alter table t force auto_increment = 12").unwrap(),
            "alter table t /*T![force_inc] FORCE */ auto_increment = 12"
        );
    }

    #[test]
    fn existing_executable_comments_are_reannotated() {
        assert_eq!(
            add_special_comment("create table t1 (id int) /*T! SHARD_ROW_ID_BITS=2 */").unwrap(),
            "create table t1 (id int) /*T! SHARD_ROW_ID_BITS = 2 */"
        );
        assert_eq!(
            add_special_comment(
                "create table t (a int primary key /*T![auto_rand] auto_random(3, 32) */)"
            )
            .unwrap(),
            "create table t (a int primary key /*T![auto_rand] AUTO_RANDOM(3, 32) */ )"
        );
        assert_eq!(
            add_special_comment("CREATE TABLE t (id INT) /*!50100 ENGINE=InnoDB */ -- trailing")
                .unwrap(),
            "CREATE TABLE t (id INT) ENGINE=InnoDB"
        );
    }

    #[test]
    fn literals_are_kept_verbatim() {
        assert_eq!(
            add_special_comment(
                "create table `shard_row_id_bits` (a varchar(10) default 'x;  y') comment='clustered'"
            )
            .unwrap(),
            "create table `shard_row_id_bits` (a varchar(10) default 'x;  y') comment='clustered'"
        );
        assert_eq!(
            add_special_comment("CREATE DATABASE `test1`").unwrap(),
            "CREATE DATABASE `test1`"
        );
    }

    #[test]
    fn statement_count_must_be_one() {
        let err = add_special_comment("create table t1 (id int); create table t2 (id int);")
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid ddlQuery statement size: 2");
        assert!(matches!(
            add_special_comment("  ; "),
            Err(DdlCommentError::StatementCount(0))
        ));
        assert_that!(add_special_comment("select 1;;").is_ok(), eq(true));
    }

    #[test]
    fn unterminated_input_is_rejected() {
        assert!(matches!(
            add_special_comment("create table t (a int) comment='oops"),
            Err(DdlCommentError::Unterminated { .. })
        ));
        assert!(matches!(
            add_special_comment("create table t (a int) /* never closed"),
            Err(DdlCommentError::Unterminated { .. })
        ));
    }
}
