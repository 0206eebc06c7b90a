//! Tokenizer for the condition-expression language.
//!
//! Produces a flat token list with byte offsets; the parser reports errors
//! against those offsets. The token set is closed: anything outside it is an
//! `ExprParse` error, never a silent skip.

use arbiter_contracts::error::{ArbiterError, ArbiterResult};

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Double(f64),
    Str(String),
    True,
    False,
    Null,
    In,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,

    AndAnd,
    OrOr,
    Bang,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Colon,
}

/// A token plus the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn parse_error(message: impl Into<String>, offset: usize) -> ArbiterError {
    ArbiterError::ExprParse {
        message: message.into(),
        offset,
    }
}

/// Tokenize `source` completely.
pub fn tokenize(source: &str) -> ArbiterResult<Vec<Spanned>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos];

        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'(' => tokens.push(Spanned { token: Token::LParen, offset: start }),
            b')' => tokens.push(Spanned { token: Token::RParen, offset: start }),
            b'[' => tokens.push(Spanned { token: Token::LBracket, offset: start }),
            b']' => tokens.push(Spanned { token: Token::RBracket, offset: start }),
            b'{' => tokens.push(Spanned { token: Token::LBrace, offset: start }),
            b'}' => tokens.push(Spanned { token: Token::RBrace, offset: start }),
            b',' => tokens.push(Spanned { token: Token::Comma, offset: start }),
            b':' => tokens.push(Spanned { token: Token::Colon, offset: start }),
            b'+' => tokens.push(Spanned { token: Token::Plus, offset: start }),
            b'-' => tokens.push(Spanned { token: Token::Minus, offset: start }),
            b'*' => tokens.push(Spanned { token: Token::Star, offset: start }),
            b'/' => tokens.push(Spanned { token: Token::Slash, offset: start }),
            b'%' => tokens.push(Spanned { token: Token::Percent, offset: start }),
            b'.' => tokens.push(Spanned { token: Token::Dot, offset: start }),
            b'=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 1;
                    tokens.push(Spanned { token: Token::EqEq, offset: start });
                } else {
                    return Err(parse_error("expected '==', found lone '='", start));
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 1;
                    tokens.push(Spanned { token: Token::NotEq, offset: start });
                } else {
                    tokens.push(Spanned { token: Token::Bang, offset: start });
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 1;
                    tokens.push(Spanned { token: Token::Le, offset: start });
                } else {
                    tokens.push(Spanned { token: Token::Lt, offset: start });
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 1;
                    tokens.push(Spanned { token: Token::Ge, offset: start });
                } else {
                    tokens.push(Spanned { token: Token::Gt, offset: start });
                }
            }
            b'&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    pos += 1;
                    tokens.push(Spanned { token: Token::AndAnd, offset: start });
                } else {
                    return Err(parse_error("expected '&&', found lone '&'", start));
                }
            }
            b'|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    pos += 1;
                    tokens.push(Spanned { token: Token::OrOr, offset: start });
                } else {
                    return Err(parse_error("expected '||', found lone '|'", start));
                }
            }
            b'"' | b'\'' => {
                let (text, consumed) = lex_string(source, pos)?;
                tokens.push(Spanned { token: Token::Str(text), offset: start });
                pos += consumed;
                continue;
            }
            b'0'..=b'9' => {
                let (token, consumed) = lex_number(source, pos)?;
                tokens.push(Spanned { token, offset: start });
                pos += consumed;
                continue;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut end = pos;
                while end < bytes.len()
                    && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric())
                {
                    end += 1;
                }
                let word = &source[pos..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, offset: start });
                pos = end;
                continue;
            }
            other => {
                return Err(parse_error(
                    format!("unexpected character '{}'", other as char),
                    start,
                ));
            }
        }

        pos += 1;
    }

    Ok(tokens)
}

/// Lex a quoted string starting at `start`. Returns the unescaped text and
/// the number of bytes consumed, including both quotes.
fn lex_string(source: &str, start: usize) -> ArbiterResult<(String, usize)> {
    let bytes = source.as_bytes();
    let quote = bytes[start];
    let mut text = String::new();
    let mut pos = start + 1;

    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => {
                let escaped = bytes
                    .get(pos + 1)
                    .ok_or_else(|| parse_error("unterminated escape sequence", pos))?;
                match escaped {
                    b'n' => text.push('\n'),
                    b't' => text.push('\t'),
                    b'r' => text.push('\r'),
                    b'\\' => text.push('\\'),
                    b'"' => text.push('"'),
                    b'\'' => text.push('\''),
                    other => {
                        return Err(parse_error(
                            format!("unsupported escape '\\{}'", *other as char),
                            pos,
                        ));
                    }
                }
                pos += 2;
            }
            c if c == quote => {
                return Ok((text, pos + 1 - start));
            }
            _ => {
                // Consume one full UTF-8 character, not one byte.
                let ch = source[pos..]
                    .chars()
                    .next()
                    .ok_or_else(|| parse_error("invalid UTF-8 in string literal", pos))?;
                text.push(ch);
                pos += ch.len_utf8();
            }
        }
    }

    Err(parse_error("unterminated string literal", start))
}

/// Lex an integer or double starting at `start`. Returns the token and the
/// number of bytes consumed.
fn lex_number(source: &str, start: usize) -> ArbiterResult<(Token, usize)> {
    let bytes = source.as_bytes();
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }

    // A '.' followed by a digit makes this a double; a bare '.' is member
    // access on an int literal, which the parser rejects anyway.
    let is_double = end < bytes.len()
        && bytes[end] == b'.'
        && bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit());

    if is_double {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let text = &source[start..end];
        let value: f64 = text
            .parse()
            .map_err(|_| parse_error(format!("invalid double literal '{text}'"), start))?;
        Ok((Token::Double(value), end - start))
    } else {
        let text = &source[start..end];
        let value: i64 = text
            .parse()
            .map_err(|_| parse_error(format!("integer literal '{text}' out of range"), start))?;
        Ok((Token::Int(value), end - start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn tokenizes_a_typical_condition() {
        let tokens = kinds("request.resource.attr.status == \"PENDING_APPROVAL\"");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("request".to_string()),
                Token::Dot,
                Token::Ident("resource".to_string()),
                Token::Dot,
                Token::Ident("attr".to_string()),
                Token::Dot,
                Token::Ident("status".to_string()),
                Token::EqEq,
                Token::Str("PENDING_APPROVAL".to_string()),
            ]
        );
    }

    #[test]
    fn distinguishes_int_from_double() {
        assert_eq!(kinds("42"), vec![Token::Int(42)]);
        assert_eq!(kinds("4.5"), vec![Token::Double(4.5)]);
    }

    #[test]
    fn keywords_are_not_idents() {
        assert_eq!(
            kinds("true in x"),
            vec![Token::True, Token::In, Token::Ident("x".to_string())]
        );
    }

    #[test]
    fn single_quoted_strings_and_escapes() {
        assert_eq!(
            kinds("'it\\'s'"),
            vec![Token::Str("it's".to_string())]
        );
        assert_eq!(kinds("\"a\\nb\""), vec![Token::Str("a\nb".to_string())]);
    }

    #[test]
    fn lone_ampersand_is_an_error() {
        let err = tokenize("a & b").unwrap_err();
        assert!(err.to_string().contains("&&"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(tokenize("\"abc").is_err());
    }

    #[test]
    fn offsets_point_into_the_source() {
        let tokens = tokenize("a == b").unwrap();
        assert_eq!(tokens[1].offset, 2);
        assert_eq!(tokens[2].offset, 5);
    }
}
