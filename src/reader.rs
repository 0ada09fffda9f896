// File: src/reader.rs
//
// Turns source text into the syntax tree the compiler walks: a tokenizer,
// a recursive-descent reader building nested `Sexpr`s, and a rewrite pass
// that desugars sugared `define`/`lambda` forms into the shapes the
// compiler expects.

use std::str::Chars;

use crate::ast::{Sexpr, Token, TokenKind, KEYWORDS};
use crate::errors::ReaderError;

const ATOM_PUNCTUATION: &str = "+=?!@#$%^&*-/.><_";

fn is_atom_char(c: char) -> bool {
    c.is_alphanumeric() || ATOM_PUNCTUATION.contains(c)
}

/// Breaks source text into tokens, skipping whitespace and `;`-to-end-of-
/// line comments.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ReaderError> {
    let mut chars = source.chars().peekable();
    let mut tokens = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ';' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::LeftParen, info: "(".to_string() });
            }
            ')' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::RightParen, info: ")".to_string() });
            }
            '\'' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::QuoteTick, info: "'".to_string() });
            }
            '"' => tokens.push(read_string(&mut chars)?),
            _ if is_atom_char(c) => tokens.push(read_atom(&mut chars)),
            other => {
                chars.next();
                return Err(ReaderError::InvalidNumber { text: other.to_string() });
            }
        }
    }
    Ok(tokens)
}

fn read_string(chars: &mut std::iter::Peekable<Chars>) -> Result<Token, ReaderError> {
    chars.next();
    let mut s = String::new();
    loop {
        match chars.next() {
            None => return Err(ReaderError::UnterminatedString),
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some('"') => s.push('"'),
                Some('\\') => s.push('\\'),
                Some(other) => {
                    s.push('\\');
                    s.push(other);
                }
                None => return Err(ReaderError::UnterminatedString),
            },
            Some(c) => s.push(c),
        }
    }
    Ok(Token::string(s))
}

fn read_atom(chars: &mut std::iter::Peekable<Chars>) -> Token {
    let mut text = String::new();
    while let Some(&c) = chars.peek() {
        if is_atom_char(c) {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if looks_like_number(&text) {
        Token::number(text)
    } else if KEYWORDS.contains(&text.as_str()) {
        Token::keyword(text)
    } else {
        Token::symbol(text)
    }
}

/// Matches the numeric literal grammar: an optional sign, then
/// `digits.digits`, `digits.`, `.digits`, or bare `digits`.
fn looks_like_number(text: &str) -> bool {
    let body = text.strip_prefix(['+', '-']).unwrap_or(text);
    if body.is_empty() {
        return false;
    }
    let bytes = body.as_bytes();
    let mut i = 0;
    let mut has_digits_before = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        has_digits_before = true;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let mut has_digits_after = false;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            has_digits_after = true;
        }
        (has_digits_before || has_digits_after) && i == bytes.len()
    } else {
        has_digits_before && i == bytes.len()
    }
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }
}

fn read_expr(cursor: &mut Cursor) -> Result<Sexpr, ReaderError> {
    let token = cursor.next().ok_or(ReaderError::UnexpectedEof)?;
    match token.kind {
        TokenKind::LeftParen => {
            let mut items = Vec::new();
            loop {
                match cursor.peek() {
                    None => return Err(ReaderError::UnexpectedEof),
                    Some(t) if t.kind == TokenKind::RightParen => {
                        cursor.next();
                        break;
                    }
                    _ => items.push(read_expr(cursor)?),
                }
            }
            Ok(Sexpr::List(items))
        }
        TokenKind::RightParen => Err(ReaderError::UnmatchedRightParen),
        TokenKind::QuoteTick => {
            let quoted = read_expr(cursor)?;
            Ok(Sexpr::List(vec![Sexpr::Atom(Token::keyword("quote")), quoted]))
        }
        _ => Ok(Sexpr::Atom(token.clone())),
    }
}

/// Reads every top-level form in `tokens`.
pub fn read_all(tokens: &[Token]) -> Result<Vec<Sexpr>, ReaderError> {
    let mut cursor = Cursor { tokens, pos: 0 };
    let mut forms = Vec::new();
    while cursor.peek().is_some() {
        forms.push(read_expr(&mut cursor)?);
    }
    Ok(forms)
}

fn is_dotted_args(args: &[Sexpr]) -> bool {
    args.len() >= 2
        && matches!(&args[args.len() - 2], Sexpr::Atom(t) if t.kind == TokenKind::Symbol && t.info == ".")
}

fn is_define_with_list_head(items: &[Sexpr]) -> bool {
    items.len() >= 2
        && items[0].is_keyword("define")
        && matches!(&items[1], Sexpr::List(head) if !head.is_empty())
}

fn desugar_define(items: Vec<Sexpr>) -> Vec<Sexpr> {
    let mut iter = items.into_iter();
    let define_kw = iter.next().unwrap();
    let head = iter.next().unwrap();
    let body: Vec<Sexpr> = iter.collect();
    let (name, params) = match head {
        Sexpr::List(mut head_items) => {
            let name = head_items.remove(0);
            (name, head_items)
        }
        _ => unreachable!("is_define_with_list_head already checked this"),
    };
    let mut lambda_items = vec![Sexpr::Atom(Token::keyword("lambda")), Sexpr::List(params)];
    lambda_items.extend(body);
    vec![define_kw, name, Sexpr::List(lambda_items)]
}

fn is_lambda_needing_variadic_tag(items: &[Sexpr]) -> bool {
    items.len() >= 3
        && items[0].is_keyword("lambda")
        && matches!(&items[1], Sexpr::List(args) if is_dotted_args(args))
}

fn tag_variadic(mut items: Vec<Sexpr>) -> Vec<Sexpr> {
    items[0] = Sexpr::Atom(Token::keyword("lambda_v"));
    items
}

/// Desugars `(define (name arg…) body…)` into
/// `(define name (lambda (arg…) body…))`, and retags any lambda whose
/// parameter list ends in `. rest` as `lambda_v`. Applied once, recursively,
/// to every form the reader produces.
pub fn rewrite(tree: Sexpr) -> Sexpr {
    match tree {
        Sexpr::Atom(_) => tree,
        Sexpr::List(items) => {
            let items = if is_define_with_list_head(&items) {
                desugar_define(items)
            } else if is_lambda_needing_variadic_tag(&items) {
                tag_variadic(items)
            } else {
                items
            };
            Sexpr::List(items.into_iter().map(rewrite).collect())
        }
    }
}

/// Tokenizes, reads, and rewrites an entire source string into its
/// top-level forms.
pub fn read_program(source: &str) -> Result<Vec<Sexpr>, ReaderError> {
    let tokens = tokenize(source)?;
    let forms = read_all(&tokens)?;
    Ok(forms.into_iter().map(rewrite).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_numbers_symbols_and_strings() {
        let tokens = tokenize(r#"(+ 1 -2.5 "hi\"there")"#).unwrap();
        assert_eq!(tokens[1].info, "+");
        assert_eq!(tokens[2].info, "1");
        assert_eq!(tokens[3].info, "-2.5");
        assert!(tokens[3].is_float_literal());
        assert_eq!(tokens[4].info, "hi\"there");
    }

    #[test]
    fn skips_comments() {
        let tokens = tokenize("1 ; trailing comment\n2").unwrap();
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn quote_tick_reads_as_quote_form() {
        let forms = read_program("'x").unwrap();
        let list = forms[0].as_list().unwrap();
        assert!(list[0].is_keyword("quote"));
        assert_eq!(list[1].as_atom().unwrap().info, "x");
    }

    #[test]
    fn desugars_define_with_argument_list() {
        let forms = read_program("(define (f x) x)").unwrap();
        let list = forms[0].as_list().unwrap();
        assert!(list[0].is_keyword("define"));
        assert_eq!(list[1].as_atom().unwrap().info, "f");
        let lambda = list[2].as_list().unwrap();
        assert!(lambda[0].is_keyword("lambda"));
    }

    #[test]
    fn desugars_define_with_dotted_rest_into_lambda_v() {
        let forms = read_program("(define (f a . rest) rest)").unwrap();
        let list = forms[0].as_list().unwrap();
        let lambda = list[2].as_list().unwrap();
        assert!(lambda[0].is_keyword("lambda_v"));
    }

    #[test]
    fn bare_lambda_with_dotted_rest_is_retagged() {
        let forms = read_program("(lambda (a . rest) rest)").unwrap();
        let lambda = forms[0].as_list().unwrap();
        assert!(lambda[0].is_keyword("lambda_v"));
    }

    #[test]
    fn unmatched_paren_is_an_error() {
        assert!(read_program("(+ 1 2").is_err());
    }
}
