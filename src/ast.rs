// File: src/ast.rs
//
// The syntax tree the compiler consumes. Nodes are either a token (an atom)
// or an ordered sequence of children. This is the boundary the reader
// produces and the compiler walks; see src/reader.rs for how source text
// becomes one of these.

use std::fmt;

/// One lexical token. The tag distinguishes how the compiler should treat
/// the token when it appears as a leaf of the syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Keyword,
    Symbol,
    Number,
    String,
    LeftParen,
    RightParen,
    QuoteTick,
}

/// A single token: its kind plus the literal text/value it carries.
///
/// `info` holds the token's payload as the reader produced it: the
/// identifier text for `Symbol`/`Keyword`, the unescaped contents for
/// `String`, and the printed form for `Number` (parsed on demand by the
/// code generator, which needs to know whether it is an integer or a
/// float literal).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub info: String,
}

impl Token {
    pub fn keyword(info: impl Into<String>) -> Self {
        Token { kind: TokenKind::Keyword, info: info.into() }
    }

    pub fn symbol(info: impl Into<String>) -> Self {
        Token { kind: TokenKind::Symbol, info: info.into() }
    }

    pub fn number(info: impl Into<String>) -> Self {
        Token { kind: TokenKind::Number, info: info.into() }
    }

    pub fn string(info: impl Into<String>) -> Self {
        Token { kind: TokenKind::String, info: info.into() }
    }

    /// Numbers with a `.` or exponent are float literals; everything else
    /// is an integer literal.
    pub fn is_float_literal(&self) -> bool {
        debug_assert_eq!(self.kind, TokenKind::Number);
        self.info.contains(['.', 'e', 'E'])
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info)
    }
}

/// The keyword vocabulary the compiler recognizes as special forms. The
/// reader tags every other symbol in head position as a plain `Symbol`
/// token; by the time a tree reaches the compiler, `lambda_v` and
/// unsugared `define` have already been produced by the reader's rewrite
/// pass.
pub const KEYWORDS: &[&str] =
    &["begin", "if", "let", "lambda", "lambda_v", "define", "call/cc", "quote"];

/// A node of the syntax tree: either a leaf token or an ordered list of
/// children (a parenthesized form).
#[derive(Debug, Clone, PartialEq)]
pub enum Sexpr {
    Atom(Token),
    List(Vec<Sexpr>),
}

impl Sexpr {
    pub fn as_atom(&self) -> Option<&Token> {
        match self {
            Sexpr::Atom(t) => Some(t),
            Sexpr::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Sexpr]> {
        match self {
            Sexpr::List(items) => Some(items),
            Sexpr::Atom(_) => None,
        }
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        matches!(self.as_atom(), Some(t) if t.kind == TokenKind::Keyword && t.info == word)
    }
}
