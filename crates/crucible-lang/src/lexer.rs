//! Lexer for the script language.
//!
//! Tokenization is driven by [`logos`]; line numbers are recovered from byte
//! offsets afterwards so the token grammar stays free of whitespace rules.

use logos::Logos;

use crate::error::CompileError;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"--[^\n]*")]
pub enum TokenKind {
    // Keywords
    #[token("and")]
    And,
    #[token("break")]
    Break,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("elseif")]
    Elseif,
    #[token("end")]
    End,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("if")]
    If,
    #[token("local")]
    Local,
    #[token("nil")]
    Nil,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("return")]
    Return,
    #[token("then")]
    Then,
    #[token("true")]
    True,
    #[token("while")]
    While,

    // Literals
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"0x[0-9a-fA-F]+")]
    #[regex(r"[0-9]+")]
    Int,
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?")]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+")]
    Float,
    #[regex(r#""([^"\\\n]|\\.)*""#)]
    #[regex(r"'([^'\\\n]|\\.)*'")]
    Str,

    // Operators and punctuation
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("#")]
    Hash,
    #[token("==")]
    EqEq,
    #[token("~=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("..")]
    Concat,
    #[token(".")]
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

/// Maps byte offsets back to 1-based line numbers.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        LineIndex { starts }
    }

    fn line_of(&self, offset: usize) -> u32 {
        match self.starts.binary_search(&offset) {
            Ok(idx) => idx as u32 + 1,
            Err(idx) => idx as u32,
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let index = LineIndex::new(source);
    let mut lexer = TokenKind::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let line = index.line_of(span.start);
        match result {
            Ok(kind) => tokens.push(Token {
                kind,
                text: lexer.slice().to_string(),
                line,
            }),
            Err(()) => {
                return Err(CompileError::parse(
                    line,
                    format!("unexpected character {:?}", lexer.slice()),
                ));
            }
        }
    }
    Ok(tokens)
}

/// Strips quotes and resolves escapes in a string literal lexeme.
pub fn unescape_string(lexeme: &str, line: u32) -> Result<String, CompileError> {
    let inner = &lexeme[1..lexeme.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('0') => out.push('\0'),
            Some(other) => {
                return Err(CompileError::parse(
                    line,
                    format!("invalid escape sequence \\{other}"),
                ));
            }
            None => return Err(CompileError::parse(line, "dangling escape in string")),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_statement() {
        let tokens = tokenize("local x = 1 + 2.5").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Local,
                TokenKind::Ident,
                TokenKind::Assign,
                TokenKind::Int,
                TokenKind::Plus,
                TokenKind::Float,
            ]
        );
    }

    #[test]
    fn tracks_lines_and_skips_comments() {
        let tokens = tokenize("local a = 1\n-- comment\nreturn a").unwrap();
        assert_eq!(tokens[0].line, 1);
        let ret = tokens.iter().find(|t| t.kind == TokenKind::Return).unwrap();
        assert_eq!(ret.line, 3);
    }

    #[test]
    fn concat_vs_dot() {
        let tokens = tokenize("a.b ..c").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Dot,
                TokenKind::Ident,
                TokenKind::Concat,
                TokenKind::Ident,
            ]
        );
    }

    #[test]
    fn rejects_bad_character() {
        let err = tokenize("local x = @").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 1, .. }));
    }

    #[test]
    fn unescapes_strings() {
        assert_eq!(unescape_string(r#""a\nb""#, 1).unwrap(), "a\nb");
        assert_eq!(unescape_string(r"'it\'s'", 1).unwrap(), "it's");
        assert!(unescape_string(r#""bad\q""#, 1).is_err());
    }
}
