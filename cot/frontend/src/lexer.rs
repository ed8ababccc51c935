//! The lexical scanner.
//!
//! Hand-written, byte-oriented, producing one token at a time. Positions are
//! byte offsets into the source, carried through the whole pipeline as
//! `SourceLoc`s.

use cot_codegen::SourceLoc;
use std::fmt;

/// Token kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// An identifier or keyword.
    Ident(String),
    /// An integer literal.
    Int(i64),
    /// A float literal.
    Float(f64),
    /// A string literal with escapes already applied.
    Str(String),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semi,
    Dot,
    Arrow,

    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    AndAnd,
    OrOr,
    Amp,

    /// End of input.
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "`{s}`"),
            Token::Int(n) => write!(f, "{n}"),
            Token::Float(x) => write!(f, "{x}"),
            Token::Str(_) => write!(f, "string literal"),
            Token::Eof => write!(f, "end of input"),
            t => write!(f, "`{}`", symbol_text(t)),
        }
    }
}

fn symbol_text(t: &Token) -> &'static str {
    match t {
        Token::LParen => "(",
        Token::RParen => ")",
        Token::LBrace => "{",
        Token::RBrace => "}",
        Token::LBracket => "[",
        Token::RBracket => "]",
        Token::Comma => ",",
        Token::Colon => ":",
        Token::Semi => ";",
        Token::Dot => ".",
        Token::Arrow => "->",
        Token::Assign => "=",
        Token::Plus => "+",
        Token::Minus => "-",
        Token::Star => "*",
        Token::Slash => "/",
        Token::Percent => "%",
        Token::PlusAssign => "+=",
        Token::MinusAssign => "-=",
        Token::StarAssign => "*=",
        Token::SlashAssign => "/=",
        Token::Eq => "==",
        Token::NotEq => "!=",
        Token::Lt => "<",
        Token::Le => "<=",
        Token::Gt => ">",
        Token::Ge => ">=",
        Token::Not => "!",
        Token::AndAnd => "&&",
        Token::OrOr => "||",
        Token::Amp => "&",
        _ => "?",
    }
}

/// The scanner over one source buffer.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    /// Scan `src`.
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn peek2(&self) -> u8 {
        *self.src.get(self.pos + 1).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'/' if self.peek2() == b'/' => {
                    while self.pos < self.src.len() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// The next token with its position, or an error message at a position.
    pub fn next_token(&mut self) -> Result<(Token, SourceLoc), (String, SourceLoc)> {
        self.skip_trivia();
        let loc = SourceLoc::new(self.pos as u32);
        if self.pos >= self.src.len() {
            return Ok((Token::Eof, loc));
        }
        let c = self.bump();
        let tok = match c {
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'{' => Token::LBrace,
            b'}' => Token::RBrace,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b',' => Token::Comma,
            b':' => Token::Colon,
            b';' => Token::Semi,
            b'.' => Token::Dot,
            b'%' => Token::Percent,
            b'+' => self.with_assign(Token::Plus, Token::PlusAssign),
            b'*' => self.with_assign(Token::Star, Token::StarAssign),
            b'/' => self.with_assign(Token::Slash, Token::SlashAssign),
            b'-' => {
                if self.peek() == b'>' {
                    self.pos += 1;
                    Token::Arrow
                } else {
                    self.with_assign(Token::Minus, Token::MinusAssign)
                }
            }
            b'=' => self.with_assign(Token::Assign, Token::Eq),
            b'!' => self.with_assign(Token::Not, Token::NotEq),
            b'<' => self.with_assign(Token::Lt, Token::Le),
            b'>' => self.with_assign(Token::Gt, Token::Ge),
            b'&' => {
                if self.peek() == b'&' {
                    self.pos += 1;
                    Token::AndAnd
                } else {
                    Token::Amp
                }
            }
            b'|' => {
                if self.peek() == b'|' {
                    self.pos += 1;
                    Token::OrOr
                } else {
                    return Err(("unexpected character `|`".into(), loc));
                }
            }
            b'"' => return self.string(loc),
            b'0'..=b'9' => return self.number(loc),
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let start = self.pos - 1;
                while self.peek() == b'_' || self.peek().is_ascii_alphanumeric() {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.src[start..self.pos])
                    .expect("identifier is ascii")
                    .to_string();
                Token::Ident(text)
            }
            c => {
                return Err((format!("unexpected character `{}`", c as char), loc));
            }
        };
        Ok((tok, loc))
    }

    fn with_assign(&mut self, plain: Token, with_eq: Token) -> Token {
        if self.peek() == b'=' {
            self.pos += 1;
            with_eq
        } else {
            plain
        }
    }

    fn number(&mut self, loc: SourceLoc) -> Result<(Token, SourceLoc), (String, SourceLoc)> {
        let start = self.pos - 1;
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek() == b'.' && self.peek2().is_ascii_digit() {
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            let value: f64 = text
                .parse()
                .map_err(|_| (format!("bad float literal `{text}`"), loc))?;
            return Ok((Token::Float(value), loc));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let value: i64 = text
            .parse()
            .map_err(|_| (format!("integer literal `{text}` out of range"), loc))?;
        Ok((Token::Int(value), loc))
    }

    fn string(&mut self, loc: SourceLoc) -> Result<(Token, SourceLoc), (String, SourceLoc)> {
        let mut out = String::new();
        loop {
            if self.pos >= self.src.len() {
                return Err(("unterminated string literal".into(), loc));
            }
            match self.bump() {
                b'"' => break,
                b'\\' => {
                    let e = self.bump();
                    out.push(match e {
                        b'n' => '\n',
                        b't' => '\t',
                        b'r' => '\r',
                        b'0' => '\0',
                        b'"' => '"',
                        b'\\' => '\\',
                        c => {
                            return Err((format!("unknown escape `\\{}`", c as char), loc));
                        }
                    });
                }
                c => out.push(c as char),
            }
        }
        Ok((Token::Str(out), loc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let (t, _) = lx.next_token().unwrap();
            if t == Token::Eof {
                break;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn scans_a_function_header() {
        let toks = all("fn add(a: i64, b: i64) i64 {");
        assert_eq!(
            toks,
            vec![
                Token::Ident("fn".into()),
                Token::Ident("add".into()),
                Token::LParen,
                Token::Ident("a".into()),
                Token::Colon,
                Token::Ident("i64".into()),
                Token::Comma,
                Token::Ident("b".into()),
                Token::Colon,
                Token::Ident("i64".into()),
                Token::RParen,
                Token::Ident("i64".into()),
                Token::LBrace,
            ]
        );
    }

    #[test]
    fn scans_operators_and_comments() {
        let toks = all("a <= b // trailing\n c += 1");
        assert_eq!(
            toks,
            vec![
                Token::Ident("a".into()),
                Token::Le,
                Token::Ident("b".into()),
                Token::Ident("c".into()),
                Token::PlusAssign,
                Token::Int(1),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let toks = all(r#""a\nb""#);
        assert_eq!(toks, vec![Token::Str("a\nb".into())]);
    }
}
