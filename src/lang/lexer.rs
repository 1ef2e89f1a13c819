// src/lang/lexer.rs

//! Tokenizer for pipewright expressions.
//!
//! Newlines are significant (they terminate statements), so they are emitted
//! as tokens and the parser decides where they may be skipped.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Function,
    If,
    Else,
    True,
    False,
    Null,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Newline,
    /// `=`
    Assign,
    /// `<-`
    LeftArrow,
    /// `<<-`
    SuperArrow,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    /// `%%`
    Modulo,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Dollar,
    /// `::`
    DoubleColon,
    /// `:::`
    TripleColon,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "number {n}"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Ident(s) => write!(f, "symbol '{s}'"),
            Token::Newline => write!(f, "end of line"),
            Token::Eof => write!(f, "end of input"),
            other => write!(f, "'{}'", token_text(other)),
        }
    }
}

fn token_text(token: &Token) -> &'static str {
    match token {
        Token::Function => "function",
        Token::If => "if",
        Token::Else => "else",
        Token::True => "TRUE",
        Token::False => "FALSE",
        Token::Null => "NULL",
        Token::LParen => "(",
        Token::RParen => ")",
        Token::LBrace => "{",
        Token::RBrace => "}",
        Token::LBracket => "[",
        Token::RBracket => "]",
        Token::Comma => ",",
        Token::Semi => ";",
        Token::Assign => "=",
        Token::LeftArrow => "<-",
        Token::SuperArrow => "<<-",
        Token::Plus => "+",
        Token::Minus => "-",
        Token::Star => "*",
        Token::Slash => "/",
        Token::Caret => "^",
        Token::Modulo => "%%",
        Token::EqEq => "==",
        Token::NotEq => "!=",
        Token::Lt => "<",
        Token::Le => "<=",
        Token::Gt => ">",
        Token::Ge => ">=",
        Token::AndAnd => "&&",
        Token::OrOr => "||",
        Token::Bang => "!",
        Token::Dollar => "$",
        Token::DoubleColon => "::",
        Token::TripleColon => ":::",
        _ => "?",
    }
}

/// A token plus the position it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

/// Error produced while tokenizing or parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

/// Split `src` into tokens, always terminated by [`Token::Eof`].
pub fn tokenize(src: &str) -> ParseResult<Vec<Spanned>> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
    };
    let mut out = Vec::new();

    loop {
        lexer.skip_blanks();
        let line = lexer.line;
        let column = lexer.column;
        let token = lexer.next_token()?;
        let done = token == Token::Eof;
        out.push(Spanned {
            token,
            line,
            column,
        });
        if done {
            break;
        }
    }

    Ok(out)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(ParseError {
            message: message.into(),
            line: self.line,
            column: self.column,
        })
    }

    fn skip_blanks(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> ParseResult<Token> {
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(Token::Eof),
        };

        if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
        {
            return self.number();
        }
        if c.is_alphabetic() || c == '_' || c == '.' {
            return Ok(self.word());
        }

        self.bump();
        let token = match c {
            '\n' => Token::Newline,
            '"' | '\'' => return self.string(c),
            '`' => return self.backtick(),
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            ';' => Token::Semi,
            '+' => Token::Plus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '$' => Token::Dollar,
            '-' => Token::Minus,
            '%' => {
                if self.peek() == Some('%') {
                    self.bump();
                    Token::Modulo
                } else {
                    return self.error("unexpected '%' (only '%%' is supported)");
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::EqEq
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::NotEq
                } else {
                    Token::Bang
                }
            }
            '<' => match (self.peek(), self.peek_at(1)) {
                (Some('<'), Some('-')) => {
                    self.bump();
                    self.bump();
                    Token::SuperArrow
                }
                (Some('-'), _) => {
                    self.bump();
                    Token::LeftArrow
                }
                (Some('='), _) => {
                    self.bump();
                    Token::Le
                }
                _ => Token::Lt,
            },
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.bump();
                    Token::AndAnd
                } else {
                    return self.error("unexpected '&' (use '&&')");
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.bump();
                    Token::OrOr
                } else {
                    return self.error("unexpected '|' (use '||')");
                }
            }
            ':' => {
                if self.peek() == Some(':') {
                    self.bump();
                    if self.peek() == Some(':') {
                        self.bump();
                        Token::TripleColon
                    } else {
                        Token::DoubleColon
                    }
                } else {
                    return self.error("unexpected ':'");
                }
            }
            other => return self.error(format!("unexpected character {other:?}")),
        };
        Ok(token)
    }

    fn number(&mut self) -> ParseResult<Token> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_at(1)
                    .is_some_and(|d| d.is_ascii_digit() || d == '-' || d == '+')
            {
                text.push(c);
                self.bump();
                if let Some(sign) = self.peek().filter(|s| *s == '-' || *s == '+') {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }
        // R integer suffix, e.g. `1L`.
        if self.peek() == Some('L') {
            self.bump();
        }
        match text.parse::<f64>() {
            Ok(n) => Ok(Token::Num(n)),
            Err(_) => self.error(format!("invalid number literal '{text}'")),
        }
    }

    fn word(&mut self) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "function" => Token::Function,
            "if" => Token::If,
            "else" => Token::Else,
            "TRUE" | "true" => Token::True,
            "FALSE" | "false" => Token::False,
            "NULL" | "null" => Token::Null,
            _ => Token::Ident(text),
        }
    }

    fn string(&mut self, quote: char) -> ParseResult<Token> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return self.error("unterminated string literal"),
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some(c @ ('\\' | '"' | '\'' | '`')) => text.push(c),
                    Some(c) => return self.error(format!("unknown escape '\\{c}'")),
                    None => return self.error("unterminated string literal"),
                },
                Some(c) => text.push(c),
            }
        }
        Ok(Token::Str(text))
    }

    fn backtick(&mut self) -> ParseResult<Token> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return self.error("unterminated `quoted` symbol"),
                Some('`') => break,
                Some(c) => text.push(c),
            }
        }
        if text.is_empty() {
            return self.error("empty `quoted` symbol");
        }
        Ok(Token::Ident(text))
    }
}
