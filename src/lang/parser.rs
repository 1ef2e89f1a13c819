// src/lang/parser.rs

//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Precedence, loosest first: assignment, `||`, `&&`, `!`, comparisons,
//! `+ -`, `* / %%`, unary minus, `^` (right-associative), then postfix
//! calls, indexing and `$` access.

use crate::lang::ast::{Arg, AssignScope, BinOp, Expr, Param, UnOp};
use crate::lang::lexer::{tokenize, ParseError, ParseResult, Spanned, Token};

/// Deepest nesting of sub-expressions a command may have.
pub const MAX_NESTING: usize = 128;

/// Parse a single expression (a target command, a trigger condition...).
///
/// Several statements separated by newlines or `;` are accepted and wrapped
/// in a block, which evaluates to its last statement.
pub fn parse_expr(src: &str) -> ParseResult<Expr> {
    let mut exprs = parse_program(src)?;
    match exprs.len() {
        0 => Err(ParseError {
            message: "empty expression".to_string(),
            line: 1,
            column: 1,
        }),
        1 => Ok(exprs.remove(0)),
        _ => Ok(Expr::Block(exprs)),
    }
}

/// Parse a sequence of top-level statements (an environment script, a code
/// chunk in a document...).
pub fn parse_program(src: &str) -> ParseResult<Vec<Expr>> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        depth: 0,
    };
    let mut exprs = Vec::new();
    loop {
        parser.skip_separators();
        if parser.at(&Token::Eof) {
            break;
        }
        exprs.push(parser.expr()?);
        match parser.peek() {
            Token::Newline | Token::Semi | Token::Eof => {}
            other => {
                let other = other.clone();
                return parser.error(format!("unexpected {other} after expression"));
            }
        }
    }
    Ok(exprs)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // `tokenize` always ends the stream with Eof, and we never advance past it.
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        let at = &self.tokens[self.pos];
        Err(ParseError {
            message: message.into(),
            line: at.line,
            column: at.column,
        })
    }

    fn expect(&mut self, token: Token) -> ParseResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            let found = self.peek().clone();
            self.error(format!("expected {token}, found {found}"))
        }
    }

    /// Run `f` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_NESTING {
            return self.error("expression nested too deeply");
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn skip_newlines(&mut self) {
        while self.at(&Token::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Semi) {
            self.advance();
        }
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            // `"name" <- value` and `list("a" = 1)` are legal R.
            Token::Str(name) => {
                self.advance();
                Ok(name)
            }
            other => self.error(format!("expected a name, found {other}")),
        }
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        self.nested(Self::assignment)
    }

    fn assignment(&mut self) -> ParseResult<Expr> {
        let lhs = self.or()?;
        let scope = match self.peek() {
            Token::Assign | Token::LeftArrow => AssignScope::Local,
            Token::SuperArrow => AssignScope::Shared,
            _ => return Ok(lhs),
        };
        let target = match lhs {
            Expr::Ident(name) | Expr::Str(name) => name,
            other => {
                return self.error(format!(
                    "invalid assignment target '{other}' (only plain names can be assigned)"
                ));
            }
        };
        self.advance();
        self.skip_newlines();
        let value = self.expr()?;
        Ok(Expr::Assign {
            target,
            value: Box::new(value),
            scope,
        })
    }

    fn binary_rhs(&mut self) -> ParseResult<()> {
        self.advance();
        self.skip_newlines();
        Ok(())
    }

    fn or(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.and()?;
        while self.at(&Token::OrOr) {
            self.binary_rhs()?;
            let rhs = self.and()?;
            lhs = binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.not()?;
        while self.at(&Token::AndAnd) {
            self.binary_rhs()?;
            let rhs = self.not()?;
            lhs = binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not(&mut self) -> ParseResult<Expr> {
        if self.eat(&Token::Bang) {
            let expr = self.nested(Self::not)?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(expr),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.binary_rhs()?;
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.binary_rhs()?;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Modulo => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.binary_rhs()?;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&Token::Minus) {
            let expr = self.nested(Self::unary)?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Token::Plus) {
            return self.nested(Self::unary);
        }
        self.power()
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.postfix()?;
        if self.at(&Token::Caret) {
            self.binary_rhs()?;
            let exponent = self.nested(Self::unary)?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Token::LParen => {
                    self.advance();
                    let args = self.args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let double = self.eat(&Token::LBracket);
                    self.skip_newlines();
                    let index = self.expr()?;
                    self.skip_newlines();
                    self.expect(Token::RBracket)?;
                    if double {
                        self.expect(Token::RBracket)?;
                    }
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                        double,
                    };
                }
                Token::Dollar => {
                    self.advance();
                    let name = self.ident()?;
                    expr = Expr::Field {
                        target: Box::new(expr),
                        name,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Argument list after the opening `(`; consumes the closing `)`.
    fn args(&mut self) -> ParseResult<Vec<Arg>> {
        let mut args = Vec::new();
        self.skip_newlines();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            self.skip_newlines();
            let named = matches!(self.peek(), Token::Ident(_) | Token::Str(_))
                && *self.peek_at(1) == Token::Assign;
            let name = if named {
                let name = self.ident()?;
                self.advance();
                self.skip_newlines();
                Some(name)
            } else {
                None
            };
            let value = self.expr()?;
            args.push(Arg { name, value });
            self.skip_newlines();
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(args);
        }
    }

    fn params(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        self.skip_newlines();
        if self.eat(&Token::RParen) {
            return Ok(params);
        }
        loop {
            self.skip_newlines();
            let name = match self.advance() {
                Token::Ident(name) => name,
                other => return self.error(format!("expected a parameter name, found {other}")),
            };
            if params.iter().any(|p: &Param| p.name == name) {
                return self.error(format!("repeated parameter '{name}'"));
            }
            self.skip_newlines();
            let default = if self.eat(&Token::Assign) {
                self.skip_newlines();
                Some(self.expr()?)
            } else {
                None
            };
            params.push(Param { name, default });
            self.skip_newlines();
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(params);
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::Ident(name) => {
                let internal = match self.peek() {
                    Token::DoubleColon => false,
                    Token::TripleColon => true,
                    _ => return Ok(Expr::Ident(name)),
                };
                self.advance();
                let member = match self.advance() {
                    Token::Ident(member) => member,
                    other => {
                        return self.error(format!("expected a name after '{name}::', found {other}"));
                    }
                };
                Ok(Expr::Namespaced {
                    pkg: name,
                    name: member,
                    internal,
                })
            }
            Token::LParen => {
                self.skip_newlines();
                let inner = self.expr()?;
                self.skip_newlines();
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBrace => {
                let mut exprs = Vec::new();
                loop {
                    self.skip_separators();
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Block(exprs));
                    }
                    exprs.push(self.expr()?);
                    match self.peek() {
                        Token::Newline | Token::Semi | Token::RBrace => {}
                        other => {
                            let other = other.clone();
                            return self.error(format!("unexpected {other} in block"));
                        }
                    }
                }
            }
            Token::Function => {
                let params = self.params()?;
                self.skip_newlines();
                let body = self.expr()?;
                Ok(Expr::Function {
                    params,
                    body: Box::new(body),
                })
            }
            Token::If => {
                self.expect(Token::LParen)?;
                self.skip_newlines();
                let cond = self.expr()?;
                self.skip_newlines();
                self.expect(Token::RParen)?;
                self.skip_newlines();
                let then = self.expr()?;
                let otherwise = if self.else_follows() {
                    self.skip_newlines();
                    self.expect(Token::Else)?;
                    self.skip_newlines();
                    Some(Box::new(self.expr()?))
                } else {
                    None
                };
                Ok(Expr::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise,
                })
            }
            Token::Eof => self.error("unexpected end of input"),
            other => {
                // Point the error at the token we just consumed.
                self.pos = self.pos.saturating_sub(1);
                self.error(format!("unexpected {other}"))
            }
        }
    }

    /// Whether an `else` follows, possibly after newlines.
    fn else_follows(&self) -> bool {
        let mut n = 0;
        loop {
            match self.peek_at(n) {
                Token::Newline => n += 1,
                Token::Else => return true,
                _ => return false,
            }
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
