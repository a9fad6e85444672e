use thiserror::Error;

use crate::ast::{
    AssignTarget, BinOp, Expr, ExprKind, FuncDecl, Param, Pos, Program, Stmt, StmtKind, TypeExpr,
    UnOp,
};
use crate::token::{Token, TokenKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("{line}:{column}: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        line: usize,
        column: usize,
    },
    #[error("{line}:{column}: invalid assignment target")]
    InvalidAssignmentTarget { line: usize, column: usize },
}

/// Operator precedence levels (higher binds tighter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None = 0,
    Assignment = 1, // =
    Or = 2,         // ||
    And = 3,        // &&
    Equality = 4,   // == !=
    Comparison = 5, // < <= > >=
    AddSub = 6,     // + -
    MulDiv = 7,     // * / %
    Unary = 8,      // ! - +
}

impl Precedence {
    // The next tighter level, for left-associative operands.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::AddSub,
            Precedence::AddSub => Precedence::MulDiv,
            Precedence::MulDiv => Precedence::Unary,
            Precedence::Unary => Precedence::Unary,
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("identifier '{}'", name),
        TokenKind::Int(v) => format!("integer {}", v),
        TokenKind::Float(v) => format!("float {}", v),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("'{}'", token_text(other)),
    }
}

fn token_text(kind: &TokenKind) -> &'static str {
    match kind {
        TokenKind::Func => "func",
        TokenKind::Let => "let",
        TokenKind::If => "if",
        TokenKind::Else => "else",
        TokenKind::For => "for",
        TokenKind::Return => "return",
        TokenKind::True => "true",
        TokenKind::False => "false",
        TokenKind::KwInt => "int",
        TokenKind::KwFloat => "float",
        TokenKind::KwBool => "bool",
        TokenKind::KwVoid => "void",
        TokenKind::Assign => "=",
        TokenKind::Eq => "==",
        TokenKind::Ne => "!=",
        TokenKind::Lt => "<",
        TokenKind::Le => "<=",
        TokenKind::Gt => ">",
        TokenKind::Ge => ">=",
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Star => "*",
        TokenKind::Slash => "/",
        TokenKind::Percent => "%",
        TokenKind::Not => "!",
        TokenKind::AndAnd => "&&",
        TokenKind::OrOr => "||",
        TokenKind::LeftParen => "(",
        TokenKind::RightParen => ")",
        TokenKind::LeftBrace => "{",
        TokenKind::RightBrace => "}",
        TokenKind::LeftBracket => "[",
        TokenKind::RightBracket => "]",
        TokenKind::Comma => ",",
        TokenKind::Semicolon => ";",
        TokenKind::Colon => ":",
        _ => "?",
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        // The lexer always ends the stream with Eof; guarantee it here so
        // current() can index unconditionally.
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::Eof, 0, 0));
        }
        Self { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn current_pos(&self) -> Pos {
        let tok = self.current();
        Pos {
            line: tok.line,
            column: tok.column,
        }
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let tok = self.current();
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: describe(&tok.kind),
            line: tok.line,
            column: tok.column,
        }
    }

    fn consume(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn precedence(kind: &TokenKind) -> Precedence {
        match kind {
            TokenKind::Assign => Precedence::Assignment,
            TokenKind::OrOr => Precedence::Or,
            TokenKind::AndAnd => Precedence::And,
            TokenKind::Eq | TokenKind::Ne => Precedence::Equality,
            TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge => {
                Precedence::Comparison
            }
            TokenKind::Plus | TokenKind::Minus => Precedence::AddSub,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::MulDiv,
            _ => Precedence::None,
        }
    }

    fn binop(kind: &TokenKind) -> Option<BinOp> {
        match kind {
            TokenKind::Plus => Some(BinOp::Add),
            TokenKind::Minus => Some(BinOp::Sub),
            TokenKind::Star => Some(BinOp::Mul),
            TokenKind::Slash => Some(BinOp::Div),
            TokenKind::Percent => Some(BinOp::Mod),
            TokenKind::Eq => Some(BinOp::Eq),
            TokenKind::Ne => Some(BinOp::Ne),
            TokenKind::Lt => Some(BinOp::Lt),
            TokenKind::Le => Some(BinOp::Le),
            TokenKind::Gt => Some(BinOp::Gt),
            TokenKind::Ge => Some(BinOp::Ge),
            TokenKind::AndAnd => Some(BinOp::And),
            TokenKind::OrOr => Some(BinOp::Or),
            _ => None,
        }
    }

    // ---- expressions ----

    fn parse_expression(&mut self, min: Precedence) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        loop {
            let kind = self.current().kind.clone();
            let prec = Self::precedence(&kind);
            if prec == Precedence::None || prec < min {
                break;
            }

            if kind == TokenKind::Assign {
                let pos = left.pos;
                self.advance();
                // Right-associative: `a = b = c` would need `b = c` to be a
                // value, which the analyzer rejects; parse it anyway.
                let value = self.parse_expression(Precedence::Assignment)?;
                let target = Self::assign_target(left)?;
                left = Expr {
                    kind: ExprKind::Assign {
                        target,
                        value: Box::new(value),
                    },
                    pos,
                };
                continue;
            }

            let op = match Self::binop(&kind) {
                Some(op) => op,
                None => break,
            };
            let pos = left.pos;
            self.advance();
            let right = self.parse_expression(prec.next())?;
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                pos,
            };
        }

        Ok(left)
    }

    fn assign_target(expr: Expr) -> Result<AssignTarget, ParseError> {
        match expr.kind {
            ExprKind::Var(name) => Ok(AssignTarget::Var(name)),
            ExprKind::Index { array, index } => Ok(AssignTarget::Elem { array, index }),
            _ => Err(ParseError::InvalidAssignmentTarget {
                line: expr.pos.line,
                column: expr.pos.column,
            }),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.current_pos();
        let op = match self.current().kind {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Plus => Some(UnOp::Plus),
            TokenKind::Not => Some(UnOp::Not),
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary(op, Box::new(operand)),
                pos,
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        while self.check(&TokenKind::LeftBracket) {
            let pos = expr.pos;
            self.advance();
            let index = self.parse_expression(Precedence::Assignment)?;
            self.consume(TokenKind::RightBracket, "']' after index")?;
            expr = Expr {
                kind: ExprKind::Index {
                    array: Box::new(expr),
                    index: Box::new(index),
                },
                pos,
            };
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.current_pos();
        let token = self.current().clone();

        let kind = match &token.kind {
            TokenKind::Int(v) => {
                let v = *v;
                self.advance();
                ExprKind::Int(v)
            }
            TokenKind::Float(v) => {
                let v = *v;
                self.advance();
                ExprKind::Float(v)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                if self.check(&TokenKind::LeftParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RightParen) {
                        args.push(self.parse_expression(Precedence::Assignment)?);
                        while self.check(&TokenKind::Comma) {
                            self.advance();
                            args.push(self.parse_expression(Precedence::Assignment)?);
                        }
                    }
                    self.consume(TokenKind::RightParen, "')' after arguments")?;
                    ExprKind::Call { name, args }
                } else {
                    ExprKind::Var(name)
                }
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_expression(Precedence::Assignment)?;
                self.consume(TokenKind::RightParen, "')' after expression")?;
                // Grouping only guides precedence; no node is kept.
                return Ok(inner);
            }
            TokenKind::KwInt | TokenKind::KwFloat | TokenKind::KwBool => {
                let elem = match token.kind {
                    TokenKind::KwInt => TypeExpr::Int,
                    TokenKind::KwFloat => TypeExpr::Float,
                    _ => TypeExpr::Bool,
                };
                self.advance();
                self.consume(TokenKind::LeftBracket, "'[' after array element type")?;
                let size = self.parse_expression(Precedence::Assignment)?;
                self.consume(TokenKind::RightBracket, "']' after array size")?;
                ExprKind::NewArray {
                    elem,
                    size: Box::new(size),
                }
            }
            _ => return Err(self.unexpected("expression")),
        };

        Ok(Expr { kind, pos })
    }

    // ---- types ----

    fn parse_type(&mut self) -> Result<TypeExpr, ParseError> {
        let mut ty = match self.current().kind {
            TokenKind::KwInt => TypeExpr::Int,
            TokenKind::KwFloat => TypeExpr::Float,
            TokenKind::KwBool => TypeExpr::Bool,
            TokenKind::KwVoid => TypeExpr::Void,
            _ => return Err(self.unexpected("type")),
        };
        self.advance();

        while self.check(&TokenKind::LeftBracket) && self.peek_is(1, &TokenKind::RightBracket) {
            self.advance();
            self.advance();
            ty = TypeExpr::Array(Box::new(ty));
        }

        Ok(ty)
    }

    fn peek_is(&self, offset: usize, kind: &TokenKind) -> bool {
        match self.tokens.get(self.pos + offset) {
            Some(tok) => std::mem::discriminant(&tok.kind) == std::mem::discriminant(kind),
            None => false,
        }
    }

    // ---- statements ----

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.consume(TokenKind::LeftBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.unexpected("'}'"));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.advance();
        Ok(stmts)
    }

    fn parse_let(&mut self, consume_semi: bool) -> Result<Stmt, ParseError> {
        let pos = self.current_pos();
        self.consume(TokenKind::Let, "'let'")?;
        let name = match self.advance() {
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            _ => {
                // Step back so the error points at the offending token.
                self.pos -= 1;
                return Err(self.unexpected("variable name"));
            }
        };
        self.consume(TokenKind::Colon, "':' after variable name")?;
        let ty = self.parse_type()?;
        self.consume(TokenKind::Assign, "'=' after variable type")?;
        let init = self.parse_expression(Precedence::Assignment)?;
        if consume_semi {
            self.consume(TokenKind::Semicolon, "';' after declaration")?;
        }
        Ok(Stmt {
            kind: StmtKind::Let { name, ty, init },
            pos,
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let pos = self.current_pos();

        if self.check(&TokenKind::Let) {
            return self.parse_let(true);
        }
        if self.check(&TokenKind::If) {
            return self.parse_if();
        }
        if self.check(&TokenKind::For) {
            return self.parse_for();
        }
        if self.check(&TokenKind::Return) {
            self.advance();
            let value = if self.check(&TokenKind::Semicolon) {
                None
            } else {
                Some(self.parse_expression(Precedence::Assignment)?)
            };
            self.consume(TokenKind::Semicolon, "';' after return")?;
            return Ok(Stmt {
                kind: StmtKind::Return(value),
                pos,
            });
        }
        if self.check(&TokenKind::LeftBrace) {
            let stmts = self.parse_block()?;
            return Ok(Stmt {
                kind: StmtKind::Block(stmts),
                pos,
            });
        }

        let expr = self.parse_expression(Precedence::Assignment)?;
        self.consume(TokenKind::Semicolon, "';' after expression")?;
        Ok(Stmt {
            kind: StmtKind::Expr(expr),
            pos,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let pos = self.current_pos();
        self.consume(TokenKind::If, "'if'")?;
        self.consume(TokenKind::LeftParen, "'(' after 'if'")?;
        let cond = self.parse_expression(Precedence::Assignment)?;
        self.consume(TokenKind::RightParen, "')' after condition")?;
        let then_block = self.parse_block()?;

        let else_block = if self.check(&TokenKind::Else) {
            self.advance();
            if self.check(&TokenKind::If) {
                // `else if` chains become a nested If in the else block.
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            pos,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let pos = self.current_pos();
        self.consume(TokenKind::For, "'for'")?;
        self.consume(TokenKind::LeftParen, "'(' after 'for'")?;

        let init = if self.check(&TokenKind::Semicolon) {
            None
        } else if self.check(&TokenKind::Let) {
            Some(Box::new(self.parse_let(false)?))
        } else {
            let expr_pos = self.current_pos();
            let expr = self.parse_expression(Precedence::Assignment)?;
            Some(Box::new(Stmt {
                kind: StmtKind::Expr(expr),
                pos: expr_pos,
            }))
        };
        self.consume(TokenKind::Semicolon, "';' after loop initializer")?;

        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression(Precedence::Assignment)?)
        };
        self.consume(TokenKind::Semicolon, "';' after loop condition")?;

        let step = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.parse_expression(Precedence::Assignment)?)
        };
        self.consume(TokenKind::RightParen, "')' after loop header")?;

        let body = self.parse_block()?;

        Ok(Stmt {
            kind: StmtKind::For {
                init,
                cond,
                step,
                body,
            },
            pos,
        })
    }

    // ---- declarations ----

    fn parse_func(&mut self) -> Result<FuncDecl, ParseError> {
        let pos = self.current_pos();
        self.consume(TokenKind::Func, "'func'")?;
        let name = match self.advance() {
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("function name"));
            }
        };

        self.consume(TokenKind::LeftParen, "'(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let param_pos = self.current_pos();
                let pname = match self.advance() {
                    Token {
                        kind: TokenKind::Ident(pname),
                        ..
                    } => pname,
                    _ => {
                        self.pos -= 1;
                        return Err(self.unexpected("parameter name"));
                    }
                };
                self.consume(TokenKind::Colon, "':' after parameter name")?;
                let ty = self.parse_type()?;
                params.push(Param {
                    name: pname,
                    ty,
                    pos: param_pos,
                });
                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.consume(TokenKind::RightParen, "')' after parameters")?;

        let ret = if self.check(&TokenKind::Colon) {
            self.advance();
            self.parse_type()?
        } else {
            TypeExpr::Void
        };

        let body = self.parse_block()?;

        Ok(FuncDecl {
            name,
            params,
            ret,
            body,
            pos,
        })
    }

    pub fn parse(&mut self) -> Result<Program, ParseError> {
        let mut functions = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if !self.check(&TokenKind::Func) {
                return Err(self.unexpected("'func'"));
            }
            functions.push(self.parse_func()?);
        }
        Ok(Program { functions })
    }
}
