use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

use crate::token::{Token, TokenKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("{line}:{column}: unexpected character '{ch}'")]
    UnexpectedChar { ch: char, line: usize, column: usize },
    #[error("{line}:{column}: integer literal out of range: {text}")]
    IntOutOfRange {
        text: String,
        line: usize,
        column: usize,
    },
    #[error("{line}:{column}: malformed number literal: {text}")]
    MalformedNumber {
        text: String,
        line: usize,
        column: usize,
    },
    #[error("unterminated block comment starting at line {line}")]
    UnterminatedComment { line: usize },
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, TokenKind> = {
        let mut m = HashMap::new();
        m.insert("func", TokenKind::Func);
        m.insert("let", TokenKind::Let);
        m.insert("if", TokenKind::If);
        m.insert("else", TokenKind::Else);
        m.insert("for", TokenKind::For);
        m.insert("return", TokenKind::Return);
        m.insert("true", TokenKind::True);
        m.insert("false", TokenKind::False);
        m.insert("int", TokenKind::KwInt);
        m.insert("float", TokenKind::KwFloat);
        m.insert("bool", TokenKind::KwBool);
        m.insert("void", TokenKind::KwVoid);
        m
    };

    static ref INT_LITERAL: Regex = Regex::new("^[0-9]+$").unwrap();
    static ref FLOAT_LITERAL: Regex = Regex::new(r"^[0-9]+\.[0-9]+$").unwrap();
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if let Some(c) = ch {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        ch
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    // Consume a maximal digits[.digits] run, then classify it against the
    // literal patterns.
    fn read_number(&mut self) -> Result<TokenKind, LexError> {
        let line = self.line;
        let column = self.column;
        let mut text = String::new();

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else if ch == '.' && !text.contains('.') {
                // Only part of the literal when a digit follows.
                match self.peek(1) {
                    Some(next) if next.is_ascii_digit() => {
                        text.push(ch);
                        self.advance();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        if INT_LITERAL.is_match(&text) {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| LexError::IntOutOfRange { text, line, column })
        } else if FLOAT_LITERAL.is_match(&text) {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| LexError::MalformedNumber { text, line, column })
        } else {
            Err(LexError::MalformedNumber { text, line, column })
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut value = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        value
    }

    fn keyword_or_identifier(&self, ident: &str) -> TokenKind {
        match KEYWORDS.get(ident) {
            Some(kind) => kind.clone(),
            None => TokenKind::Ident(ident.to_string()),
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();

            let Some(ch) = self.current() else { break };
            let line = self.line;
            let column = self.column;

            // Line comment
            if ch == '/' && self.peek(1) == Some('/') {
                while let Some(c) = self.current() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            // Block comment
            if ch == '/' && self.peek(1) == Some('*') {
                self.advance();
                self.advance();
                let mut closed = false;
                while self.current().is_some() {
                    if self.current() == Some('*') && self.peek(1) == Some('/') {
                        self.advance();
                        self.advance();
                        closed = true;
                        break;
                    }
                    self.advance();
                }
                if !closed {
                    return Err(LexError::UnterminatedComment { line });
                }
                continue;
            }

            let kind = match ch {
                ';' => {
                    self.advance();
                    TokenKind::Semicolon
                }
                ',' => {
                    self.advance();
                    TokenKind::Comma
                }
                ':' => {
                    self.advance();
                    TokenKind::Colon
                }
                '(' => {
                    self.advance();
                    TokenKind::LeftParen
                }
                ')' => {
                    self.advance();
                    TokenKind::RightParen
                }
                '{' => {
                    self.advance();
                    TokenKind::LeftBrace
                }
                '}' => {
                    self.advance();
                    TokenKind::RightBrace
                }
                '[' => {
                    self.advance();
                    TokenKind::LeftBracket
                }
                ']' => {
                    self.advance();
                    TokenKind::RightBracket
                }
                '+' => {
                    self.advance();
                    TokenKind::Plus
                }
                '-' => {
                    self.advance();
                    TokenKind::Minus
                }
                '*' => {
                    self.advance();
                    TokenKind::Star
                }
                '/' => {
                    self.advance();
                    TokenKind::Slash
                }
                '%' => {
                    self.advance();
                    TokenKind::Percent
                }
                '=' => {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        TokenKind::Eq
                    } else {
                        TokenKind::Assign
                    }
                }
                '!' => {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        TokenKind::Ne
                    } else {
                        TokenKind::Not
                    }
                }
                '<' => {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        TokenKind::Le
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }
                '&' => {
                    self.advance();
                    if self.current() == Some('&') {
                        self.advance();
                        TokenKind::AndAnd
                    } else {
                        return Err(LexError::UnexpectedChar { ch, line, column });
                    }
                }
                '|' => {
                    self.advance();
                    if self.current() == Some('|') {
                        self.advance();
                        TokenKind::OrOr
                    } else {
                        return Err(LexError::UnexpectedChar { ch, line, column });
                    }
                }
                _ if ch.is_ascii_digit() => self.read_number()?,
                _ if ch.is_alphabetic() || ch == '_' => {
                    let ident = self.read_identifier();
                    self.keyword_or_identifier(&ident)
                }
                _ => return Err(LexError::UnexpectedChar { ch, line, column }),
            };

            tokens.push(Token::new(kind, line, column));
        }

        tokens.push(Token::new(TokenKind::Eof, self.line, self.column));
        Ok(tokens)
    }
}
