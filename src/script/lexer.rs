use super::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Keyword(Keyword),
    Punct(Punct),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keyword {
    Let,
    Var,
    Const,
    If,
    Then,
    Else,
    While,
    Return,
    Throw,
    Function,
    True,
    False,
    Null,
    Undefined,
}

impl Keyword {
    fn parse(word: &str) -> Option<Keyword> {
        Some(match word {
            "let" => Keyword::Let,
            "var" => Keyword::Var,
            "const" => Keyword::Const,
            "if" => Keyword::If,
            "then" => Keyword::Then,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "return" => Keyword::Return,
            "throw" => Keyword::Throw,
            "function" => Keyword::Function,
            "true" => Keyword::True,
            "false" => Keyword::False,
            "null" => Keyword::Null,
            "undefined" => Keyword::Undefined,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,
    Colon,
    Assign,
    Or,
    And,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
}

/// A token and the position (1-based) where it starts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl Lexer<'_> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line: self.line,
            column: self.column,
        }
    }

    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    match lookahead.next() {
                        Some('/') => {
                            while !matches!(self.peek(), None | Some('\n')) {
                                self.bump();
                            }
                        }
                        Some('*') => {
                            self.bump();
                            self.bump();
                            loop {
                                match self.bump() {
                                    Some('*') if self.eat('/') => break,
                                    Some(_) => {}
                                    None => return Err(self.error("unterminated comment")),
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<Token, CompileError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => return Ok(Token::Str(value)),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('u') => {
                            let mut code = 0;
                            for _ in 0..4 {
                                let digit = self
                                    .bump()
                                    .and_then(|c| c.to_digit(16))
                                    .ok_or_else(|| self.error("invalid unicode escape"))?;
                                code = code * 16 + digit;
                            }
                            char::from_u32(code)
                                .ok_or_else(|| self.error("invalid unicode escape"))?
                        }
                        Some(c @ ('\\' | '\'' | '"')) => c,
                        _ => return Err(self.error("invalid escape sequence")),
                    };
                    value.push(escaped);
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn number(&mut self, first: char) -> Result<Token, CompileError> {
        let mut literal = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' || c == '_' {
                self.bump();
                if c != '_' {
                    literal.push(c);
                }
            } else {
                break;
            }
        }
        literal
            .parse()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number {literal:?}")))
    }

    fn punct(&mut self, c: char) -> Result<Punct, CompileError> {
        Ok(match c {
            '(' => Punct::LParen,
            ')' => Punct::RParen,
            '{' => Punct::LBrace,
            '}' => Punct::RBrace,
            '[' => Punct::LBracket,
            ']' => Punct::RBracket,
            ',' => Punct::Comma,
            ';' => Punct::Semicolon,
            '.' => Punct::Dot,
            ':' => Punct::Colon,
            '+' => Punct::Plus,
            '-' => Punct::Minus,
            '*' => Punct::Star,
            '/' => Punct::Slash,
            '%' => Punct::Percent,
            '|' if self.eat('|') => Punct::Or,
            '&' if self.eat('&') => Punct::And,
            '=' if self.eat('=') => {
                if self.eat('=') {
                    Punct::StrictEq
                } else {
                    Punct::Eq
                }
            }
            '=' => Punct::Assign,
            '!' if self.eat('=') => {
                if self.eat('=') {
                    Punct::StrictNotEq
                } else {
                    Punct::NotEq
                }
            }
            '!' => Punct::Bang,
            '<' if self.eat('=') => Punct::LtEq,
            '<' => Punct::Lt,
            '>' if self.eat('=') => Punct::GtEq,
            '>' => Punct::Gt,
            other => return Err(self.error(format!("unexpected character {other:?}"))),
        })
    }
}

/// Split `source` into tokens, ending with [`Token::Eof`].
pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();
    loop {
        lexer.skip_trivia()?;
        let (line, column) = (lexer.line, lexer.column);
        let Some(c) = lexer.bump() else {
            tokens.push(Spanned {
                token: Token::Eof,
                line,
                column,
            });
            return Ok(tokens);
        };
        let token = match c {
            '"' | '\'' => lexer.string(c)?,
            c if c.is_ascii_digit() => lexer.number(c)?,
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut word = String::from(c);
                while let Some(c) = lexer.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        word.push(c);
                        lexer.bump();
                    } else {
                        break;
                    }
                }
                match Keyword::parse(&word) {
                    Some(keyword) => Token::Keyword(keyword),
                    None => Token::Ident(word),
                }
            }
            c => Token::Punct(lexer.punct(c)?),
        };
        tokens.push(Spanned {
            token,
            line,
            column,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn tokenizes_operators_and_literals() {
        assert_eq!(
            tokens("a !== 'x\\n' && b >= 1.5 // trailing"),
            vec![
                Token::Ident("a".into()),
                Token::Punct(Punct::StrictNotEq),
                Token::Str("x\n".into()),
                Token::Punct(Punct::And),
                Token::Ident("b".into()),
                Token::Punct(Punct::GtEq),
                Token::Number(1.5),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn tracks_positions() {
        let spanned = tokenize("if x\n  /* c */ then").unwrap();
        assert_eq!((spanned[2].line, spanned[2].column), (2, 11));
        assert_eq!(spanned[2].token, Token::Keyword(Keyword::Then));
    }

    #[test]
    fn reports_errors_with_position() {
        let err = tokenize("let s = \"open").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated"));
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("a & b").is_err());
    }
}
