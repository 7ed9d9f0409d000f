//! Recursive-descent parser producing the syntax tree the interpreter walks.
use std::sync::Arc;

use super::{
    lexer::{tokenize, Keyword, Punct, Spanned, Token},
    CompileError,
};

/// Deepest nesting of statements and expressions a script may have.
const MAX_NESTING: usize = 128;

/// Names under which the capabilities are passed to a bare script.
pub(crate) const DEFAULT_PARAMS: [&str; 4] = ["context", "enabled", "disabled", "http"];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Program {
    /// Names the capabilities are bound to: context, enabled, disabled, http.
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Literal),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
}

/// Left-hand side of an assignment: a variable, optionally with one property or index.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Variable(String),
    Property(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Let(String, Option<Expr>),
    Assign(Target, Expr),
    Expr(Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    Return(Option<Expr>),
    Throw(Expr),
    Function(Arc<Function>),
}

enum Postfix {
    Member,
    Index,
    Call,
}

struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with Eof and `advance` never moves past it.
        &self.tokens[self.position.min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token != Token::Eof {
            self.position += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        let spanned = &self.tokens[self.position.min(self.tokens.len() - 1)];
        CompileError {
            message: message.into(),
            line: spanned.line,
            column: spanned.column,
        }
    }

    fn at_punct(&self, punct: Punct) -> bool {
        *self.peek() == Token::Punct(punct)
    }

    fn at_keyword(&self, keyword: Keyword) -> bool {
        *self.peek() == Token::Keyword(keyword)
    }

    fn eat_punct(&mut self, punct: Punct) -> bool {
        let found = self.at_punct(punct);
        if found {
            self.advance();
        }
        found
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.advance();
        }
        found
    }

    fn expect_punct(&mut self, punct: Punct, what: &str) -> Result<(), CompileError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", describe(self.peek()))))
        }
    }

    fn ident(&mut self) -> Result<String, CompileError> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, found {}", describe(other)))),
        }
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Parser) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        self.deepen()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn deepen(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("script is nested too deeply"));
        }
        Ok(())
    }

    /// Operator chains build left-deep trees: every application is one more level for the
    /// interpreter, so it counts against [`MAX_NESTING`] until the chain ends.
    fn chained<T>(
        &mut self,
        parse: impl FnOnce(&mut Parser, &mut usize) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        let mut applied = 0;
        let result = parse(self, &mut applied);
        self.depth -= applied;
        result
    }

    fn program(&mut self) -> Result<Program, CompileError> {
        if self.at_keyword(Keyword::Function) {
            if let Some(program) = self.wrapper()? {
                return Ok(program);
            }
            // A leading helper function followed by more statements.
            self.position = 0;
        }
        let mut body = Vec::new();
        while *self.peek() != Token::Eof {
            body.push(self.statement()?);
        }
        Ok(Program {
            params: DEFAULT_PARAMS.iter().map(|param| param.to_string()).collect(),
            body,
        })
    }

    /// `function [name](params) { body }` spanning the whole script.
    fn wrapper(&mut self) -> Result<Option<Program>, CompileError> {
        self.advance();
        if matches!(self.peek(), Token::Ident(_)) {
            self.advance();
        }
        let params = self.params()?;
        let body = self.block()?;
        while self.eat_punct(Punct::Semicolon) {}
        Ok((*self.peek() == Token::Eof).then_some(Program { params, body }))
    }

    fn params(&mut self) -> Result<Vec<String>, CompileError> {
        self.expect_punct(Punct::LParen, "`(`")?;
        let mut params = Vec::new();
        while !self.eat_punct(Punct::RParen) {
            params.push(self.ident()?);
            if !self.at_punct(Punct::RParen) {
                self.expect_punct(Punct::Comma, "`,` or `)`")?;
            }
        }
        Ok(params)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect_punct(Punct::LBrace, "`{`")?;
        let mut body = Vec::new();
        while !self.eat_punct(Punct::RBrace) {
            if *self.peek() == Token::Eof {
                return Err(self.error("expected `}`"));
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    /// A block or a single statement.
    fn branch(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if self.at_punct(Punct::LBrace) {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        self.nested(|parser| {
            let statement = parser.statement_inner()?;
            while parser.eat_punct(Punct::Semicolon) {}
            Ok(statement)
        })
    }

    fn statement_inner(&mut self) -> Result<Stmt, CompileError> {
        match self.peek() {
            Token::Keyword(Keyword::Let | Keyword::Var | Keyword::Const) => {
                self.advance();
                let name = self.ident()?;
                let value = if self.eat_punct(Punct::Assign) {
                    Some(self.expression()?)
                } else {
                    None
                };
                Ok(Stmt::Let(name, value))
            }
            Token::Keyword(Keyword::If) => {
                self.advance();
                let condition = self.expression()?;
                self.eat_keyword(Keyword::Then);
                let then = self.branch()?;
                let otherwise = if self.eat_keyword(Keyword::Else) {
                    self.branch()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::If(condition, then, otherwise))
            }
            Token::Keyword(Keyword::While) => {
                self.advance();
                let condition = self.expression()?;
                let body = self.branch()?;
                Ok(Stmt::While(condition, body))
            }
            Token::Keyword(Keyword::Return) => {
                self.advance();
                let value = if matches!(
                    self.peek(),
                    Token::Punct(Punct::Semicolon | Punct::RBrace) | Token::Eof
                ) {
                    None
                } else {
                    Some(self.expression()?)
                };
                Ok(Stmt::Return(value))
            }
            Token::Keyword(Keyword::Throw) => {
                self.advance();
                Ok(Stmt::Throw(self.expression()?))
            }
            Token::Keyword(Keyword::Function) => {
                self.advance();
                let name = self.ident()?;
                let params = self.params()?;
                let body = self.block()?;
                Ok(Stmt::Function(Arc::new(Function { name, params, body })))
            }
            _ => {
                let expression = self.expression()?;
                if !self.eat_punct(Punct::Assign) {
                    return Ok(Stmt::Expr(expression));
                }
                let target = match expression {
                    Expr::Ident(name) => Target::Variable(name),
                    Expr::Member(object, property) => match *object {
                        Expr::Ident(name) => {
                            Target::Property(name, Expr::Literal(Literal::Str(property)))
                        }
                        _ => return Err(self.error("unsupported assignment target")),
                    },
                    Expr::Index(object, index) => match *object {
                        Expr::Ident(name) => Target::Property(name, *index),
                        _ => return Err(self.error("unsupported assignment target")),
                    },
                    _ => return Err(self.error("invalid assignment target")),
                };
                Ok(Stmt::Assign(target, self.expression()?))
            }
        }
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.nested(Parser::or)
    }

    fn or(&mut self) -> Result<Expr, CompileError> {
        self.logical_level(Punct::Or, LogicalOp::Or, Parser::and)
    }

    fn and(&mut self) -> Result<Expr, CompileError> {
        self.logical_level(Punct::And, LogicalOp::And, Parser::equality)
    }

    fn logical_level(
        &mut self,
        punct: Punct,
        op: LogicalOp,
        operand: fn(&mut Parser) -> Result<Expr, CompileError>,
    ) -> Result<Expr, CompileError> {
        self.chained(|parser, applied| {
            let mut left = operand(parser)?;
            while parser.eat_punct(punct) {
                *applied += 1;
                parser.deepen()?;
                left = Expr::Logical(op, Box::new(left), Box::new(operand(parser)?));
            }
            Ok(left)
        })
    }

    fn binary_level(
        &mut self,
        operators: &[(Punct, BinaryOp)],
        operand: fn(&mut Parser) -> Result<Expr, CompileError>,
    ) -> Result<Expr, CompileError> {
        self.chained(|parser, applied| {
            let mut left = operand(parser)?;
            'outer: loop {
                for (punct, op) in operators {
                    if parser.eat_punct(*punct) {
                        *applied += 1;
                        parser.deepen()?;
                        left = Expr::Binary(*op, Box::new(left), Box::new(operand(parser)?));
                        continue 'outer;
                    }
                }
                return Ok(left);
            }
        })
    }

    fn equality(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[
                (Punct::Eq, BinaryOp::Eq),
                (Punct::StrictEq, BinaryOp::Eq),
                (Punct::NotEq, BinaryOp::NotEq),
                (Punct::StrictNotEq, BinaryOp::NotEq),
            ],
            Parser::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[
                (Punct::Lt, BinaryOp::Lt),
                (Punct::LtEq, BinaryOp::LtEq),
                (Punct::Gt, BinaryOp::Gt),
                (Punct::GtEq, BinaryOp::GtEq),
            ],
            Parser::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[(Punct::Plus, BinaryOp::Add), (Punct::Minus, BinaryOp::Sub)],
            Parser::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[
                (Punct::Star, BinaryOp::Mul),
                (Punct::Slash, BinaryOp::Div),
                (Punct::Percent, BinaryOp::Rem),
            ],
            Parser::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let op = if self.eat_punct(Punct::Bang) {
            UnaryOp::Not
        } else if self.eat_punct(Punct::Minus) {
            UnaryOp::Neg
        } else {
            return self.postfix();
        };
        let operand = self.nested(Parser::unary)?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        self.chained(|parser, applied| {
            let mut expression = parser.primary()?;
            loop {
                let postfix = if parser.eat_punct(Punct::Dot) {
                    Postfix::Member
                } else if parser.eat_punct(Punct::LBracket) {
                    Postfix::Index
                } else if parser.eat_punct(Punct::LParen) {
                    Postfix::Call
                } else {
                    return Ok(expression);
                };
                *applied += 1;
                parser.deepen()?;
                expression = match postfix {
                    Postfix::Member => {
                        let property = parser.property_name()?;
                        Expr::Member(Box::new(expression), property)
                    }
                    Postfix::Index => {
                        let index = parser.expression()?;
                        parser.expect_punct(Punct::RBracket, "`]`")?;
                        Expr::Index(Box::new(expression), Box::new(index))
                    }
                    Postfix::Call => {
                        let mut args = Vec::new();
                        while !parser.eat_punct(Punct::RParen) {
                            args.push(parser.expression()?);
                            if !parser.at_punct(Punct::RParen) {
                                parser.expect_punct(Punct::Comma, "`,` or `)`")?;
                            }
                        }
                        Expr::Call(Box::new(expression), args)
                    }
                };
            }
        })
    }

    /// Property names may be keywords (`response.then`, `flags.null`).
    fn property_name(&mut self) -> Result<String, CompileError> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            Token::Keyword(keyword) => Ok(format!("{keyword:?}").to_lowercase()),
            other => Err(self.error(format!("expected property name, found {}", describe(&other)))),
        }
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let expression = match self.advance() {
            Token::Number(n) => Expr::Literal(Literal::Number(n)),
            Token::Str(s) => Expr::Literal(Literal::Str(s)),
            Token::Ident(name) => Expr::Ident(name),
            Token::Keyword(Keyword::True) => Expr::Literal(Literal::Bool(true)),
            Token::Keyword(Keyword::False) => Expr::Literal(Literal::Bool(false)),
            Token::Keyword(Keyword::Null | Keyword::Undefined) => Expr::Literal(Literal::Null),
            Token::Punct(Punct::LParen) => {
                let inner = self.expression()?;
                self.expect_punct(Punct::RParen, "`)`")?;
                inner
            }
            Token::Punct(Punct::LBracket) => {
                let mut items = Vec::new();
                while !self.eat_punct(Punct::RBracket) {
                    items.push(self.expression()?);
                    if !self.at_punct(Punct::RBracket) {
                        self.expect_punct(Punct::Comma, "`,` or `]`")?;
                    }
                }
                Expr::Array(items)
            }
            Token::Punct(Punct::LBrace) => {
                let mut fields = Vec::new();
                while !self.eat_punct(Punct::RBrace) {
                    let name = match self.advance() {
                        Token::Ident(name) | Token::Str(name) => name,
                        other => {
                            return Err(self.error(format!(
                                "expected property name, found {}",
                                describe(&other)
                            )))
                        }
                    };
                    self.expect_punct(Punct::Colon, "`:`")?;
                    fields.push((name, self.expression()?));
                    if !self.at_punct(Punct::RBrace) {
                        self.expect_punct(Punct::Comma, "`,` or `}`")?;
                    }
                }
                Expr::Object(fields)
            }
            other => return Err(self.error(format!("unexpected {}", describe(&other)))),
        };
        Ok(expression)
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {n}"),
        Token::Str(s) => format!("string {s:?}"),
        Token::Ident(name) => format!("identifier `{name}`"),
        Token::Keyword(keyword) => format!("keyword `{}`", format!("{keyword:?}").to_lowercase()),
        Token::Punct(punct) => format!("`{punct:?}`"),
        Token::Eof => "end of script".to_owned(),
    }
}

/// Parse a complete script.
pub(crate) fn parse(source: &str) -> Result<Program, CompileError> {
    Parser {
        tokens: tokenize(source)?,
        position: 0,
        depth: 0,
    }
    .program()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_owned()))
    }

    #[test]
    fn parses_if_then_else() {
        let program =
            parse(r#"if context.user == "a@b.com" then enabled() else disabled()"#).unwrap();
        assert_eq!(program.params, DEFAULT_PARAMS);
        assert_eq!(
            program.body,
            vec![Stmt::If(
                Expr::Binary(
                    BinaryOp::Eq,
                    Box::new(Expr::Member(ident("context"), "user".into())),
                    Box::new(Expr::Literal(Literal::Str("a@b.com".into()))),
                ),
                vec![Stmt::Expr(Expr::Call(ident("enabled"), vec![]))],
                vec![Stmt::Expr(Expr::Call(ident("disabled"), vec![]))],
            )]
        );
    }

    #[test]
    fn parses_function_wrapper() {
        let program = parse(
            "function check(ctx, on, off, net) {\n  if (ctx.beta) { on(); } else { off(); }\n}",
        )
        .unwrap();
        assert_eq!(program.params, vec!["ctx", "on", "off", "net"]);
        assert_eq!(program.body.len(), 1);

        let helper = parse("function on(x) { return x }\nif (on(1)) enabled()").unwrap();
        assert_eq!(helper.params, DEFAULT_PARAMS);
        assert!(matches!(helper.body[0], Stmt::Function(_)));
    }

    #[test]
    fn respects_precedence() {
        let program = parse("let x = 1 + 2 * 3 < 10 && !done").unwrap();
        let Stmt::Let(_, Some(Expr::Logical(LogicalOp::And, left, right))) = &program.body[0]
        else {
            panic!("unexpected tree: {:?}", program.body);
        };
        assert!(matches!(**left, Expr::Binary(BinaryOp::Lt, _, _)));
        assert!(matches!(**right, Expr::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn parses_assignments() {
        let program = parse("let o = {a: 1}; o.a = 2; o['b'] = 3; n = o.a").unwrap();
        assert!(matches!(program.body[1], Stmt::Assign(Target::Property(..), _)));
        assert!(matches!(program.body[3], Stmt::Assign(Target::Variable(_), _)));
        assert!(parse("f() = 1").is_err());
    }

    #[test]
    fn rejects_malformed_scripts_with_position() {
        let err = parse("if (x {").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(parse("let = 3").is_err());
        assert!(parse("function f( { }").is_err());
        assert!(parse("enabled() }").is_err());
    }

    #[test]
    fn limits_nesting() {
        let deep = format!("let x = {}1{}", "(".repeat(500), ")".repeat(500));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nested too deeply"));
    }

    #[test]
    fn limits_operator_chains() {
        let too_long = [
            format!("let x = 1{}", "+1".repeat(50_000)),
            format!("let x = a{}", " && b".repeat(50_000)),
            format!("let x = context{}", ".user".repeat(50_000)),
            format!("let x = f{}", "()".repeat(50_000)),
            format!("let x = a{}", "[0]".repeat(50_000)),
        ];
        for source in too_long {
            let err = parse(&source).unwrap_err();
            assert!(err.message.contains("nested too deeply"), "{}", err.message);
        }

        // Chains end where their depth is given back.
        let statements = "let x = 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1\n".repeat(1_000);
        assert_eq!(parse(&statements).unwrap().body.len(), 1_000);
        let chain = format!("let x = 1{}", "+1".repeat(100));
        assert!(parse(&chain).is_ok());
    }
}
