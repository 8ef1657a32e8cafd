//! Parser: recursive descent parser for script source
//!
//! Consumes tokens from the lexer and produces a list of [`Stmt`]s.
//! Binary operators are parsed by precedence climbing, lowest first:
//! assignment, conditional, `??`, `||`, `&&`, equality, relational,
//! additive, multiplicative, unary, postfix.

use crate::ast::*;
use crate::errors::{ScriptError, ScriptResult};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::value::number;
use serde_json::Value;

/// Maximum nesting of statements and expressions
const MAX_DEPTH: usize = 128;

/// Parser for script source
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Parse script source into a program
    pub fn parse(input: &str) -> ScriptResult<Vec<Stmt>> {
        let mut parser = Self::from_source(input)?;
        let mut program = Vec::new();
        while !parser.check(TokenKind::Eof) {
            program.push(parser.parse_statement()?);
        }
        Ok(program)
    }

    fn from_source(input: &str) -> ScriptResult<Self> {
        let tokens = Lexer::new(input).tokenize()?;
        Ok(Self {
            tokens,
            pos: 0,
            depth: 0,
        })
    }

    // ── Statements ───────────────────────────────────────────────────

    fn parse_statement(&mut self) -> ScriptResult<Stmt> {
        self.enter()?;
        let stmt = self.parse_statement_inner();
        self.depth -= 1;
        stmt
    }

    fn parse_statement_inner(&mut self) -> ScriptResult<Stmt> {
        match self.peek_kind() {
            TokenKind::Let | TokenKind::Const | TokenKind::Var => self.parse_declaration(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.advance();
                self.expect(TokenKind::OpenParen)?;
                let condition = self.parse_expression()?;
                self.expect(TokenKind::CloseParen)?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { condition, body })
            }
            TokenKind::For => self.parse_for_of(),
            TokenKind::Break => {
                self.advance();
                self.consume_semicolon();
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                self.advance();
                self.consume_semicolon();
                Ok(Stmt::Continue)
            }
            TokenKind::Return => {
                self.advance();
                let value = if matches!(
                    self.peek_kind(),
                    TokenKind::Semicolon | TokenKind::CloseBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.consume_semicolon();
                Ok(Stmt::Return(value))
            }
            TokenKind::OpenBrace => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt::Empty)
            }
            TokenKind::Reserved => Err(self.unsupported()),
            _ => {
                let expr = self.parse_expression()?;
                self.consume_semicolon();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_declaration(&mut self) -> ScriptResult<Stmt> {
        let keyword = self.advance().kind;
        let mutable = keyword != TokenKind::Const;
        let name = self.expect_identifier()?;
        let init = if self.check(TokenKind::Assign) {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };
        if !mutable && init.is_none() {
            return Err(self.error_here("Missing initializer in const declaration"));
        }
        self.consume_semicolon();
        Ok(Stmt::Declare {
            name,
            mutable,
            init,
        })
    }

    fn parse_if(&mut self) -> ScriptResult<Stmt> {
        self.expect(TokenKind::If)?;
        self.expect(TokenKind::OpenParen)?;
        let condition = self.parse_expression()?;
        self.expect(TokenKind::CloseParen)?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.check(TokenKind::Else) {
            self.advance();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn parse_for_of(&mut self) -> ScriptResult<Stmt> {
        self.expect(TokenKind::For)?;
        self.expect(TokenKind::OpenParen)?;
        if matches!(
            self.peek_kind(),
            TokenKind::Let | TokenKind::Const | TokenKind::Var
        ) {
            self.advance();
        }
        let name = self.expect_identifier()?;
        if !self.check(TokenKind::Of) {
            return Err(self.error_here("Only 'for (x of items)' loops are supported"));
        }
        self.advance();
        let iterable = self.parse_expression()?;
        self.expect(TokenKind::CloseParen)?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::ForOf {
            name,
            iterable,
            body,
        })
    }

    fn parse_block(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.expect(TokenKind::OpenBrace)?;
        let mut stmts = Vec::new();
        while !self.check(TokenKind::CloseBrace) {
            if self.check(TokenKind::Eof) {
                return Err(self.error_here("Unexpected end of input, expected }"));
            }
            stmts.push(self.parse_statement()?);
        }
        self.advance();
        Ok(stmts)
    }

    // ── Expressions ──────────────────────────────────────────────────

    pub(crate) fn parse_expression(&mut self) -> ScriptResult<Expr> {
        self.enter()?;
        let expr = self.parse_assignment();
        self.depth -= 1;
        expr
    }

    fn parse_assignment(&mut self) -> ScriptResult<Expr> {
        if self.is_arrow_start() {
            return self.parse_arrow();
        }
        let target = self.parse_conditional()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => AssignOp::Set,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            _ => return Ok(target),
        };
        if !matches!(
            target,
            Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
        ) {
            return Err(self.error_here("Invalid assignment target"));
        }
        self.advance();
        let value = self.parse_expression()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        })
    }

    fn parse_conditional(&mut self) -> ScriptResult<Expr> {
        let condition = self.parse_nullish()?;
        if !self.check(TokenKind::Question) {
            return Ok(condition);
        }
        self.advance();
        let then_expr = self.parse_expression()?;
        self.expect(TokenKind::Colon)?;
        let else_expr = self.parse_expression()?;
        Ok(Expr::Conditional {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn parse_nullish(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_or()?;
        while self.check(TokenKind::Nullish) {
            self.advance();
            let right = self.parse_or()?;
            left = logical(LogicalOp::Nullish, left, right);
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_and()?;
        while self.check(TokenKind::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = logical(LogicalOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.check(TokenKind::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = logical(LogicalOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::EqEqEq => BinaryOp::StrictEq,
                TokenKind::NotEqEq => BinaryOp::StrictNotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_relational()?;
            left = binary(op, left, right);
        }
    }

    fn parse_relational(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> ScriptResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Typeof => UnaryOp::Typeof,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            expr: Box::new(operand?),
        })
    }

    fn parse_postfix(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let property = self.expect_property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                        optional: false,
                    };
                }
                TokenKind::QuestionDot => {
                    self.advance();
                    expr = match self.peek_kind() {
                        TokenKind::OpenBracket => {
                            self.advance();
                            let index = self.parse_expression()?;
                            self.expect(TokenKind::CloseBracket)?;
                            Expr::Index {
                                object: Box::new(expr),
                                index: Box::new(index),
                                optional: true,
                            }
                        }
                        _ => Expr::Member {
                            object: Box::new(expr),
                            property: self.expect_property_name()?,
                            optional: true,
                        },
                    };
                }
                TokenKind::OpenBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::CloseBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: false,
                    };
                }
                TokenKind::OpenParen => {
                    self.advance();
                    let args = self.parse_arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_arguments(&mut self) -> ScriptResult<Vec<Expr>> {
        let mut args = Vec::new();
        while !self.check(TokenKind::CloseParen) {
            args.push(self.parse_expression()?);
            if !self.check(TokenKind::CloseParen) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.advance();
        Ok(args)
    }

    fn parse_primary(&mut self) -> ScriptResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::NumberLiteral => {
                self.advance();
                let n: f64 = token
                    .text
                    .parse()
                    .map_err(|_| self.error_here("Invalid number"))?;
                Ok(Expr::Literal(number(n)))
            }
            TokenKind::StringLiteral => {
                self.advance();
                Ok(Expr::Literal(Value::String(token.text)))
            }
            TokenKind::TemplateLiteral => {
                self.advance();
                parse_template(&token)
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Null | TokenKind::Undefined => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Identifier => {
                self.advance();
                Ok(Expr::Ident(token.text))
            }
            TokenKind::OpenParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::CloseParen)?;
                Ok(expr)
            }
            TokenKind::OpenBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenKind::CloseBracket) {
                    items.push(self.parse_expression()?);
                    if !self.check(TokenKind::CloseBracket) {
                        self.expect(TokenKind::Comma)?;
                    }
                }
                self.advance();
                Ok(Expr::Array(items))
            }
            TokenKind::OpenBrace => self.parse_object(),
            TokenKind::Reserved => Err(self.unsupported()),
            TokenKind::Eof => Err(self.error_here("Unexpected end of input")),
            _ => Err(self.error_here(format!("Unexpected token '{}'", token.text))),
        }
    }

    fn parse_object(&mut self) -> ScriptResult<Expr> {
        self.expect(TokenKind::OpenBrace)?;
        let mut entries = Vec::new();
        while !self.check(TokenKind::CloseBrace) {
            let key_token = self.advance().clone();
            let key = match key_token.kind {
                TokenKind::Identifier | TokenKind::StringLiteral | TokenKind::NumberLiteral => {
                    key_token.text.clone()
                }
                kind if is_keyword(kind) => key_token.text.clone(),
                _ => {
                    return Err(ScriptError::syntax(
                        key_token.line,
                        key_token.col,
                        format!("Unexpected token '{}' in object literal", key_token.text),
                    ))
                }
            };
            let value = if self.check(TokenKind::Colon) {
                self.advance();
                self.parse_expression()?
            } else if key_token.kind == TokenKind::Identifier {
                Expr::Ident(key.clone())
            } else {
                return Err(self.error_here("Expected ':' in object literal"));
            };
            entries.push((key, value));
            if !self.check(TokenKind::CloseBrace) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.advance();
        Ok(Expr::Object(entries))
    }

    fn is_arrow_start(&self) -> bool {
        let kind_at = |offset: usize| {
            self.tokens
                .get(self.pos + offset)
                .map(|t| t.kind)
                .unwrap_or(TokenKind::Eof)
        };
        match kind_at(0) {
            TokenKind::Identifier => kind_at(1) == TokenKind::Arrow,
            TokenKind::OpenParen => {
                let mut offset = 1;
                if kind_at(offset) == TokenKind::CloseParen {
                    return kind_at(offset + 1) == TokenKind::Arrow;
                }
                loop {
                    if kind_at(offset) != TokenKind::Identifier {
                        return false;
                    }
                    offset += 1;
                    match kind_at(offset) {
                        TokenKind::Comma => offset += 1,
                        TokenKind::CloseParen => return kind_at(offset + 1) == TokenKind::Arrow,
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn parse_arrow(&mut self) -> ScriptResult<Expr> {
        let mut params = Vec::new();
        if self.check(TokenKind::Identifier) {
            params.push(self.expect_identifier()?);
        } else {
            self.expect(TokenKind::OpenParen)?;
            while !self.check(TokenKind::CloseParen) {
                params.push(self.expect_identifier()?);
                if !self.check(TokenKind::CloseParen) {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.advance();
        }
        self.expect(TokenKind::Arrow)?;
        let body = if self.check(TokenKind::OpenBrace) {
            ArrowBody::Block(self.parse_block()?)
        } else {
            ArrowBody::Expr(Box::new(self.parse_expression()?))
        };
        Ok(Expr::Arrow { params, body })
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn enter(&mut self) -> ScriptResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(self.error_here("Script is nested too deeply"));
        }
        Ok(())
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> &Token {
        let idx = self.pos.min(self.tokens.len() - 1);
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        &self.tokens[idx]
    }

    fn consume_semicolon(&mut self) {
        if self.check(TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ScriptResult<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else if self.check(TokenKind::Eof) {
            Err(self.error_here(format!("Unexpected end of input, expected {}", kind)))
        } else {
            let found = self.peek().text.clone();
            Err(self.error_here(format!("Expected {}, found '{}'", kind, found)))
        }
    }

    fn expect_identifier(&mut self) -> ScriptResult<String> {
        let tok = self.expect(TokenKind::Identifier)?;
        Ok(tok.text.clone())
    }

    /// Property names may be keywords (`record.default`, `x.of`)
    fn expect_property_name(&mut self) -> ScriptResult<String> {
        let kind = self.peek_kind();
        if kind == TokenKind::Identifier || is_keyword(kind) {
            Ok(self.advance().text.clone())
        } else {
            Err(self.error_here(format!(
                "Expected property name, found '{}'",
                self.peek().text
            )))
        }
    }

    fn error_here(&self, message: impl std::fmt::Display) -> ScriptError {
        let tok = self.peek();
        ScriptError::syntax(tok.line, tok.col, message)
    }

    fn unsupported(&self) -> ScriptError {
        self.error_here(format!("'{}' is not supported in scripts", self.peek().text))
    }
}

fn is_keyword(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Let
            | TokenKind::Const
            | TokenKind::Var
            | TokenKind::If
            | TokenKind::Else
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Of
            | TokenKind::Break
            | TokenKind::Continue
            | TokenKind::Return
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null
            | TokenKind::Undefined
            | TokenKind::Typeof
            | TokenKind::Reserved
    )
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn logical(op: LogicalOp, left: Expr, right: Expr) -> Expr {
    Expr::Logical {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Split a template body into text and `${expr}` parts
fn parse_template(token: &Token) -> ScriptResult<Expr> {
    let chars: Vec<char> = token.text.chars().collect();
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                text.push(chars[i + 1]);
                i += 2;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let mut depth = 1;
                let mut end = start;
                while end < chars.len() {
                    match chars[end] {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    end += 1;
                }
                if depth != 0 {
                    return Err(ScriptError::syntax(
                        token.line,
                        token.col,
                        "Unterminated ${ in template literal",
                    ));
                }
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                let source: String = chars[start..end].iter().collect();
                let mut inner = Parser::from_source(&source)?;
                let expr = inner.parse_expression()?;
                if !inner.check(TokenKind::Eof) {
                    return Err(inner.error_here("Unexpected token in template expression"));
                }
                parts.push(TemplatePart::Expr(expr));
                i = end + 1;
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }
    Ok(Expr::Template(parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_expr(src: &str) -> Expr {
        match Parser::parse(src).unwrap().remove(0) {
            Stmt::Expr(e) => e,
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expr("1 + 2 * 3");
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. })),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_chain_and_call() {
        let expr = parse_expr("input.items.filter(i => i.qty > 1).length");
        match expr {
            Expr::Member { object, property, .. } => {
                assert_eq!(property, "length");
                assert!(matches!(*object, Expr::Call { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arrow_with_parens_and_block() {
        let expr = parse_expr("(a, b) => { return a + b; }");
        match expr {
            Expr::Arrow { params, body } => {
                assert_eq!(params, vec!["a".to_string(), "b".to_string()]);
                assert!(matches!(body, ArrowBody::Block(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parenthesized_expression_is_not_arrow() {
        let expr = parse_expr("(a) + 1");
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn test_statements() {
        let program = Parser::parse(
            "let total = 0;\nfor (const item of input.items) { if (item.qty > 0) total += item.qty; else continue }\nreturn total",
        )
        .unwrap();
        assert_eq!(program.len(), 3);
        assert!(matches!(program[0], Stmt::Declare { mutable: true, .. }));
        assert!(matches!(program[1], Stmt::ForOf { .. }));
        assert!(matches!(program[2], Stmt::Return(Some(_))));
    }

    #[test]
    fn test_object_literal_shorthand_and_keyword_keys() {
        let expr = parse_expr("({ a, 'b': 1, default: 2 })");
        match expr {
            Expr::Object(entries) => {
                let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["a", "b", "default"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_template_literal() {
        let expr = parse_expr("`Hello ${user.name}!`");
        match expr {
            Expr::Template(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], TemplatePart::Text("Hello ".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_expr("42"), Expr::Literal(json!(42)));
        assert_eq!(parse_expr("undefined"), Expr::Literal(Value::Null));
    }

    #[test]
    fn test_const_requires_initializer() {
        let err = Parser::parse("const x;").unwrap_err();
        assert!(err.message.contains("Missing initializer"));
    }

    #[test]
    fn test_function_keyword_rejected() {
        let err = Parser::parse("function f() {}").unwrap_err();
        assert!(err.message.contains("'function' is not supported"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(Parser::parse("1 = 2").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let src = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        let err = Parser::parse(&src).unwrap_err();
        assert!(err.message.contains("nested too deeply"));
    }

    #[test]
    fn test_unterminated_block() {
        let err = Parser::parse("if (x) {").unwrap_err();
        assert!(err.message.contains("Unexpected end of input"));
    }
}
