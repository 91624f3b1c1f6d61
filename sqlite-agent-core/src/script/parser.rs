use std::sync::Arc;

use serde_json::{Number, Value};

use crate::script::ast::{
    Arg, BinaryOp, Expr, FunctionDef, IfBranch, Param, Program, SchemaDef, SchemaFieldDef, Stmt,
    StmtKind, UnaryOp,
};
use crate::script::lexer::{tokenize, Spanned, Token};
use crate::script::ScriptError;

pub fn parse_program(source: &str) -> Result<Program, ScriptError> {
    Parser::new(tokenize(source)?).parse_program()
}

const MAX_NESTING: usize = 64;

pub struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            index: 0,
            depth: 0,
        }
    }

    pub fn parse_program(mut self) -> Result<Program, ScriptError> {
        let mut statements = Vec::new();
        while self.peek().is_some() {
            if self.match_token(|t| matches!(t, Token::Semicolon)) {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Program { statements })
    }

    fn parse_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of input"));
        };

        let kind = match token {
            Token::Fn => {
                self.index += 1;
                StmtKind::Function(Arc::new(self.parse_function()?))
            }
            Token::Schema => {
                self.index += 1;
                StmtKind::Schema(self.parse_schema()?)
            }
            Token::Let => {
                self.index += 1;
                let name = self.expect_identifier("expected variable name after 'let'")?;
                self.consume(|t| matches!(t, Token::Assign), "expected '=' after variable name")?;
                StmtKind::Let {
                    name,
                    value: self.parse_expression()?,
                }
            }
            Token::If => {
                self.index += 1;
                self.parse_if()?
            }
            Token::For => {
                self.index += 1;
                let item = self.expect_identifier("expected loop variable after 'for'")?;
                self.consume(|t| matches!(t, Token::In), "expected 'in' after loop variable")?;
                let iterable = self.parse_expression()?;
                StmtKind::For {
                    item,
                    iterable,
                    body: self.parse_block()?,
                }
            }
            Token::While => {
                self.index += 1;
                let condition = self.parse_expression()?;
                StmtKind::While {
                    condition,
                    body: self.parse_block()?,
                }
            }
            Token::Return => {
                self.index += 1;
                let ends = matches!(self.peek(), None | Some(Token::RBrace | Token::Semicolon));
                StmtKind::Return(if ends {
                    None
                } else {
                    Some(self.parse_expression()?)
                })
            }
            Token::Identifier(name) if matches!(self.peek_at(1), Some(Token::Assign)) => {
                self.index += 2;
                StmtKind::Assign {
                    name,
                    value: self.parse_expression()?,
                }
            }
            _ => StmtKind::Expr(self.parse_expression()?),
        };

        self.match_token(|t| matches!(t, Token::Semicolon));
        Ok(Stmt { kind, line })
    }

    fn parse_function(&mut self) -> Result<FunctionDef, ScriptError> {
        let name = self.expect_identifier("expected function name after 'fn'")?;
        self.consume(|t| matches!(t, Token::LParen), "expected '(' after function name")?;

        let mut params: Vec<Param> = Vec::new();
        if !self.match_token(|t| matches!(t, Token::RParen)) {
            loop {
                let param = self.expect_identifier("expected parameter name")?;
                if params.iter().any(|existing| existing.name == param) {
                    return Err(self.error(format!("duplicate parameter '{param}'")));
                }
                let default = if self.match_token(|t| matches!(t, Token::Assign)) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                params.push(Param {
                    name: param,
                    default,
                });
                if self.match_token(|t| matches!(t, Token::RParen)) {
                    break;
                }
                self.consume(|t| matches!(t, Token::Comma), "expected ',' between parameters")?;
                if self.match_token(|t| matches!(t, Token::RParen)) {
                    break;
                }
            }
        }

        Ok(FunctionDef {
            name,
            params,
            body: self.parse_block()?,
        })
    }

    fn parse_schema(&mut self) -> Result<SchemaDef, ScriptError> {
        let name = self.expect_identifier("expected schema name after 'schema'")?;
        self.consume(|t| matches!(t, Token::LBrace), "expected '{' after schema name")?;

        let mut fields: Vec<SchemaFieldDef> = Vec::new();
        loop {
            if self.match_token(|t| matches!(t, Token::RBrace)) {
                break;
            }
            if self.match_token(|t| matches!(t, Token::Comma | Token::Semicolon)) {
                continue;
            }

            let field = self.expect_identifier("expected field name in schema")?;
            if fields.iter().any(|existing| existing.name == field) {
                return Err(self.error(format!("duplicate field '{field}' in schema '{name}'")));
            }
            self.consume(|t| matches!(t, Token::Colon), "expected ':' after field name")?;
            let type_name = self.expect_identifier("expected field type")?;
            let optional = self.match_token(|t| matches!(t, Token::Question));

            let description = match self.peek() {
                Some(Token::String(text)) => {
                    let text = text.clone();
                    self.index += 1;
                    Some(text)
                }
                _ => None,
            };

            let default = if self.match_token(|t| matches!(t, Token::Assign)) {
                Some(self.parse_literal_default()?)
            } else {
                None
            };

            fields.push(SchemaFieldDef {
                name: field,
                type_name,
                optional,
                description,
                default,
            });
        }

        Ok(SchemaDef { name, fields })
    }

    fn parse_literal_default(&mut self) -> Result<Value, ScriptError> {
        match self.parse_unary()? {
            Expr::Literal(value) => Ok(value),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => match *expr {
                Expr::Literal(Value::Number(number)) => number
                    .as_f64()
                    .and_then(|value| literal_number(-value))
                    .ok_or_else(|| self.error("invalid negative default")),
                _ => Err(self.error("schema default must be a literal")),
            },
            _ => Err(self.error("schema default must be a literal")),
        }
    }

    fn parse_if(&mut self) -> Result<StmtKind, ScriptError> {
        let mut branches = Vec::new();
        let mut otherwise = None;

        loop {
            let condition = self.parse_expression()?;
            branches.push(IfBranch {
                condition,
                body: self.parse_block()?,
            });

            if !self.match_token(|t| matches!(t, Token::Else)) {
                break;
            }
            if self.match_token(|t| matches!(t, Token::If)) {
                continue;
            }
            otherwise = Some(self.parse_block()?);
            break;
        }

        Ok(StmtKind::If {
            branches,
            otherwise,
        })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.nested(Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.consume(|t| matches!(t, Token::LBrace), "expected '{' to open block")?;
        let mut statements = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("expected '}' to close block")),
                Some(Token::RBrace) => {
                    self.index += 1;
                    break;
                }
                Some(Token::Semicolon) => self.index += 1,
                Some(_) => statements.push(self.parse_statement()?),
            }
        }
        Ok(statements)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, ScriptError> {
        self.nested(Self::parse_or)
    }

    fn nested<T>(
        &mut self,
        parse: fn(&mut Self) -> Result<T, ScriptError>,
    ) -> Result<T, ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        while self.match_token(|t| matches!(t, Token::OrOr)) {
            let right = self.parse_and()?;
            left = binary(left, BinaryOp::Or, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_comparison()?;
        while self.match_token(|t| matches!(t, Token::AndAnd)) {
            let right = self.parse_comparison()?;
            left = binary(left, BinaryOp::And, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_additive()?;
        while let Some(op) = self.match_comparison_op() {
            let right = self.parse_additive()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.match_token(|t| matches!(t, Token::Plus)) {
                BinaryOp::Add
            } else if self.match_token(|t| matches!(t, Token::Minus)) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.match_token(|t| matches!(t, Token::Star)) {
                BinaryOp::Mul
            } else if self.match_token(|t| matches!(t, Token::Slash)) {
                BinaryOp::Div
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.match_token(|t| matches!(t, Token::Not)) {
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.nested(Self::parse_unary)?),
            });
        }
        if self.match_token(|t| matches!(t, Token::Minus)) {
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.nested(Self::parse_unary)?),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.match_token(|t| matches!(t, Token::Dot)) {
                let segment = self.expect_identifier("expected identifier after '.'")?;
                if self.match_token(|t| matches!(t, Token::LParen)) {
                    expr = Expr::MethodCall {
                        target: Box::new(expr),
                        method: segment,
                        args: self.parse_arguments()?,
                    };
                } else {
                    expr = Expr::Access {
                        target: Box::new(expr),
                        segment,
                    };
                }
                continue;
            }

            if self.match_token(|t| matches!(t, Token::LBracket)) {
                let index = self.parse_expression()?;
                self.consume(|t| matches!(t, Token::RBracket), "expected ']' after index")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
                continue;
            }

            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };

        self.index += 1;
        match token {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Number(value) => literal_number(value)
                .map(Expr::Literal)
                .ok_or_else(|| self.error(format!("invalid finite number literal '{value}'"))),
            Token::String(value) => Ok(Expr::Literal(Value::String(value))),
            Token::Identifier(name) => {
                if self.match_token(|t| matches!(t, Token::LParen)) {
                    Ok(Expr::Call {
                        callee: name,
                        args: self.parse_arguments()?,
                    })
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Token::LParen => {
                let expr = self.parse_expression()?;
                self.consume(|t| matches!(t, Token::RParen), "expected ')' after expression")?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                loop {
                    if self.match_token(|t| matches!(t, Token::RBracket)) {
                        break;
                    }
                    items.push(self.parse_expression()?);
                    if self.match_token(|t| matches!(t, Token::RBracket)) {
                        break;
                    }
                    self.consume(|t| matches!(t, Token::Comma), "expected ',' between array items")?;
                }
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                loop {
                    if self.match_token(|t| matches!(t, Token::RBrace)) {
                        break;
                    }
                    let key = match self.peek().cloned() {
                        Some(Token::Identifier(key)) | Some(Token::String(key)) => {
                            self.index += 1;
                            key
                        }
                        _ => return Err(self.error("expected object key")),
                    };
                    self.consume(|t| matches!(t, Token::Colon), "expected ':' after object key")?;
                    entries.push((key, self.parse_expression()?));
                    if self.match_token(|t| matches!(t, Token::RBrace)) {
                        break;
                    }
                    self.consume(|t| matches!(t, Token::Comma), "expected ',' between object entries")?;
                }
                Ok(Expr::Object(entries))
            }
            other => {
                self.index -= 1;
                Err(self.error(format!("unexpected token {other:?}")))
            }
        }
    }

    /// Arguments after the opening paren, through the closing one. Keyword
    /// arguments must follow positional ones.
    fn parse_arguments(&mut self) -> Result<Vec<Arg>, ScriptError> {
        let mut args: Vec<Arg> = Vec::new();
        loop {
            if self.match_token(|t| matches!(t, Token::RParen)) {
                break;
            }

            let keyword = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Identifier(name)), Some(Token::Assign)) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = &keyword {
                if args.iter().any(|arg| arg.name.as_ref() == Some(name)) {
                    return Err(self.error(format!("duplicate keyword argument '{name}'")));
                }
                self.index += 2;
            } else if args.iter().any(|arg| arg.name.is_some()) {
                return Err(self.error("positional argument follows keyword argument"));
            }

            args.push(Arg {
                name: keyword,
                value: self.parse_expression()?,
            });

            if self.match_token(|t| matches!(t, Token::RParen)) {
                break;
            }
            self.consume(|t| matches!(t, Token::Comma), "expected ',' between arguments")?;
        }
        Ok(args)
    }

    fn match_comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek()? {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Neq,
            Token::Gt => BinaryOp::Gt,
            Token::Gte => BinaryOp::Gte,
            Token::Lt => BinaryOp::Lt,
            Token::Lte => BinaryOp::Lte,
            Token::Contains => BinaryOp::Contains,
            Token::Matches => BinaryOp::Matches,
            _ => return None,
        };
        self.index += 1;
        Some(op)
    }

    fn expect_identifier(&mut self, msg: &str) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Identifier(name)) => {
                let name = name.clone();
                self.index += 1;
                Ok(name)
            }
            _ => Err(self.error(msg)),
        }
    }

    fn consume<F>(&mut self, predicate: F, msg: &str) -> Result<(), ScriptError>
    where
        F: FnOnce(&Token) -> bool,
    {
        if self.match_token(predicate) {
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn match_token<F>(&mut self, predicate: F) -> bool
    where
        F: FnOnce(&Token) -> bool,
    {
        if let Some(token) = self.peek() {
            if predicate(token) {
                self.index += 1;
                return true;
            }
        }
        false
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.index + offset).map(|spanned| &spanned.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|spanned| spanned.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::parse(self.line(), message)
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

/// Whole numbers become JSON integers so ids and counts print without `.0`.
pub(crate) fn literal_number(value: f64) -> Option<Value> {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        return Some(Value::from(value as i64));
    }
    Number::from_f64(value).map(Value::Number)
}
