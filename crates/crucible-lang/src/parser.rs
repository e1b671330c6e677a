//! Recursive-descent parser.

use crate::ast::{AssignTarget, BinOp, Expr, Stmt, TableItem, UnOp};
use crate::error::CompileError;
use crate::lexer::{self, Token, TokenKind};

/// Guard against pathological nesting blowing the native stack.
const MAX_DEPTH: usize = 200;

pub fn parse(source: &str) -> Result<Vec<Stmt>, CompileError> {
    let tokens = lexer::tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let block = parser.block(&[])?;
    if let Some(tok) = parser.peek() {
        return Err(CompileError::parse(
            tok.line,
            format!("unexpected token {:?}", tok.text),
        ));
    }
    Ok(block)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn line(&self) -> u32 {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, CompileError> {
        match self.peek() {
            Some(tok) if tok.kind == kind => Ok(self.advance().unwrap()),
            Some(tok) => Err(CompileError::parse(
                tok.line,
                format!("expected {what}, found {:?}", tok.text),
            )),
            None => Err(CompileError::parse(
                self.line(),
                format!("expected {what}, found end of input"),
            )),
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<(String, u32), CompileError> {
        let tok = self.expect(TokenKind::Ident, what)?;
        Ok((tok.text, tok.line))
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::parse(self.line(), "expression too deeply nested"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Parses statements until one of `terminators` (not consumed) or EOF.
    fn block(&mut self, terminators: &[TokenKind]) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        loop {
            while self.check(TokenKind::Semicolon) {}
            match self.peek_kind() {
                None => break,
                Some(kind) if terminators.contains(&kind) => break,
                _ => stmts.push(self.statement()?),
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        match self.peek_kind() {
            Some(TokenKind::Local) => self.local_statement(),
            Some(TokenKind::If) => self.if_statement(),
            Some(TokenKind::While) => self.while_statement(),
            Some(TokenKind::For) => self.for_statement(),
            Some(TokenKind::Function) => self.function_statement(),
            Some(TokenKind::Return) => self.return_statement(),
            Some(TokenKind::Break) => {
                self.advance();
                Ok(Stmt::Break { line })
            }
            Some(TokenKind::Do) => {
                // A bare do-block shares the enclosing scope handling of `if`.
                self.advance();
                let body = self.block(&[TokenKind::End])?;
                self.expect(TokenKind::End, "`end`")?;
                Ok(Stmt::If {
                    arms: vec![(Expr::True { line }, body)],
                    else_body: None,
                    line,
                })
            }
            _ => self.expr_or_assign(),
        }
    }

    fn local_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // local
        if self.check(TokenKind::Function) {
            let (name, _) = self.expect_name("function name")?;
            let (params, body, last_line) = self.function_rest(false)?;
            return Ok(Stmt::LocalFunction {
                name,
                params,
                body,
                line,
                last_line,
            });
        }
        let (name, _) = self.expect_name("variable name")?;
        let init = if self.check(TokenKind::Assign) {
            Some(self.expression()?)
        } else {
            None
        };
        Ok(Stmt::Local { name, init, line })
    }

    fn if_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // if
        let mut arms = Vec::new();
        let cond = self.expression()?;
        self.expect(TokenKind::Then, "`then`")?;
        let body = self.block(&[TokenKind::Elseif, TokenKind::Else, TokenKind::End])?;
        arms.push((cond, body));
        loop {
            if self.check(TokenKind::Elseif) {
                let cond = self.expression()?;
                self.expect(TokenKind::Then, "`then`")?;
                let body = self.block(&[TokenKind::Elseif, TokenKind::Else, TokenKind::End])?;
                arms.push((cond, body));
            } else if self.check(TokenKind::Else) {
                let body = self.block(&[TokenKind::End])?;
                self.expect(TokenKind::End, "`end`")?;
                return Ok(Stmt::If {
                    arms,
                    else_body: Some(body),
                    line,
                });
            } else {
                self.expect(TokenKind::End, "`end`")?;
                return Ok(Stmt::If {
                    arms,
                    else_body: None,
                    line,
                });
            }
        }
    }

    fn while_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // while
        let cond = self.expression()?;
        self.expect(TokenKind::Do, "`do`")?;
        let body = self.block(&[TokenKind::End])?;
        self.expect(TokenKind::End, "`end`")?;
        Ok(Stmt::While { cond, body, line })
    }

    fn for_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // for
        let (var, _) = self.expect_name("loop variable")?;
        self.expect(TokenKind::Assign, "`=`")?;
        let start = self.expression()?;
        self.expect(TokenKind::Comma, "`,`")?;
        let limit = self.expression()?;
        let step = if self.check(TokenKind::Comma) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(TokenKind::Do, "`do`")?;
        let body = self.block(&[TokenKind::End])?;
        self.expect(TokenKind::End, "`end`")?;
        Ok(Stmt::NumericFor {
            var,
            start,
            limit,
            step,
            body,
            line,
        })
    }

    fn function_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // function
        let (first, name_line) = self.expect_name("function name")?;
        let mut target = AssignTarget::Name(first);
        let mut is_method = false;
        loop {
            if self.check(TokenKind::Dot) {
                let (field, field_line) = self.expect_name("field name")?;
                target = AssignTarget::Index {
                    obj: target_to_expr(target, name_line),
                    index: Expr::Str {
                        value: field,
                        line: field_line,
                    },
                };
            } else if self.check(TokenKind::Colon) {
                let (method, method_line) = self.expect_name("method name")?;
                target = AssignTarget::Index {
                    obj: target_to_expr(target, name_line),
                    index: Expr::Str {
                        value: method,
                        line: method_line,
                    },
                };
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let (params, body, last_line) = self.function_rest(is_method)?;
        Ok(Stmt::Function {
            target,
            params,
            body,
            line,
            last_line,
        })
    }

    /// Parses `(params) body end`, optionally prepending `self`.
    fn function_rest(
        &mut self,
        is_method: bool,
    ) -> Result<(Vec<String>, Vec<Stmt>, u32), CompileError> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        if self.peek_kind() != Some(TokenKind::RParen) {
            loop {
                let (name, _) = self.expect_name("parameter name")?;
                params.push(name);
                if !self.check(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        let body = self.block(&[TokenKind::End])?;
        let end = self.expect(TokenKind::End, "`end`")?;
        Ok((params, body, end.line))
    }

    fn return_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // return
        let mut exprs = Vec::new();
        let at_block_end = matches!(
            self.peek_kind(),
            None | Some(TokenKind::End)
                | Some(TokenKind::Else)
                | Some(TokenKind::Elseif)
                | Some(TokenKind::Semicolon)
        );
        if !at_block_end {
            exprs.push(self.expression()?);
            while self.check(TokenKind::Comma) {
                exprs.push(self.expression()?);
            }
        }
        Ok(Stmt::Return { exprs, line })
    }

    fn expr_or_assign(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        let expr = self.suffixed_expression()?;
        if self.check(TokenKind::Assign) {
            let target = match expr {
                Expr::Name { name, .. } => AssignTarget::Name(name),
                Expr::Index { obj, index, .. } => AssignTarget::Index {
                    obj: *obj,
                    index: *index,
                },
                other => {
                    return Err(CompileError::parse(
                        other.line(),
                        "cannot assign to this expression",
                    ));
                }
            };
            let value = self.expression()?;
            return Ok(Stmt::Assign {
                target,
                value,
                line,
            });
        }
        if !expr.is_call() {
            return Err(CompileError::parse(line, "expression is not a statement"));
        }
        Ok(Stmt::ExprStat { expr, line })
    }

    // Precedence: or < and < comparison < concat < additive < multiplicative
    // < unary < power < suffixes.
    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let result = self.or_expression();
        self.leave();
        result
    }

    fn or_expression(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.and_expression()?;
        while self.peek_kind() == Some(TokenKind::Or) {
            let line = self.line();
            self.advance();
            let rhs = self.and_expression()?;
            lhs = Expr::Or {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn and_expression(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.comparison()?;
        while self.peek_kind() == Some(TokenKind::And) {
            let line = self.line();
            self.advance();
            let rhs = self.comparison()?;
            lhs = Expr::And {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.concat_expression()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::NotEq) => BinOp::NotEq,
                Some(TokenKind::Less) => BinOp::Less,
                Some(TokenKind::LessEq) => BinOp::LessEq,
                Some(TokenKind::Greater) => BinOp::Greater,
                Some(TokenKind::GreaterEq) => BinOp::GreaterEq,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.concat_expression()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn concat_expression(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.additive()?;
        if self.peek_kind() == Some(TokenKind::Concat) {
            let line = self.line();
            self.advance();
            self.enter()?;
            // Right-associative.
            let rhs = self.concat_expression();
            self.leave();
            let rhs = rhs?;
            return Ok(Expr::Binary {
                op: BinOp::Concat,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            });
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => Some(UnOp::Neg),
            Some(TokenKind::Not) => Some(UnOp::Not),
            Some(TokenKind::Hash) => Some(UnOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.line();
            self.advance();
            self.enter()?;
            let operand = self.unary();
            self.leave();
            let operand = operand?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                line,
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.suffixed_expression()?;
        if self.peek_kind() == Some(TokenKind::Caret) {
            let line = self.line();
            self.advance();
            self.enter()?;
            // `^` is right-associative and binds tighter than unary on the left,
            // while its right operand may itself be unary: 2^-2 parses.
            let rhs = self.unary();
            self.leave();
            let rhs = rhs?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            });
        }
        Ok(lhs)
    }

    fn suffixed_expression(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let result = self.suffixed_inner();
        self.leave();
        result
    }

    fn suffixed_inner(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::Dot) => {
                    let line = self.line();
                    self.advance();
                    let (field, field_line) = self.expect_name("field name")?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        index: Box::new(Expr::Str {
                            value: field,
                            line: field_line,
                        }),
                        line,
                    };
                }
                Some(TokenKind::LBracket) => {
                    let line = self.line();
                    self.advance();
                    let index = self.expression()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                Some(TokenKind::LParen) => {
                    let line = self.line();
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        line,
                    };
                }
                Some(TokenKind::Colon) => {
                    let line = self.line();
                    self.advance();
                    let (name, _) = self.expect_name("method name")?;
                    let args = self.call_args()?;
                    expr = Expr::MethodCall {
                        recv: Box::new(expr),
                        name,
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut args = Vec::new();
        if self.peek_kind() != Some(TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.check(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let tok = match self.advance() {
            Some(tok) => tok,
            None => {
                return Err(CompileError::parse(
                    self.line(),
                    "unexpected end of input",
                ));
            }
        };
        let line = tok.line;
        match tok.kind {
            TokenKind::Nil => Ok(Expr::Nil { line }),
            TokenKind::True => Ok(Expr::True { line }),
            TokenKind::False => Ok(Expr::False { line }),
            TokenKind::Int => {
                let value = if let Some(hex) = tok.text.strip_prefix("0x") {
                    i64::from_str_radix(hex, 16)
                        .map_err(|_| CompileError::parse(line, "integer literal out of range"))?
                } else {
                    tok.text
                        .parse::<i64>()
                        .map_err(|_| CompileError::parse(line, "integer literal out of range"))?
                };
                Ok(Expr::Int { value, line })
            }
            TokenKind::Float => {
                let value = tok
                    .text
                    .parse::<f64>()
                    .map_err(|_| CompileError::parse(line, "malformed number literal"))?;
                Ok(Expr::Float { value, line })
            }
            TokenKind::Str => {
                let value = lexer::unescape_string(&tok.text, line)?;
                Ok(Expr::Str { value, line })
            }
            TokenKind::Ident => Ok(Expr::Name {
                name: tok.text,
                line,
            }),
            TokenKind::LParen => {
                let expr = self.expression()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::Function => {
                let (params, body, last_line) = self.function_rest(false)?;
                Ok(Expr::Function {
                    params,
                    body,
                    line,
                    last_line,
                })
            }
            TokenKind::LBrace => self.table_constructor(line),
            _ => Err(CompileError::parse(
                line,
                format!("unexpected token {:?}", tok.text),
            )),
        }
    }

    fn table_constructor(&mut self, line: u32) -> Result<Expr, CompileError> {
        let mut items = Vec::new();
        loop {
            if self.check(TokenKind::RBrace) {
                break;
            }
            match self.peek_kind() {
                Some(TokenKind::LBracket) => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    self.expect(TokenKind::Assign, "`=`")?;
                    let value = self.expression()?;
                    items.push(TableItem::Keyed(key, value));
                }
                Some(TokenKind::Ident)
                    if self.tokens.get(self.pos + 1).map(|t| t.kind)
                        == Some(TokenKind::Assign) =>
                {
                    let (name, _) = self.expect_name("field name")?;
                    self.advance(); // =
                    let value = self.expression()?;
                    items.push(TableItem::Named(name, value));
                }
                _ => {
                    items.push(TableItem::Positional(self.expression()?));
                }
            }
            if !(self.check(TokenKind::Comma) || self.check(TokenKind::Semicolon)) {
                self.expect(TokenKind::RBrace, "`}`")?;
                break;
            }
        }
        Ok(Expr::Table { items, line })
    }
}

fn target_to_expr(target: AssignTarget, line: u32) -> Expr {
    match target {
        AssignTarget::Name(name) => Expr::Name { name, line },
        AssignTarget::Index { obj, index } => Expr::Index {
            obj: Box::new(obj),
            index: Box::new(index),
            line,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_and_return() {
        let stmts = parse("local a = 1 + 2\nreturn a").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(&stmts[0], Stmt::Local { name, .. } if name == "a"));
        assert!(matches!(&stmts[1], Stmt::Return { exprs, .. } if exprs.len() == 1));
    }

    #[test]
    fn method_call_sugar() {
        let stmts = parse("this.returns(x:string())").unwrap();
        let Stmt::ExprStat { expr, .. } = &stmts[0] else {
            panic!("expected expression statement");
        };
        let Expr::Call { args, .. } = expr else {
            panic!("expected call");
        };
        assert!(matches!(&args[0], Expr::MethodCall { name, .. } if name == "string"));
    }

    #[test]
    fn power_binds_tighter_than_unary() {
        let stmts = parse("return -2 ^ 2").unwrap();
        let Stmt::Return { exprs, .. } = &stmts[0] else {
            panic!("expected return");
        };
        assert!(matches!(
            &exprs[0],
            Expr::Unary {
                op: UnOp::Neg,
                operand,
                ..
            } if matches!(**operand, Expr::Binary { op: BinOp::Pow, .. })
        ));
    }

    #[test]
    fn table_constructor_forms() {
        let stmts = parse(r#"local t = { 1, a = 2, ["b"] = 3 }"#).unwrap();
        let Stmt::Local {
            init: Some(Expr::Table { items, .. }),
            ..
        } = &stmts[0]
        else {
            panic!("expected table");
        };
        assert!(matches!(items[0], TableItem::Positional(_)));
        assert!(matches!(&items[1], TableItem::Named(name, _) if name == "a"));
        assert!(matches!(items[2], TableItem::Keyed(_, _)));
    }

    #[test]
    fn rejects_non_statement_expression() {
        assert!(parse("1 + 2").is_err());
    }

    #[test]
    fn reports_line_of_error() {
        let err = parse("local a = 1\nlocal = 2").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 2, .. }));
    }

    #[test]
    fn method_definition_gets_self() {
        let stmts = parse("function t:m(a) return a end").unwrap();
        let Stmt::Function { params, .. } = &stmts[0] else {
            panic!("expected function statement");
        };
        assert_eq!(params, &["self".to_string(), "a".to_string()]);
    }
}
