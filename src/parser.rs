/// Recursive-descent parser for Cool
///
/// Operator precedence, loosest first:
///   <-   (right associative)
///   not
///   <  <=  =   (non-associative)
///   +  -
///   *  /
///   isvoid
///   ~
///   @  .   (dispatch postfix)
/// A multi-binding `let x : T, y : U in e` desugars into nested lets.

use crate::ast::{
    BinaryOp, CaseBranch, Class, DispatchKind, Expr, ExprKind, Feature, FeatureKind, Formal,
    Program, TypeId, TypeTable, UnaryOp,
};
use crate::errors::{Line, ParserError};
use crate::lexer::{Spanned, Token};

pub struct Parser<'t> {
    tokens: Vec<Spanned>,
    pos: usize,
    file: String,
    types: &'t mut TypeTable,
}

type ParseResult<T> = Result<T, ParserError>;

impl<'t> Parser<'t> {
    pub fn new(tokens: Vec<Spanned>, file: &str, types: &'t mut TypeTable) -> Self {
        Parser { tokens, pos: 0, file: file.to_string(), types }
    }

    // -----------------------------------------------------------------------
    // Token cursor
    // -----------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn line(&self) -> Line {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self) -> ParseResult<T> {
        Err(ParserError { found: self.current().describe(), line: self.line() })
    }

    fn expect(&mut self, token: Token) -> ParseResult<()> {
        if *self.current() == token {
            self.advance();
            Ok(())
        } else {
            self.error()
        }
    }

    fn expect_type(&mut self) -> ParseResult<TypeId> {
        match self.current().clone() {
            Token::TypeId(name) => {
                self.advance();
                Ok(self.types.intern(&name))
            }
            _ => self.error(),
        }
    }

    fn expect_object(&mut self) -> ParseResult<String> {
        match self.current().clone() {
            Token::ObjectId(name) => {
                self.advance();
                Ok(name)
            }
            _ => self.error(),
        }
    }

    // -----------------------------------------------------------------------
    // Program / classes / features
    // -----------------------------------------------------------------------

    pub fn parse(&mut self) -> ParseResult<Program> {
        let line = self.line();
        let mut classes = Vec::new();

        while *self.current() != Token::Eof {
            classes.push(self.parse_class()?);
            self.expect(Token::Semicolon)?;
        }
        if classes.is_empty() {
            // an empty translation unit is still a syntax error in Cool
            return self.error();
        }

        Ok(Program { classes, line })
    }

    fn parse_class(&mut self) -> ParseResult<Class> {
        let line = self.line();
        self.expect(Token::Class)?;
        let name = self.expect_type()?;

        let parent = if *self.current() == Token::Inherits {
            self.advance();
            self.expect_type()?
        } else {
            crate::ast::OBJECT
        };

        self.expect(Token::LBrace)?;
        let mut features = Vec::new();
        while *self.current() != Token::RBrace {
            features.push(self.parse_feature()?);
            self.expect(Token::Semicolon)?;
        }
        self.expect(Token::RBrace)?;

        Ok(Class {
            name,
            parent,
            file: self.file.clone(),
            line,
            features,
            expression_stack: 0,
        })
    }

    fn parse_feature(&mut self) -> ParseResult<Feature> {
        let line = self.line();
        let name = self.expect_object()?;

        if *self.current() == Token::LParen {
            // method
            self.advance();
            let mut formals = Vec::new();
            if *self.current() != Token::RParen {
                loop {
                    let formal_line = self.line();
                    let formal_name = self.expect_object()?;
                    self.expect(Token::Colon)?;
                    let formal_ty = self.expect_type()?;
                    formals.push(Formal { name: formal_name, ty: formal_ty, line: formal_line });
                    if *self.current() == Token::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
            self.expect(Token::RParen)?;
            self.expect(Token::Colon)?;
            let ret = self.expect_type()?;
            self.expect(Token::LBrace)?;
            let body = self.parse_expr()?;
            self.expect(Token::RBrace)?;

            Ok(Feature {
                name,
                ty: ret,
                line,
                kind: FeatureKind::Method { formals, body: Some(body), expression_stack: 0 },
            })
        } else {
            // attribute
            self.expect(Token::Colon)?;
            let ty = self.expect_type()?;
            let init = if *self.current() == Token::Assign {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };

            Ok(Feature { name, ty, line, kind: FeatureKind::Attribute { init } })
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> ParseResult<Expr> {
        if let Token::ObjectId(name) = self.current().clone() {
            if self.tokens.get(self.pos + 1).map(|s| &s.token) == Some(&Token::Assign) {
                let line = self.line();
                self.advance(); // identifier
                self.advance(); // <-
                let rhs = self.parse_assign()?;
                return Ok(Expr::new(
                    ExprKind::Assign { name, expr: Box::new(rhs) },
                    line,
                ));
            }
        }
        self.parse_not()
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if *self.current() == Token::Not {
            let line = self.line();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary { op: UnaryOp::Not, expr: Box::new(operand) },
                line,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.current() {
            Token::Less => BinaryOp::Lt,
            Token::LessEqual => BinaryOp::Le,
            Token::Equal => BinaryOp::Eq,
            _ => return Ok(lhs),
        };
        let line = self.line();
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::new(
            ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            line,
        ))
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::new(
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                line,
            );
        }
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.parse_isvoid()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_isvoid()?;
            lhs = Expr::new(
                ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                line,
            );
        }
    }

    fn parse_isvoid(&mut self) -> ParseResult<Expr> {
        if *self.current() == Token::IsVoid {
            let line = self.line();
            self.advance();
            let operand = self.parse_isvoid()?;
            return Ok(Expr::new(
                ExprKind::Unary { op: UnaryOp::IsVoid, expr: Box::new(operand) },
                line,
            ));
        }
        self.parse_neg()
    }

    fn parse_neg(&mut self) -> ParseResult<Expr> {
        if *self.current() == Token::Tilde {
            let line = self.line();
            self.advance();
            let operand = self.parse_neg()?;
            return Ok(Expr::new(
                ExprKind::Unary { op: UnaryOp::Neg, expr: Box::new(operand) },
                line,
            ));
        }
        self.parse_dispatch()
    }

    fn parse_dispatch(&mut self) -> ParseResult<Expr> {
        let mut receiver = self.parse_primary()?;

        loop {
            let kind = match self.current() {
                Token::At => {
                    self.advance();
                    let ty = self.expect_type()?;
                    self.expect(Token::Dot)?;
                    DispatchKind::Static(ty)
                }
                Token::Dot => {
                    self.advance();
                    DispatchKind::Virtual
                }
                _ => return Ok(receiver),
            };

            let line = self.line();
            let method = self.expect_object()?;
            let args = self.parse_args()?;
            receiver = Expr::new(
                ExprKind::Dispatch { receiver: Box::new(receiver), method, args, kind },
                line,
            );
        }
    }

    fn parse_args(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if *self.current() != Token::RParen {
            loop {
                args.push(self.parse_expr()?);
                if *self.current() == Token::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.current().clone() {
            Token::IntLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::IntLit(value), line))
            }
            Token::StrLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::StrLit(value), line))
            }
            Token::BoolLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(value), line))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::If => {
                self.advance();
                let predicate = self.parse_expr()?;
                self.expect(Token::Then)?;
                let then_expr = self.parse_expr()?;
                self.expect(Token::Else)?;
                let else_expr = self.parse_expr()?;
                self.expect(Token::Fi)?;
                Ok(Expr::new(
                    ExprKind::If {
                        predicate: Box::new(predicate),
                        then_expr: Box::new(then_expr),
                        else_expr: Box::new(else_expr),
                    },
                    line,
                ))
            }
            Token::While => {
                self.advance();
                let predicate = self.parse_expr()?;
                self.expect(Token::Loop)?;
                let body = self.parse_expr()?;
                self.expect(Token::Pool)?;
                Ok(Expr::new(
                    ExprKind::While { predicate: Box::new(predicate), body: Box::new(body) },
                    line,
                ))
            }
            Token::LBrace => {
                self.advance();
                let mut exprs = Vec::new();
                loop {
                    exprs.push(self.parse_expr()?);
                    self.expect(Token::Semicolon)?;
                    if *self.current() == Token::RBrace {
                        break;
                    }
                }
                self.advance();
                Ok(Expr::new(ExprKind::Block(exprs), line))
            }
            Token::Let => {
                self.advance();
                self.parse_let_bindings()
            }
            Token::Case => {
                self.advance();
                let scrutinee = self.parse_expr()?;
                self.expect(Token::Of)?;
                let mut branches = Vec::new();
                loop {
                    let branch_line = self.line();
                    let name = self.expect_object()?;
                    self.expect(Token::Colon)?;
                    let ty = self.expect_type()?;
                    self.expect(Token::Darrow)?;
                    let body = self.parse_expr()?;
                    self.expect(Token::Semicolon)?;
                    branches.push(CaseBranch { name, ty, body, line: branch_line });
                    if *self.current() == Token::Esac {
                        break;
                    }
                }
                self.advance();
                Ok(Expr::new(
                    ExprKind::Case { scrutinee: Box::new(scrutinee), branches },
                    line,
                ))
            }
            Token::New => {
                self.advance();
                let ty = self.expect_type()?;
                Ok(Expr::new(ExprKind::New(ty), line))
            }
            Token::ObjectId(name) => {
                self.advance();
                if *self.current() == Token::LParen {
                    // self dispatch: m(args) is shorthand for self.m(args)
                    let args = self.parse_args()?;
                    let receiver = Expr::new(ExprKind::Object("self".to_string()), line);
                    Ok(Expr::new(
                        ExprKind::Dispatch {
                            receiver: Box::new(receiver),
                            method: name,
                            args,
                            kind: DispatchKind::Virtual,
                        },
                        line,
                    ))
                } else {
                    Ok(Expr::new(ExprKind::Object(name), line))
                }
            }
            _ => self.error(),
        }
    }

    /// `let x : T <- e, y : U in body` parses into nested single-binding
    /// lets, innermost holding the body.
    fn parse_let_bindings(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let name = self.expect_object()?;
        self.expect(Token::Colon)?;
        let ty = self.expect_type()?;
        let init = if *self.current() == Token::Assign {
            self.advance();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        let body = if *self.current() == Token::Comma {
            self.advance();
            self.parse_let_bindings()?
        } else {
            self.expect(Token::In)?;
            self.parse_expr()?
        };

        Ok(Expr::new(
            ExprKind::Let { name, ty, init, body: Box::new(body) },
            line,
        ))
    }
}
