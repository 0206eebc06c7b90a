//! Recursive-descent parser producing the expression AST.
//!
//! Precedence, loosest to tightest: `||`, `&&`, relations
//! (`== != < <= > >= in`), additive, multiplicative, unary, postfix
//! (member access, index, call). All binary operators associate left.
//!
//! The AST survives compilation: the planner re-walks it to build residual
//! expressions, and `Display` renders residuals back into source form.

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::value::Value;

use crate::lexer::{tokenize, Spanned, Token};

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Value),
    Ident(String),
    /// `object.field`
    Member(Box<Expr>, String),
    /// `object[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `[a, b, c]`
    List(Vec<Expr>),
    /// `{"k": v}` — keys are static strings.
    Map(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Global function call: `size(x)`, `has(R.attr.x)`, `now()`.
    Call(String, Vec<Expr>),
    /// Receiver method call: `s.startsWith("x")`.
    Method(Box<Expr>, String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::In => "in",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::In => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
        }
    }
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> ArbiterResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0, len: source.len() };
    let expr = parser.or_expr()?;
    if let Some(trailing) = parser.peek() {
        return Err(parser.error(format!("unexpected trailing input near {:?}", trailing.token)));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.len, |s| s.offset)
    }

    fn error(&self, message: impl Into<String>) -> ArbiterError {
        ArbiterError::ExprParse {
            message: message.into(),
            offset: self.offset(),
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> ArbiterResult<()> {
        match self.advance() {
            Some(s) if &s.token == expected => Ok(()),
            Some(s) => Err(ArbiterError::ExprParse {
                message: format!("expected {what}, found {:?}", s.token),
                offset: s.offset,
            }),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().map(|s| &s.token) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> ArbiterResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ArbiterResult<Expr> {
        let mut left = self.rel_expr()?;
        while self.eat(&Token::AndAnd) {
            let right = self.rel_expr()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn rel_expr(&mut self) -> ArbiterResult<Expr> {
        let mut left = self.add_expr()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::In) => BinOp::In,
                _ => break,
            };
            self.pos += 1;
            let right = self.add_expr()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn add_expr(&mut self) -> ArbiterResult<Expr> {
        let mut left = self.mul_expr()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.mul_expr()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn mul_expr(&mut self) -> ArbiterResult<Expr> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek().map(|s| &s.token) {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary_expr()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> ArbiterResult<Expr> {
        if self.eat(&Token::Bang) {
            let inner = self.unary_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat(&Token::Minus) {
            let inner = self.unary_expr()?;
            // Fold negation into numeric literals so `-1` is a literal, not
            // an operation; the planner relies on literals staying literals.
            return Ok(match inner {
                Expr::Lit(Value::Int(i)) => Expr::Lit(Value::Int(-i)),
                Expr::Lit(Value::Double(d)) => Expr::Lit(Value::Double(-d)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> ArbiterResult<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Some(Spanned { token: Token::Ident(name), .. }) => name,
                    Some(s) => {
                        return Err(ArbiterError::ExprParse {
                            message: format!("expected member name, found {:?}", s.token),
                            offset: s.offset,
                        });
                    }
                    None => return Err(self.error("expected member name, found end of input")),
                };
                if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    expr = Expr::Method(Box::new(expr), name, args);
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.or_expr()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary_expr(&mut self) -> ArbiterResult<Expr> {
        let spanned = self
            .advance()
            .ok_or_else(|| self.error("expected expression, found end of input"))?;
        match spanned.token {
            Token::Int(i) => Ok(Expr::Lit(Value::Int(i))),
            Token::Double(d) => Ok(Expr::Lit(Value::Double(d))),
            Token::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Token::True => Ok(Expr::Lit(Value::Bool(true))),
            Token::False => Ok(Expr::Lit(Value::Bool(false))),
            Token::Null => Ok(Expr::Lit(Value::Null)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                let inner = self.or_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or_expr()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket, "']'")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Spanned { token: Token::Str(s), .. }) => s,
                            Some(Spanned { token: Token::Ident(s), .. }) => s,
                            Some(s) => {
                                return Err(ArbiterError::ExprParse {
                                    message: format!("expected map key, found {:?}", s.token),
                                    offset: s.offset,
                                });
                            }
                            None => {
                                return Err(self.error("expected map key, found end of input"));
                            }
                        };
                        self.expect(&Token::Colon, "':'")?;
                        entries.push((key, self.or_expr()?));
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBrace, "'}'")?;
                        break;
                    }
                }
                Ok(Expr::Map(entries))
            }
            other => Err(ArbiterError::ExprParse {
                message: format!("expected expression, found {other:?}"),
                offset: spanned.offset,
            }),
        }
    }

    fn call_args(&mut self) -> ArbiterResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen, "')'")?;
            break;
        }
        Ok(args)
    }
}

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary(op, ..) => op.precedence(),
            Expr::Unary(..) => 6,
            _ => 7,
        }
    }

    fn fmt_child(&self, child: &Expr, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if child.precedence() < self.precedence() {
            write!(f, "({child})")
        } else {
            write!(f, "{child}")
        }
    }
}

impl std::fmt::Display for Expr {
    /// Render back into source form, used for residual plan expressions.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Lit(Value::String(s)) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Expr::Lit(v) => match v.to_json() {
                serde_json::Value::String(s) => write!(f, "\"{s}\""),
                other => write!(f, "{other}"),
            },
            Expr::Ident(name) => write!(f, "{name}"),
            Expr::Member(obj, field) => {
                self.fmt_child(obj, f)?;
                write!(f, ".{field}")
            }
            Expr::Index(obj, index) => {
                self.fmt_child(obj, f)?;
                write!(f, "[{index}]")
            }
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Expr::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{key}\": {value}")?;
                }
                write!(f, "}}")
            }
            Expr::Unary(UnaryOp::Not, inner) => {
                write!(f, "!")?;
                self.fmt_child(inner, f)
            }
            Expr::Unary(UnaryOp::Neg, inner) => {
                write!(f, "-")?;
                self.fmt_child(inner, f)
            }
            Expr::Binary(op, left, right) => {
                self.fmt_child(left, f)?;
                write!(f, " {} ", op.symbol())?;
                self.fmt_child(right, f)
            }
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Method(receiver, name, args) => {
                self.fmt_child(receiver, f)?;
                write!(f, ".{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_member_chains() {
        let expr = parse("request.resource.attr.status").unwrap();
        assert_eq!(
            expr,
            Expr::Member(
                Box::new(Expr::Member(
                    Box::new(Expr::Member(
                        Box::new(Expr::Ident("request".to_string())),
                        "resource".to_string()
                    )),
                    "attr".to_string()
                )),
                "status".to_string()
            )
        );
    }

    #[test]
    fn precedence_binds_and_over_or() {
        let expr = parse("a || b && c").unwrap();
        match expr {
            Expr::Binary(BinOp::Or, left, right) => {
                assert_eq!(*left, Expr::Ident("a".to_string()));
                assert!(matches!(*right, Expr::Binary(BinOp::And, ..)));
            }
            other => panic!("expected Or at the top, got {other:?}"),
        }
    }

    #[test]
    fn parses_method_calls_and_in() {
        let expr = parse("P.attr.geography in R.attr.managed && name.startsWith(\"mr\")").unwrap();
        assert!(matches!(expr, Expr::Binary(BinOp::And, ..)));
    }

    #[test]
    fn negative_literals_fold() {
        assert_eq!(parse("-3").unwrap(), Expr::Lit(Value::Int(-3)));
        assert_eq!(parse("-2.5").unwrap(), Expr::Lit(Value::Double(-2.5)));
    }

    #[test]
    fn list_and_map_literals() {
        let expr = parse("x in [\"a\", \"b\"]").unwrap();
        assert!(matches!(expr, Expr::Binary(BinOp::In, ..)));

        let expr = parse("{\"k\": 1, other: 2}").unwrap();
        match expr {
            Expr::Map(entries) => {
                assert_eq!(entries[0].0, "k");
                assert_eq!(entries[1].0, "other");
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn trailing_input_is_rejected() {
        assert!(parse("a == b c").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let sources = [
            "request.resource.attr.status == \"DRAFT\"",
            "a && (b || c)",
            "size(R.attr.tags) > 2",
            "name.startsWith(\"mr\") && !(x in [1, 2, 3])",
        ];
        for source in sources {
            let expr = parse(source).unwrap();
            let rendered = expr.to_string();
            let reparsed = parse(&rendered).unwrap();
            assert_eq!(expr, reparsed, "render of '{source}' was '{rendered}'");
        }
    }
}
