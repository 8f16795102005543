//! Precedence-climbing expression parser
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons, `+ -`,
//! `* / %`, unary minus, `^` (right-associative).

use super::lexer::Token;
use super::{EvalError, MAX_DEPTH};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Expr {
    Lit(Value),
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

pub(super) fn parse(tokens: Vec<Token>) -> Result<Expr, EvalError> {
    let mut p = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    if p.tokens.is_empty() {
        return Err(EvalError::Syntax("empty expression".into()));
    }
    let expr = p.parse_or()?;
    match p.peek() {
        None => Ok(expr),
        Some(Token::Dot) => Err(EvalError::Forbidden("property access".into())),
        Some(tok) => Err(EvalError::Syntax(format!("unexpected {:?}", tok))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Nesting of the node being built; bounds parser and evaluator recursion
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<(), EvalError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(EvalError::Syntax(format!(
                "expected {:?}, found {:?}",
                tok,
                self.peek()
            )))
        }
    }

    fn descend(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::Syntax("expression nested too deeply".into()));
        }
        Ok(())
    }

    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<Expr, EvalError>,
    ) -> Result<Expr, EvalError> {
        self.descend()?;
        let expr = parse(self)?;
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let base = self.depth;
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            self.descend()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let base = self.depth;
        let mut lhs = self.parse_not()?;
        while self.eat(&Token::And) {
            self.descend()?;
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Not) {
            let operand = self.nested(Self::parse_not)?;
            return Ok(Expr::Unary(UnOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let base = self.depth;
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let base = self.depth;
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let base = self.depth;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Minus) {
            let operand = self.nested(Self::parse_unary)?;
            return Ok(Expr::Unary(UnOp::Neg, Box::new(operand)));
        }
        if self.eat(&Token::Plus) {
            return self.nested(Self::parse_unary);
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, EvalError> {
        let base = self.parse_primary()?;
        if self.eat(&Token::Caret) {
            // right-associative, and binds tighter than a leading minus
            let exponent = self.nested(Self::parse_unary)?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Lit(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.nested(Self::parse_or)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(Expr::Call(name, args));
                }
                if self.peek() == Some(&Token::Dot) {
                    return Err(EvalError::Forbidden(format!("property access on {}", name)));
                }
                Ok(match name.as_str() {
                    "PI" => Expr::Lit(Value::Num(std::f64::consts::PI)),
                    "E" => Expr::Lit(Value::Num(std::f64::consts::E)),
                    n if n.eq_ignore_ascii_case("true") => Expr::Lit(Value::Bool(true)),
                    n if n.eq_ignore_ascii_case("false") => Expr::Lit(Value::Bool(false)),
                    _ => Expr::Var(name),
                })
            }
            Some(tok) => Err(EvalError::Syntax(format!("unexpected {:?}", tok))),
            None => Err(EvalError::Syntax("unexpected end of expression".into())),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.nested(Self::parse_or)?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn ast(src: &str) -> Expr {
        parse(tokenize(src).unwrap()).unwrap()
    }

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Lit(Value::Num(n)))
    }

    #[test]
    fn test_multiplication_binds_tighter() {
        assert_eq!(
            ast("2 + 3 * 4"),
            Expr::Binary(BinOp::Add, num(2.0), Box::new(Expr::Binary(BinOp::Mul, num(3.0), num(4.0))))
        );
    }

    #[test]
    fn test_power_is_right_associative() {
        assert_eq!(
            ast("2 ^ 3 ^ 2"),
            Expr::Binary(BinOp::Pow, num(2.0), Box::new(Expr::Binary(BinOp::Pow, num(3.0), num(2.0))))
        );
    }

    #[test]
    fn test_negation_applies_after_power() {
        assert_eq!(
            ast("-2 ^ 2"),
            Expr::Unary(UnOp::Neg, Box::new(Expr::Binary(BinOp::Pow, num(2.0), num(2.0))))
        );
    }

    #[test]
    fn test_call_with_args() {
        assert_eq!(
            ast("max(1, x)"),
            Expr::Call("max".into(), vec![Expr::Lit(Value::Num(1.0)), Expr::Var("x".into())])
        );
    }

    #[test]
    fn test_property_access_is_forbidden() {
        let err = parse(tokenize("document.cookie").unwrap()).unwrap_err();
        assert!(matches!(err, EvalError::Forbidden(_)));
    }

    #[test]
    fn test_nesting_limit() {
        let too_deep = |src: String| {
            let err = parse(tokenize(&src).unwrap()).unwrap_err();
            assert!(err.to_string().contains("nested too deeply"), "{}", err);
        };
        too_deep(format!("{}1", "-".repeat(9000)));
        too_deep(format!("{}1", "not ".repeat(2000)));
        too_deep(format!("2{}", "^2".repeat(4000)));
        too_deep(format!("1{}", "+1".repeat(4000)));
        too_deep(format!("{}1{}", "(".repeat(200), ")".repeat(200)));

        assert!(parse(tokenize(&format!("{}1", "-".repeat(MAX_DEPTH / 2))).unwrap()).is_ok());
        assert!(parse(tokenize(&format!("1{}", "+1".repeat(MAX_DEPTH / 2))).unwrap()).is_ok());
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(parse(tokenize("1 2").unwrap()).is_err());
        assert!(parse(tokenize("(1").unwrap()).is_err());
        assert!(parse(Vec::new()).is_err());
    }
}
