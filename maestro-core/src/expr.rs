//! ABOUTME: Sandboxed condition expression evaluator
//! ABOUTME: Tokenizer + recursive-descent parser over a closed grammar; no host eval

use serde_json::Value;
use tracing::warn;

use crate::error::{MaestroError, Result};
use crate::paths;

/// Values an expression can produce or compare
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Null,
    Undefined,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl ExprValue {
    fn truthy(&self) -> bool {
        match self {
            ExprValue::Null | ExprValue::Undefined => false,
            ExprValue::Bool(b) => *b,
            ExprValue::Num(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::Str(s) => !s.is_empty(),
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ExprValue::Null,
            Value::Bool(b) => ExprValue::Bool(*b),
            Value::Number(n) => ExprValue::Num(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => ExprValue::Str(s.clone()),
            // Containers are only ever tested for truthiness; both are truthy.
            Value::Array(_) | Value::Object(_) => ExprValue::Bool(true),
        }
    }
}

/// Comparison operators in the allowed set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    StrictEq,
    NotEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(ExprValue),
    /// Dotted path under `context.`
    Ident(String),
    LParen,
    RParen,
    Cmp(CmpOp),
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let parse_err = |what: &str| MaestroError::validation(format!("expression: {}", what));

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(parse_err("single '&' is not an operator"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(parse_err("single '|' is not an operator"));
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&'=') {
                    if bytes.get(i + 2) == Some(&'=') {
                        tokens.push(Token::Cmp(CmpOp::StrictEq));
                        i += 3;
                    } else {
                        tokens.push(Token::Cmp(CmpOp::Eq));
                        i += 2;
                    }
                } else {
                    return Err(parse_err("assignment is not allowed"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&'=') {
                    if bytes.get(i + 2) == Some(&'=') {
                        tokens.push(Token::Cmp(CmpOp::StrictNotEq));
                        i += 3;
                    } else {
                        tokens.push(Token::Cmp(CmpOp::NotEq));
                        i += 2;
                    }
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(parse_err("unterminated string literal")),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = bytes
                                .get(i + 1)
                                .ok_or_else(|| parse_err("dangling escape"))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '\\' => '\\',
                                '"' => '"',
                                '\'' => '\'',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(ExprValue::Str(s)));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let num: f64 = text
                    .parse()
                    .map_err(|_| parse_err(&format!("invalid number '{}'", text)))?;
                tokens.push(Token::Literal(ExprValue::Num(num)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_' || bytes[i] == '.')
                {
                    i += 1;
                }
                let word: String = bytes[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Literal(ExprValue::Bool(true))),
                    "false" => tokens.push(Token::Literal(ExprValue::Bool(false))),
                    "null" => tokens.push(Token::Literal(ExprValue::Null)),
                    "undefined" => tokens.push(Token::Literal(ExprValue::Undefined)),
                    _ => {
                        // The only identifiers allowed are context.<dotted.path>.
                        let path = word.strip_prefix("context.").ok_or_else(|| {
                            parse_err(&format!(
                                "identifier '{}' is not of the form context.<path>",
                                word
                            ))
                        })?;
                        if path.is_empty() || path.split('.').any(str::is_empty) {
                            return Err(parse_err(&format!("malformed context path '{}'", word)));
                        }
                        tokens.push(Token::Ident(path.to_string()));
                    }
                }
            }
            other => {
                return Err(parse_err(&format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

/// Parsed expression tree
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(ExprValue),
    ContextPath(String),
    Not(Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn err(&self, what: &str) -> MaestroError {
        MaestroError::validation(format!("expression: {}", what))
    }

    // or := and ('||' and)*
    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and := cmp ('&&' cmp)*
    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // cmp := unary (op unary)?
    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_unary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.next();
            let right = self.parse_unary()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    // unary := '!' unary | primary
    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Ident(path)) => Ok(Expr::ContextPath(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("missing closing parenthesis")),
                }
            }
            Some(other) => Err(self.err(&format!("unexpected token {:?}", other))),
            None => Err(self.err("unexpected end of input")),
        }
    }
}

/// Parse an expression; any token or construct outside the allowed
/// grammar fails with a validation error.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(MaestroError::validation("expression: empty input"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(MaestroError::validation(
            "expression: trailing tokens after expression",
        ));
    }
    Ok(expr)
}

fn resolve(path: &str, context: &Value) -> ExprValue {
    match paths::get_path(context, path) {
        Some(value) => ExprValue::from_json(value),
        None => ExprValue::Undefined,
    }
}

fn loose_eq(left: &ExprValue, right: &ExprValue) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (ExprValue::Null, ExprValue::Undefined) | (ExprValue::Undefined, ExprValue::Null) => true,
        (ExprValue::Num(n), ExprValue::Str(s)) | (ExprValue::Str(s), ExprValue::Num(n)) => {
            s.parse::<f64>().map(|parsed| parsed == *n).unwrap_or(false)
        }
        (ExprValue::Bool(b), other) | (other, ExprValue::Bool(b)) => {
            let as_num = ExprValue::Num(if *b { 1.0 } else { 0.0 });
            loose_eq(&as_num, other)
        }
        _ => false,
    }
}

fn ordering(op: CmpOp, left: &ExprValue, right: &ExprValue) -> Result<bool> {
    let cmp = match (left, right) {
        (ExprValue::Num(a), ExprValue::Num(b)) => a.partial_cmp(b),
        (ExprValue::Str(a), ExprValue::Str(b)) => Some(a.cmp(b)),
        (ExprValue::Num(a), ExprValue::Str(s)) => {
            s.parse::<f64>().ok().and_then(|b| a.partial_cmp(&b))
        }
        (ExprValue::Str(s), ExprValue::Num(b)) => {
            s.parse::<f64>().ok().and_then(|a| a.partial_cmp(b))
        }
        _ => None,
    };
    let cmp = cmp.ok_or_else(|| {
        MaestroError::validation(format!(
            "expression: cannot order {:?} against {:?}",
            left, right
        ))
    })?;
    Ok(match op {
        CmpOp::Lt => cmp == std::cmp::Ordering::Less,
        CmpOp::Le => cmp != std::cmp::Ordering::Greater,
        CmpOp::Gt => cmp == std::cmp::Ordering::Greater,
        CmpOp::Ge => cmp != std::cmp::Ordering::Less,
        _ => unreachable!("equality handled separately"),
    })
}

fn eval(expr: &Expr, context: &Value) -> Result<ExprValue> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::ContextPath(path) => resolve(path, context),
        Expr::Not(inner) => ExprValue::Bool(!eval(inner, context)?.truthy()),
        Expr::And(left, right) => ExprValue::Bool(
            eval(left, context)?.truthy() && eval(right, context)?.truthy(),
        ),
        Expr::Or(left, right) => ExprValue::Bool(
            eval(left, context)?.truthy() || eval(right, context)?.truthy(),
        ),
        Expr::Cmp(op, left, right) => {
            let lhs = eval(left, context)?;
            let rhs = eval(right, context)?;
            let result = match op {
                CmpOp::Eq => loose_eq(&lhs, &rhs),
                CmpOp::NotEq => !loose_eq(&lhs, &rhs),
                CmpOp::StrictEq => lhs == rhs,
                CmpOp::StrictNotEq => lhs != rhs,
                _ => ordering(*op, &lhs, &rhs)?,
            };
            ExprValue::Bool(result)
        }
    })
}

/// Evaluate a parsed expression against context data, yielding truthiness
pub fn evaluate(expr: &Expr, context: &Value) -> Result<bool> {
    Ok(eval(expr, context)?.truthy())
}

/// Parse and evaluate a condition string.
///
/// Parse failures surface as errors; evaluation failures default the
/// condition to false with a warning, so a bad comparison never takes a
/// branch it should not.
pub fn evaluate_condition(input: &str, context: &Value) -> Result<bool> {
    let expr = parse(input)?;
    match evaluate(&expr, context) {
        Ok(result) => Ok(result),
        Err(err) => {
            warn!(condition = input, error = %err, "condition evaluation failed, defaulting to false");
            Ok(false)
        }
    }
}
