//! Expression language for restrictions, metrics, problem sizes and grid divisors.
//!
//! A small Python-flavoured grammar, parsed once into an [`Expr`] tree and
//! evaluated against a [`Scope`] (a configuration, a metric record, ...).
//!
//! Precedence, lowest to highest:
//! 1. `or`, `||`
//! 2. `and`, `&&`
//! 3. `not`, `!`
//! 4. comparisons `== != < <= > >=` (chainable: `a < b <= c`)
//! 5. `+`, `-`
//! 6. `*`, `/`, `//`, `%`
//! 7. unary `-`
//! 8. `**` (right-associative)
//!
//! Functions: `min`, `max`, `abs`, `ceil`, `floor`, `sqrt`, `log2`.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {pos} in `{input}`: {message}")]
    Parse {
        input: String,
        pos: usize,
        message: String,
    },

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
        }
    }
}

/// Variable lookup for evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Scope for [(&str, Value)] {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| v.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
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

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
    Abs,
    Ceil,
    Floor,
    Sqrt,
    Log2,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "abs" => Some(Function::Abs),
            "ceil" => Some(Function::Ceil),
            "floor" => Some(Function::Floor),
            "sqrt" => Some(Function::Sqrt),
            "log2" => Some(Function::Log2),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Abs => "abs",
            Function::Ceil => "ceil",
            Function::Floor => "floor",
            Function::Sqrt => "sqrt",
            Function::Log2 => "log2",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Eof,
}

struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Tokenizer { input, pos: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.input[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            input: self.input.to_string(),
            pos,
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '_' {
                self.advance();
            } else if c == '.' && !is_float {
                is_float = true;
                self.advance();
            } else if c == 'e' || c == 'E' {
                is_float = true;
                self.advance();
                if let Some('+') | Some('-') = self.peek_char() {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let text: String = self.input[start..self.pos]
            .chars()
            .filter(|&c| c != '_')
            .collect();
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| self.error(start, format!("invalid number `{}`", text)))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| self.error(start, format!("invalid integer `{}`", text)))
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ExprError> {
        let start = self.pos;
        self.advance();
        let mut out = String::new();
        loop {
            match self.peek_char() {
                None => return Err(self.error(start, "unterminated string literal")),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(Token::Str(out));
                }
                Some('\\') => {
                    self.advance();
                    if let Some(c) = self.peek_char() {
                        out.push(c);
                        self.advance();
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    /// Returns the token and its starting offset.
    fn next_token(&mut self) -> Result<(Token, usize), ExprError> {
        self.skip_whitespace();
        let start = self.pos;
        let Some(c) = self.peek_char() else {
            return Ok((Token::Eof, start));
        };
        let two = self.peek_second();
        let token = match (c, two) {
            ('*', Some('*')) => self.op2("**"),
            ('/', Some('/')) => self.op2("//"),
            ('=', Some('=')) => self.op2("=="),
            ('!', Some('=')) => self.op2("!="),
            ('<', Some('=')) => self.op2("<="),
            ('>', Some('=')) => self.op2(">="),
            ('&', Some('&')) => self.op2("and"),
            ('|', Some('|')) => self.op2("or"),
            ('+', _) => self.op1("+"),
            ('-', _) => self.op1("-"),
            ('*', _) => self.op1("*"),
            ('/', _) => self.op1("/"),
            ('%', _) => self.op1("%"),
            ('<', _) => self.op1("<"),
            ('>', _) => self.op1(">"),
            ('!', _) => self.op1("not"),
            ('(', _) => {
                self.advance();
                Token::LParen
            }
            (')', _) => {
                self.advance();
                Token::RParen
            }
            (',', _) => {
                self.advance();
                Token::Comma
            }
            ('\'', _) | ('"', _) => self.read_string(c)?,
            _ if c.is_ascii_digit() || (c == '.' && two.is_some_and(|d| d.is_ascii_digit())) => {
                self.read_number()?
            }
            _ if c.is_alphabetic() || c == '_' => {
                let ident = self.read_ident();
                match ident.as_str() {
                    "and" => Token::Op("and"),
                    "or" => Token::Op("or"),
                    "not" => Token::Op("not"),
                    "true" | "True" => Token::Ident("true".into()),
                    "false" | "False" => Token::Ident("false".into()),
                    _ => Token::Ident(ident),
                }
            }
            _ => return Err(self.error(start, format!("unexpected character `{}`", c))),
        };
        Ok((token, start))
    }

    fn op1(&mut self, op: &'static str) -> Token {
        self.advance();
        Token::Op(op)
    }

    fn op2(&mut self, op: &'static str) -> Token {
        self.advance();
        self.advance();
        Token::Op(op)
    }
}

// ============================================================================
// Recursive descent parser
// ============================================================================

struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    current: Token,
    current_pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, ExprError> {
        let mut tokenizer = Tokenizer::new(input);
        let (current, current_pos) = tokenizer.next_token()?;
        Ok(Parser {
            tokenizer,
            current,
            current_pos,
        })
    }

    fn advance(&mut self) -> Result<(), ExprError> {
        let (token, pos) = self.tokenizer.next_token()?;
        self.current = token;
        self.current_pos = pos;
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        self.tokenizer.error(self.current_pos, message)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.current, Token::Op(o) if o == op)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.is_op("or") {
            self.advance()?;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        while self.is_op("and") {
            self.advance()?;
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.is_op("not") {
            self.advance()?;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.current {
            Token::Op("==") => Some(BinaryOp::Eq),
            Token::Op("!=") => Some(BinaryOp::Ne),
            Token::Op("<") => Some(BinaryOp::Lt),
            Token::Op("<=") => Some(BinaryOp::Le),
            Token::Op(">") => Some(BinaryOp::Gt),
            Token::Op(">=") => Some(BinaryOp::Ge),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let first = self.parse_additive()?;
        let mut operands = vec![first];
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            self.advance()?;
            ops.push(op);
            operands.push(self.parse_additive()?);
        }
        if ops.is_empty() {
            return Ok(operands.remove(0));
        }
        // a < b < c  ==>  (a < b) and (b < c)
        let mut chain: Option<Expr> = None;
        for (i, op) in ops.into_iter().enumerate() {
            let cmp = Expr::Binary(
                op,
                Box::new(operands[i].clone()),
                Box::new(operands[i + 1].clone()),
            );
            chain = Some(match chain {
                None => cmp,
                Some(prev) => Expr::Binary(BinaryOp::And, Box::new(prev), Box::new(cmp)),
            });
        }
        chain.ok_or_else(|| self.error("empty comparison"))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current {
                Token::Op("+") => BinaryOp::Add,
                Token::Op("-") => BinaryOp::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current {
                Token::Op("*") => BinaryOp::Mul,
                Token::Op("/") => BinaryOp::Div,
                Token::Op("//") => BinaryOp::FloorDiv,
                Token::Op("%") => BinaryOp::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.is_op("-") {
            self.advance()?;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.is_op("+") {
            self.advance()?;
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ExprError> {
        let base = self.parse_primary()?;
        if self.is_op("**") {
            self.advance()?;
            let exp = self.parse_unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.current.clone() {
            Token::Int(v) => {
                self.advance()?;
                Ok(Expr::Literal(Value::Int(v)))
            }
            Token::Float(v) => {
                self.advance()?;
                Ok(Expr::Literal(Value::Float(v)))
            }
            Token::Str(s) => {
                self.advance()?;
                Ok(Expr::Literal(Value::Str(s)))
            }
            Token::Ident(name) => {
                self.advance()?;
                if matches!(self.current, Token::LParen) {
                    let func = Function::from_name(&name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    self.advance()?;
                    let mut args = Vec::new();
                    if !matches!(self.current, Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if matches!(self.current, Token::Comma) {
                                self.advance()?;
                                continue;
                            }
                            break;
                        }
                    }
                    if !matches!(self.current, Token::RParen) {
                        return Err(self.error("expected `)` after function arguments"));
                    }
                    self.advance()?;
                    check_arity(func, args.len()).map_err(|m| self.error(m))?;
                    return Ok(Expr::Call(func, args));
                }
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    _ => Ok(Expr::Var(name)),
                }
            }
            Token::LParen => {
                self.advance()?;
                let expr = self.parse_or()?;
                if !matches!(self.current, Token::RParen) {
                    return Err(self.error("expected `)`"));
                }
                self.advance()?;
                Ok(expr)
            }
            Token::Eof => Err(self.error("unexpected end of expression")),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}

fn check_arity(func: Function, n: usize) -> Result<(), String> {
    let ok = match func {
        Function::Min | Function::Max => n >= 1,
        _ => n == 1,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("wrong number of arguments ({}) for `{}`", n, func.name()))
    }
}

// ============================================================================
// Evaluation
// ============================================================================

impl Expr {
    /// Parse an expression, requiring that the whole input is consumed.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let mut parser = Parser::new(input)?;
        let expr = parser.parse_or()?;
        if !matches!(parser.current, Token::Eof) {
            return Err(parser.error(format!(
                "unexpected token {:?} after expression",
                parser.current
            )));
        }
        Ok(expr)
    }

    /// Every variable name the expression reads, sorted and deduplicated.
    pub fn variables(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.collect_variables(&mut vars);
        vars.sort();
        vars.dedup();
        vars
    }

    fn collect_variables(&self, vars: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(v) => vars.push(v.clone()),
            Expr::Neg(a) | Expr::Not(a) => a.collect_variables(vars),
            Expr::Binary(_, a, b) => {
                a.collect_variables(vars);
                b.collect_variables(vars);
            }
            Expr::Call(_, args) => {
                for a in args {
                    a.collect_variables(vars);
                }
            }
        }
    }

    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => scope
                .lookup(name)
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Neg(a) => match a.eval(scope)? {
                Value::Int(v) => Ok(v
                    .checked_neg()
                    .map(Value::Int)
                    .unwrap_or(Value::Float(-(v as f64)))),
                Value::Float(v) => Ok(Value::Float(-v)),
                other => Err(ExprError::Type(format!("cannot negate {}", other.kind()))),
            },
            Expr::Not(a) => Ok(Value::Bool(!a.eval(scope)?.is_truthy())),
            Expr::Binary(BinaryOp::And, a, b) => {
                if !a.eval(scope)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(b.eval(scope)?.is_truthy()))
            }
            Expr::Binary(BinaryOp::Or, a, b) => {
                if a.eval(scope)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(b.eval(scope)?.is_truthy()))
            }
            Expr::Binary(op, a, b) => {
                let lhs = a.eval(scope)?;
                let rhs = b.eval(scope)?;
                binary(*op, lhs, rhs)
            }
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*func, values)
            }
        }
    }

    /// Evaluate and coerce to a boolean.
    pub fn eval_bool(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        Ok(self.eval(scope)?.is_truthy())
    }

    /// Evaluate and require a numeric result.
    pub fn eval_f64(&self, scope: &dyn Scope) -> Result<f64, ExprError> {
        let v = self.eval(scope)?;
        v.as_f64()
            .ok_or_else(|| ExprError::Type(format!("expected a number, got {}", v.kind())))
    }
}

fn numeric_pair(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<(f64, f64), ExprError> {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExprError::Type(format!(
            "unsupported operands for `{}`: {} and {}",
            op.symbol(),
            lhs.kind(),
            rhs.kind()
        ))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    use BinaryOp::*;
    match op {
        Eq => return Ok(Value::Bool(values_equal(&lhs, &rhs))),
        Ne => return Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        Lt | Le | Gt | Ge => {
            let ord = match (&lhs, &rhs) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => {
                    let (a, b) = numeric_pair(op, &lhs, &rhs)?;
                    a.partial_cmp(&b)
                        .ok_or_else(|| ExprError::Type("comparison with NaN".into()))?
                }
            };
            let result = match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if let (Add, Value::Str(a), Value::Str(b)) = (op, &lhs, &rhs) {
        return Ok(Value::Str(format!("{}{}", a, b)));
    }

    if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
        let (a, b) = (*a, *b);
        return match op {
            Add => Ok(a.checked_add(b).map(Value::Int).unwrap_or(Value::Float(a as f64 + b as f64))),
            Sub => Ok(a.checked_sub(b).map(Value::Int).unwrap_or(Value::Float(a as f64 - b as f64))),
            Mul => Ok(a.checked_mul(b).map(Value::Int).unwrap_or(Value::Float(a as f64 * b as f64))),
            Div => {
                if b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            FloorDiv => {
                if b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    // i64::MIN // -1 is the only overflowing case
                    Ok(match (a.checked_div(b), a.checked_rem(b)) {
                        (Some(q), Some(r)) if r != 0 && (r < 0) != (b < 0) => Value::Int(q - 1),
                        (Some(q), _) => Value::Int(q),
                        _ => Value::Float((a as f64 / b as f64).floor()),
                    })
                }
            }
            Mod => {
                if b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    // result takes the sign of the divisor
                    let r = a.checked_rem(b).unwrap_or(0);
                    Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }))
                }
            }
            Pow => {
                if b >= 0 {
                    let exp = u32::try_from(b).unwrap_or(u32::MAX);
                    Ok(a.checked_pow(exp)
                        .map(Value::Int)
                        .unwrap_or(Value::Float((a as f64).powf(b as f64))))
                } else {
                    Ok(Value::Float((a as f64).powf(b as f64)))
                }
            }
            _ => unreachable!("comparison and logical operators handled above"),
        };
    }

    let (a, b) = numeric_pair(op, &lhs, &rhs)?;
    match op {
        Add => Ok(Value::Float(a + b)),
        Sub => Ok(Value::Float(a - b)),
        Mul => Ok(Value::Float(a * b)),
        Div => {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(Value::Float(a / b))
            }
        }
        FloorDiv => {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        Mod => {
            if b == 0.0 {
                Err(ExprError::DivisionByZero)
            } else {
                Ok(Value::Float(a - b * (a / b).floor()))
            }
        }
        Pow => Ok(Value::Float(a.powf(b))),
        _ => unreachable!("comparison and logical operators handled above"),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn call(func: Function, args: Vec<Value>) -> Result<Value, ExprError> {
    let numeric = |v: &Value| {
        v.as_f64().ok_or_else(|| {
            ExprError::Type(format!("`{}` expects numbers, got {}", func.name(), v.kind()))
        })
    };
    match func {
        Function::Min | Function::Max => {
            let all_int = args.iter().all(|v| matches!(v, Value::Int(_)));
            let mut best = numeric(&args[0])?;
            let mut best_idx = 0;
            for (i, v) in args.iter().enumerate().skip(1) {
                let x = numeric(v)?;
                let better = if func == Function::Min { x < best } else { x > best };
                if better {
                    best = x;
                    best_idx = i;
                }
            }
            if all_int {
                Ok(args[best_idx].clone())
            } else {
                Ok(Value::Float(best))
            }
        }
        Function::Abs => match &args[0] {
            Value::Int(v) => Ok(v
                .checked_abs()
                .map(Value::Int)
                .unwrap_or(Value::Float((*v as f64).abs()))),
            other => Ok(Value::Float(numeric(other)?.abs())),
        },
        Function::Ceil => Ok(Value::Int(numeric(&args[0])?.ceil() as i64)),
        Function::Floor => Ok(Value::Int(numeric(&args[0])?.floor() as i64)),
        Function::Sqrt => {
            let x = numeric(&args[0])?;
            if x < 0.0 {
                Err(ExprError::Type("sqrt of negative number".into()))
            } else {
                Ok(Value::Float(x.sqrt()))
            }
        }
        Function::Log2 => {
            let x = numeric(&args[0])?;
            if x <= 0.0 {
                Err(ExprError::Type("log2 of non-positive number".into()))
            } else {
                Ok(Value::Float(x.log2()))
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::Str(s)) => write!(f, "'{}'", s),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Neg(a) => write!(f, "-({})", a),
            Expr::Not(a) => write!(f, "not ({})", a),
            Expr::Binary(op, a, b) => write!(f, "({} {} {})", a, op.symbol(), b),
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(vars: &[(&str, Value)]) -> HashMap<String, Value> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(src: &str, vars: &[(&str, Value)]) -> Value {
        Expr::parse(src).unwrap().eval(&scope(vars)).unwrap()
    }

    #[test]
    fn precedence_and_integer_arithmetic() {
        assert_eq!(eval("1 + 2 * 3", &[]), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3", &[]), Value::Int(9));
        assert_eq!(eval("2 ** 3 ** 2", &[]), Value::Int(512));
        assert_eq!(eval("-2 ** 2", &[]), Value::Int(-4));
        assert_eq!(eval("7 // 2", &[]), Value::Int(3));
        assert_eq!(eval("-7 // 2", &[]), Value::Int(-4));
        assert_eq!(eval("-7 % 3", &[]), Value::Int(2));
        assert_eq!(eval("7 / 2", &[]), Value::Float(3.5));
    }

    #[test]
    fn integer_edge_cases_do_not_overflow() {
        let vars = [("a", Value::Int(i64::MIN))];
        let min = i64::MIN as f64;
        assert_eq!(eval("a // -1", &vars), Value::Float(-min));
        assert_eq!(eval("a % -1", &vars), Value::Int(0));
        assert_eq!(eval("-a", &vars), Value::Float(-min));
        assert_eq!(eval("abs(a)", &vars), Value::Float(-min));
        assert_eq!(eval("a % 3 >= 0", &vars), Value::Bool(true));
        assert_eq!(eval("7 // -2", &[]), Value::Int(-4));
        assert_eq!(eval("7 % -2", &[]), Value::Int(-1));
        assert_eq!(eval("-8 // 2", &[]), Value::Int(-4));
    }

    #[test]
    fn restriction_style_expressions() {
        let vars = [
            ("block_size_x", Value::Int(128)),
            ("block_size_y", Value::Int(4)),
            ("tile", Value::Int(2)),
        ];
        assert_eq!(eval("block_size_x * block_size_y <= 1024", &vars), Value::Bool(true));
        assert_eq!(eval("block_size_x*block_size_y>=1024 or tile == 2", &vars), Value::Bool(true));
        assert_eq!(eval("tile % 2 == 0 && !(tile > 4)", &vars), Value::Bool(true));
        assert_eq!(eval("32 <= block_size_x < 128", &vars), Value::Bool(false));
    }

    #[test]
    fn strings_and_functions() {
        let vars = [("algo", Value::Str("tiled".into())), ("n", Value::Int(9))];
        assert_eq!(eval("algo == 'tiled'", &vars), Value::Bool(true));
        assert_eq!(eval("algo != \"naive\"", &vars), Value::Bool(true));
        assert_eq!(eval("max(1, n, 4)", &vars), Value::Int(9));
        assert_eq!(eval("min(2.5, n)", &vars), Value::Float(2.5));
        assert_eq!(eval("ceil(n / 2)", &vars), Value::Int(5));
        assert_eq!(eval("sqrt(n)", &vars), Value::Float(3.0));
        assert_eq!(eval("1e9", &[]), Value::Float(1e9));
    }

    #[test]
    fn variables_are_collected() {
        let e = Expr::parse("a * b + max(c, a) > 3").unwrap();
        assert_eq!(e.variables(), vec!["a", "b", "c"]);
    }

    #[test]
    fn errors_are_reported() {
        assert!(matches!(Expr::parse("1 +"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("(1 + 2"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("foo(1)"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(Expr::parse("a $ b"), Err(ExprError::Parse { .. })));
        let e = Expr::parse("a / 0").unwrap();
        assert_eq!(
            e.eval(&scope(&[("a", Value::Int(1))])),
            Err(ExprError::DivisionByZero)
        );
        let e = Expr::parse("missing + 1").unwrap();
        assert!(matches!(
            e.eval(&scope(&[])),
            Err(ExprError::UnknownVariable(_))
        ));
    }

    #[test]
    fn logical_operators_short_circuit() {
        // rhs would divide by zero if evaluated
        assert_eq!(eval("false and 1 / 0", &[]), Value::Bool(false));
        assert_eq!(eval("true or 1 / 0", &[]), Value::Bool(true));
    }
}
