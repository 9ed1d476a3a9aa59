//! Condition evaluator for validation steps.
//!
//! A small, side-effect free expression language over the step's variables:
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := eq (("&&" | "and") eq)*
//! eq      := cmp (("==" | "!=") cmp)*
//! cmp     := sum (("<" | "<=" | ">" | ">=") sum)*
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := ("!" | "not" | "-") unary | primary
//! primary := number | string | true | false | null | identifier | "(" or ")"
//! ```
//!
//! Values are numbers, strings, booleans and null. Logical operators require
//! booleans and short-circuit. Equality across different types is `false`;
//! ordering and arithmetic across different types is an error.
//!
//! Nesting is capped at [`MAX_DEPTH`] levels. Every parenthesis, unary
//! operator and chained binary operator counts as one level, so neither
//! parsing nor evaluation can exhaust the stack.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;

/// Deepest expression tree a condition may build.
pub const MAX_DEPTH: usize = 64;

/// Evaluation errors; reported as the validation step's failure reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedChar { ch: char, position: usize },

    #[error("unterminated string starting at position {position}")]
    UnterminatedString { position: usize },

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at position {position}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        position: usize,
    },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("variable '{0}' holds an array or object, which conditions cannot use")]
    UnsupportedVariable(String),

    #[error("operator '{op}' cannot be applied to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("operator '{op}' cannot be applied to {operand}")]
    InvalidOperand { op: &'static str, operand: &'static str },

    #[error("division by zero")]
    DivisionByZero,

    #[error("condition evaluated to {0}, expected a boolean")]
    NotBoolean(&'static str),

    #[error("expression nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Evaluates `condition` against `variables`; the result must be a boolean.
pub fn evaluate(condition: &str, variables: &BTreeMap<String, Json>) -> Result<bool, ExprError> {
    let tokens = tokenize(condition)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    match expr.eval(variables)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::NotBoolean(other.type_name())),
    }
}

// ─── Values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Num(_) => "number",
            Self::Str(_) => "string",
        }
    }

    fn from_json(name: &str, json: &Json) -> Result<Self, ExprError> {
        match json {
            Json::Null => Ok(Self::Null),
            Json::Bool(b) => Ok(Self::Bool(*b)),
            Json::Number(n) => n
                .as_f64()
                .map(Self::Num)
                .ok_or_else(|| ExprError::InvalidNumber(n.to_string())),
            Json::String(s) => Ok(Self::Str(s.clone())),
            Json::Array(_) | Json::Object(_) => Err(ExprError::UnsupportedVariable(name.to_owned())),
        }
    }
}

// ─── Tokens ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "number {n}"),
            Self::Str(s) => write!(f, "string \"{s}\""),
            Self::Ident(name) => write!(f, "'{name}'"),
            Self::Op(op) => write!(f, "'{op}'"),
            Self::LParen => write!(f, "'('"),
            Self::RParen => write!(f, "')'"),
        }
    }
}

const OPERATORS: [&str; 14] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "+", "-", "*", "/", "%",
];

fn tokenize(input: &str) -> Result<Vec<(Tok, usize)>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && matches!(chars[i - 1], 'e' | 'E')))
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
            tokens.push((Tok::Num(n), start));
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(ExprError::UnterminatedString { position: start }),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&'\\') if i + 1 < chars.len() => {
                        text.push(chars[i + 1]);
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((Tok::Str(text), start));
        } else if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let tok = match word.as_str() {
                "and" => Tok::Op("&&"),
                "or" => Tok::Op("||"),
                "not" => Tok::Op("!"),
                _ => Tok::Ident(word),
            };
            tokens.push((tok, start));
        } else if c == '(' {
            tokens.push((Tok::LParen, start));
            i += 1;
        } else if c == ')' {
            tokens.push((Tok::RParen, start));
            i += 1;
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or(ExprError::UnexpectedChar { ch: c, position: start })?;
            tokens.push((Tok::Op(*op), start));
            i += op.len();
        }
    }
    Ok(tokens)
}

// ─── AST ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Expr {
    Lit(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, vars: &BTreeMap<String, Json>) -> Result<Value, ExprError> {
        match self {
            Self::Lit(v) => Ok(v.clone()),
            Self::Var(name) => match vars.get(name) {
                Some(json) => Value::from_json(name, json),
                None => Err(ExprError::UnknownVariable(name.clone())),
            },
            Self::Not(inner) => match inner.eval(vars)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(ExprError::InvalidOperand {
                    op: "!",
                    operand: other.type_name(),
                }),
            },
            Self::Neg(inner) => match inner.eval(vars)? {
                Value::Num(n) => Ok(Value::Num(-n)),
                other => Err(ExprError::InvalidOperand {
                    op: "-",
                    operand: other.type_name(),
                }),
            },
            Self::And(l, r) => {
                if !eval_bool("&&", l, vars)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(eval_bool("&&", r, vars)?))
            }
            Self::Or(l, r) => {
                if eval_bool("||", l, vars)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(eval_bool("||", r, vars)?))
            }
            Self::Binary(op, l, r) => binary(op, l.eval(vars)?, r.eval(vars)?),
        }
    }
}

fn eval_bool(op: &'static str, expr: &Expr, vars: &BTreeMap<String, Json>) -> Result<bool, ExprError> {
    match expr.eval(vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::InvalidOperand {
            op,
            operand: other.type_name(),
        }),
    }
}

fn binary(op: &'static str, left: Value, right: Value) -> Result<Value, ExprError> {
    use Value::{Bool, Num, Str};

    let result = match (op, &left, &right) {
        ("==", _, _) => Bool(left == right),
        ("!=", _, _) => Bool(left != right),

        ("<", Num(a), Num(b)) => Bool(a < b),
        ("<=", Num(a), Num(b)) => Bool(a <= b),
        (">", Num(a), Num(b)) => Bool(a > b),
        (">=", Num(a), Num(b)) => Bool(a >= b),
        ("<", Str(a), Str(b)) => Bool(a < b),
        ("<=", Str(a), Str(b)) => Bool(a <= b),
        (">", Str(a), Str(b)) => Bool(a > b),
        (">=", Str(a), Str(b)) => Bool(a >= b),

        ("+", Num(a), Num(b)) => Num(a + b),
        ("+", Str(a), Str(b)) => Str(format!("{a}{b}")),
        ("-", Num(a), Num(b)) => Num(a - b),
        ("*", Num(a), Num(b)) => Num(a * b),
        ("/" | "%", Num(_), Num(b)) if *b == 0.0 => return Err(ExprError::DivisionByZero),
        ("/", Num(a), Num(b)) => Num(a / b),
        ("%", Num(a), Num(b)) => Num(a % b),

        _ => {
            return Err(ExprError::TypeMismatch {
                op,
                left: left.type_name(),
                right: right.type_name(),
            });
        }
    };
    Ok(result)
}

// ─── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    /// Tree depth of the node being parsed.
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep { limit: MAX_DEPTH });
        }
        self.depth += 1;
        Ok(())
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some((Tok::Op(op), _)) => Some(*op),
            _ => None,
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let op = self.peek_op().filter(|op| ops.contains(op))?;
        self.pos += 1;
        Some(op)
    }

    fn end_position(&self) -> usize {
        self.tokens.last().map(|(_, p)| p + 1).unwrap_or(0)
    }

    fn expect_end(&self) -> Result<(), ExprError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some((tok, position)) => Err(ExprError::UnexpectedToken {
                found: tok.to_string(),
                expected: "end of expression",
                position: *position,
            }),
        }
    }

    // Chained operators build a left-deep tree, so every link descends one
    // level until the chain ends.

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let depth = self.depth;
        let mut left = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let depth = self.depth;
        let mut left = self.parse_binary_level(0)?;
        while self.eat_op(&["&&"]).is_some() {
            self.descend()?;
            let right = self.parse_binary_level(0)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    /// Left-associative binary levels, loosest first.
    fn parse_binary_level(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: [&[&str]; 4] = [
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];

        let Some(ops) = LEVELS.get(level) else {
            return self.parse_unary();
        };
        let depth = self.depth;
        let mut left = self.parse_binary_level(level + 1)?;
        while let Some(op) = self.eat_op(ops) {
            self.descend()?;
            let right = self.parse_binary_level(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let Some(op) = self.eat_op(&["!", "-"]) else {
            return self.parse_primary();
        };
        self.descend()?;
        let inner = Box::new(self.parse_unary()?);
        self.depth -= 1;
        Ok(if op == "!" {
            Expr::Not(inner)
        } else {
            Expr::Neg(inner)
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let Some((tok, position)) = self.tokens.get(self.pos).cloned() else {
            return Err(ExprError::UnexpectedToken {
                found: "end of expression".to_owned(),
                expected: "a value",
                position: self.end_position(),
            });
        };
        self.pos += 1;

        match tok {
            Tok::Num(n) => Ok(Expr::Lit(Value::Num(n))),
            Tok::Str(s) => Ok(Expr::Lit(Value::Str(s))),
            Tok::Ident(name) => Ok(match name.as_str() {
                "true" | "True" => Expr::Lit(Value::Bool(true)),
                "false" | "False" => Expr::Lit(Value::Bool(false)),
                "null" | "None" => Expr::Lit(Value::Null),
                _ => Expr::Var(name),
            }),
            Tok::LParen => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.tokens.get(self.pos) {
                    Some((Tok::RParen, _)) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    Some((tok, position)) => Err(ExprError::UnexpectedToken {
                        found: tok.to_string(),
                        expected: "')'",
                        position: *position,
                    }),
                    None => Err(ExprError::UnexpectedToken {
                        found: "end of expression".to_owned(),
                        expected: "')'",
                        position: self.end_position(),
                    }),
                }
            }
            other => Err(ExprError::UnexpectedToken {
                found: other.to_string(),
                expected: "a value",
                position,
            }),
        }
    }
}
