//! Entry/exit condition evaluation. The engine only sees the
//! [`ConditionEvaluator`] trait: a boolean per bar index, where an
//! evaluation error (indicator still warming up, index out of range) is
//! reported as `Err` and treated as `false` by the caller. Parsing happens
//! in [`prepare`] so malformed sources fail before a run starts.
//!
//! Grammar, deliberately small:
//!
//! ```text
//! expr       := and_expr (("||" | "or") and_expr)*
//! and_expr   := unary (("&&" | "and") unary)*
//! unary      := "true" | "false" | "(" expr ")" | comparison
//! comparison := operand op operand        op: < <= > >= == !=
//! operand    := number | price field | name "(" period ")"
//! ```

use std::fmt;

use crate::error::{QuantError, Result};
use crate::indicators::IndicatorKind;
use crate::types::Candle;

/// Error raised while evaluating a prepared condition at one bar.
#[derive(Debug, Clone, thiserror::Error)]
#[error("evaluation failed at bar {bar}: {message}")]
pub struct EvalError {
    pub bar: usize,
    pub message: String,
}

/// The opaque seam between the engine and the condition DSL.
pub trait ConditionEvaluator {
    fn evaluate(&self, bar: usize) -> std::result::Result<bool, EvalError>;
}

/// Constant condition, mostly useful in tests and as the fallback for
/// strategies without an exit expression.
#[derive(Debug, Clone, Copy)]
pub struct ConstCondition(pub bool);

impl ConditionEvaluator for ConstCondition {
    fn evaluate(&self, _bar: usize) -> std::result::Result<bool, EvalError> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl PriceField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "open" => Some(PriceField::Open),
            "high" => Some(PriceField::High),
            "low" => Some(PriceField::Low),
            "close" => Some(PriceField::Close),
            "volume" => Some(PriceField::Volume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Number(f64),
    Field(PriceField),
    /// Index into the prepared indicator series table.
    Indicator(usize),
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(bool),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Operand, CmpOp, Operand),
}

/// A parsed condition bound to a candle slice, with every referenced
/// indicator series precomputed.
pub struct PreparedCondition {
    ast: Expr,
    series: Vec<Vec<Option<f64>>>,
    opens: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    closes: Vec<f64>,
    volumes: Vec<f64>,
}

impl PreparedCondition {
    fn resolve(&self, operand: &Operand, bar: usize) -> std::result::Result<f64, EvalError> {
        match operand {
            Operand::Number(n) => Ok(*n),
            Operand::Field(field) => {
                let arr = match field {
                    PriceField::Open => &self.opens,
                    PriceField::High => &self.highs,
                    PriceField::Low => &self.lows,
                    PriceField::Close => &self.closes,
                    PriceField::Volume => &self.volumes,
                };
                arr.get(bar).copied().ok_or_else(|| EvalError {
                    bar,
                    message: "bar index out of range".to_string(),
                })
            }
            Operand::Indicator(idx) => self.series[*idx]
                .get(bar)
                .copied()
                .flatten()
                .ok_or_else(|| EvalError {
                    bar,
                    message: "indicator not ready".to_string(),
                }),
        }
    }

    fn eval_expr(&self, expr: &Expr, bar: usize) -> std::result::Result<bool, EvalError> {
        match expr {
            Expr::Literal(b) => Ok(*b),
            Expr::And(a, b) => Ok(self.eval_expr(a, bar)? && self.eval_expr(b, bar)?),
            Expr::Or(a, b) => Ok(self.eval_expr(a, bar)? || self.eval_expr(b, bar)?),
            Expr::Cmp(lhs, op, rhs) => {
                let l = self.resolve(lhs, bar)?;
                let r = self.resolve(rhs, bar)?;
                Ok(match op {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    CmpOp::Eq => l == r,
                    CmpOp::Ne => l != r,
                })
            }
        }
    }
}

impl ConditionEvaluator for PreparedCondition {
    fn evaluate(&self, bar: usize) -> std::result::Result<bool, EvalError> {
        self.eval_expr(&self.ast, bar)
    }
}

/// Parse `source` and bind it to `candles`, computing the indicator series
/// it references. Parse failures are configuration errors and surface
/// before the run.
pub fn prepare(source: &str, candles: &[Candle]) -> Result<PreparedCondition> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        indicators: Vec::new(),
    };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(QuantError::Config(format!(
            "condition '{source}': unexpected trailing input"
        )));
    }

    let mut series = Vec::with_capacity(parser.indicators.len());
    for (kind, period) in &parser.indicators {
        series.push(kind.compute(candles, *period)?);
    }

    Ok(PreparedCondition {
        ast,
        series,
        opens: candles.iter().map(|c| c.open).collect(),
        highs: candles.iter().map(|c| c.high).collect(),
        lows: candles.iter().map(|c| c.low).collect(),
        closes: candles.iter().map(|c| c.close).collect(),
        volumes: candles.iter().map(|c| c.volume).collect(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    LParen,
    RParen,
    Op(CmpOp),
    And,
    Or,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
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
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err(QuantError::Config(format!(
                        "condition '{source}': single '=' is not an operator"
                    )));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err(QuantError::Config(format!(
                        "condition '{source}': unexpected '!'"
                    )));
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(QuantError::Config(format!(
                        "condition '{source}': unexpected '&'"
                    )));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(QuantError::Config(format!(
                        "condition '{source}': unexpected '|'"
                    )));
                }
            }
            _ if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &source[start..i];
                let value: f64 = text.parse().map_err(|_| {
                    QuantError::Config(format!("condition '{source}': bad number '{text}'"))
                })?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &source[start..i];
                match word {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(word.to_string())),
                }
            }
            _ => {
                return Err(QuantError::Config(format!(
                    "condition '{source}': unexpected character '{c}'"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    indicators: Vec<(IndicatorKind, usize)>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Ident(word)) if word == "true" => {
                self.bump();
                Ok(Expr::Literal(true))
            }
            Some(Token::Ident(word)) if word == "false" => {
                self.bump();
                Ok(Expr::Literal(false))
            }
            Some(Token::LParen) => {
                // Either a parenthesized expression or the start of a
                // comparison whose lhs is parenthesized; the grammar only
                // allows the former.
                self.bump();
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(QuantError::Config("condition: missing ')'".to_string())),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_operand()?;
        let op = match self.bump() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(QuantError::Config(format!(
                    "condition: expected comparison operator, got {other:?}"
                )))
            }
        };
        let rhs = self.parse_operand()?;
        Ok(Expr::Cmp(lhs, op, rhs))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Operand::Number(n)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let kind = IndicatorKind::parse(&name).ok_or_else(|| {
                        QuantError::Config(format!("condition: unknown indicator '{name}'"))
                    })?;
                    self.bump();
                    let period = match self.bump() {
                        Some(Token::Number(n)) if n >= 1.0 && n.fract() == 0.0 => n as usize,
                        other => {
                            return Err(QuantError::Config(format!(
                                "condition: {name} expects an integer period, got {other:?}"
                            )))
                        }
                    };
                    if self.bump() != Some(Token::RParen) {
                        return Err(QuantError::Config(format!(
                            "condition: missing ')' after {name} period"
                        )));
                    }
                    let idx = self
                        .indicators
                        .iter()
                        .position(|entry| *entry == (kind, period))
                        .unwrap_or_else(|| {
                            self.indicators.push((kind, period));
                            self.indicators.len() - 1
                        });
                    Ok(Operand::Indicator(idx))
                } else if let Some(field) = PriceField::parse(&name) {
                    Ok(Operand::Field(field))
                } else {
                    Err(QuantError::Config(format!(
                        "condition: unknown identifier '{name}'"
                    )))
                }
            }
            other => Err(QuantError::Config(format!(
                "condition: expected operand, got {other:?}"
            ))),
        }
    }
}
