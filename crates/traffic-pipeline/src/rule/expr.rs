//! `custom_scoring` expressions: `field op number`.
//!
//! Fields: `duration_ms`, `status_code`, `prompt_length`, `response_length`,
//! and numeric metadata as `metadata.<key>` or a bare key. Operators:
//! `>`, `<`, `>=`, `<=`, `==`. A field absent from the record never matches.

use std::fmt;

use promptwatch_core::types::TrafficRecord;

/// Two-character operators are listed first so `>=` is not read as `>`.
const OPERATORS: &[(&str, CompareOp)] = &[
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    ("==", CompareOp::Eq),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreField {
    DurationMs,
    StatusCode,
    /// Prompt length in characters.
    PromptLength,
    /// Response length in characters; absent when there is no response.
    ResponseLength,
    Metadata(String),
}

impl ScoreField {
    fn parse(raw: &str) -> Result<Self, String> {
        let name = raw.trim();
        if name.is_empty() {
            return Err("missing field name".to_owned());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(format!("invalid field name '{name}'"));
        }
        Ok(match name {
            "duration_ms" => Self::DurationMs,
            "status_code" => Self::StatusCode,
            "prompt_length" => Self::PromptLength,
            "response_length" => Self::ResponseLength,
            other => {
                let key = other.strip_prefix("metadata.").unwrap_or(other);
                if key.is_empty() {
                    return Err("empty metadata key".to_owned());
                }
                Self::Metadata(key.to_owned())
            }
        })
    }

    fn value(&self, record: &TrafficRecord) -> Option<f64> {
        match self {
            Self::DurationMs => record.duration_ms.map(|v| v as f64),
            Self::StatusCode => record.status_code.map(f64::from),
            Self::PromptLength => Some(record.prompt.chars().count() as f64),
            Self::ResponseLength => record.response.as_ref().map(|r| r.chars().count() as f64),
            Self::Metadata(key) => record.metadata_number(key),
        }
    }
}

impl fmt::Display for ScoreField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationMs => f.write_str("duration_ms"),
            Self::StatusCode => f.write_str("status_code"),
            Self::PromptLength => f.write_str("prompt_length"),
            Self::ResponseLength => f.write_str("response_length"),
            Self::Metadata(key) => write!(f, "metadata.{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl CompareOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
        }
    }
}

/// A parsed comparison, evaluated against one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreExpr {
    pub field: ScoreField,
    pub op: CompareOp,
    pub value: f64,
}

impl ScoreExpr {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (idx, symbol, op) = OPERATORS
            .iter()
            .find_map(|(symbol, op)| raw.find(symbol).map(|idx| (idx, *symbol, *op)))
            .ok_or_else(|| format!("no comparison operator in '{raw}'"))?;

        let field = ScoreField::parse(&raw[..idx])?;
        let literal = raw[idx + symbol.len()..].trim();
        let value: f64 = literal
            .parse()
            .map_err(|_| format!("'{literal}' is not a number"))?;
        if !value.is_finite() {
            return Err(format!("'{literal}' is not a finite number"));
        }

        Ok(Self { field, op, value })
    }

    pub fn evaluate(&self, record: &TrafficRecord) -> bool {
        self.field
            .value(record)
            .is_some_and(|lhs| self.op.apply(lhs, self.value))
    }
}

impl fmt::Display for ScoreExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.symbol(), self.value)
    }
}
