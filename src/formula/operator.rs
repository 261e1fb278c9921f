//! Binary operators of the formula language

use std::fmt;

use super::Value;
use crate::error::{ModbusError, ModbusResult};

/// Characters that start or continue an operator token
pub const OPERATOR_SYMBOLS: &[char] = &['+', '-', '*', '/', '<', '=', '>'];

/// Binding tier of an operator, tightest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    NonLinear,
    Linear,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Plus,
    Minus,
    Multiply,
    Divide,
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl Operator {
    /// Look up a complete operator token
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "+" => Some(Operator::Plus),
            "-" => Some(Operator::Minus),
            "*" => Some(Operator::Multiply),
            "/" => Some(Operator::Divide),
            "==" => Some(Operator::Equal),
            ">" => Some(Operator::Greater),
            ">=" => Some(Operator::GreaterOrEqual),
            "<" => Some(Operator::Less),
            "<=" => Some(Operator::LessOrEqual),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Multiply => "*",
            Operator::Divide => "/",
            Operator::Equal => "==",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
        }
    }

    pub fn priority(self) -> Priority {
        match self {
            Operator::Multiply | Operator::Divide => Priority::NonLinear,
            Operator::Plus | Operator::Minus => Priority::Linear,
            _ => Priority::Boolean,
        }
    }

    /// Apply the operator to two evaluated operands
    ///
    /// Arithmetic and ordering need two numbers. `==` accepts two numbers or
    /// two booleans; anything else is a type mismatch.
    pub fn apply(self, left: Value, right: Value) -> ModbusResult<Value> {
        if self == Operator::Equal {
            return match (left, right) {
                (Value::Number(l), Value::Number(r)) => Ok(Value::Bool(l == r)),
                (Value::Bool(l), Value::Bool(r)) => Ok(Value::Bool(l == r)),
                (l, r) => Err(self.mismatch(l, r)),
            };
        }

        let (l, r) = match (left, right) {
            (Value::Number(l), Value::Number(r)) => (l, r),
            (l, r) => return Err(self.mismatch(l, r)),
        };
        Ok(match self {
            Operator::Plus => Value::Number(l + r),
            Operator::Minus => Value::Number(l - r),
            Operator::Multiply => Value::Number(l * r),
            Operator::Divide => Value::Number(l / r),
            Operator::Greater => Value::Bool(l > r),
            Operator::GreaterOrEqual => Value::Bool(l >= r),
            Operator::Less => Value::Bool(l < r),
            Operator::LessOrEqual => Value::Bool(l <= r),
            Operator::Equal => Value::Bool(l == r),
        })
    }

    fn mismatch(self, left: Value, right: Value) -> ModbusError {
        ModbusError::type_mismatch(self.symbol(), left.to_string(), right.to_string())
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}
