//! # Formula Engine
//!
//! Small arithmetic/boolean expressions that turn raw register values into
//! engineering units and evaluate danger conditions.
//!
//! ```rust
//! use voltage_poll::formula::{Formula, Value};
//!
//! let formula = Formula::parse("2+3*4").unwrap();
//! assert_eq!(formula.calculate().unwrap(), Value::Number(14.0));
//!
//! let mut formula = Formula::parse("a>b").unwrap();
//! formula.set_variable("a", 5.0);
//! formula.set_variable("b", 3.0);
//! assert_eq!(formula.calculate().unwrap(), Value::Bool(true));
//! ```
//!
//! Operators bind in three tiers: `*` `/` first, then `+` `-`, then the
//! comparisons `==` `>` `>=` `<` `<=`. Inside a tier evaluation runs left to
//! right. Parentheses group sub-expressions. Operands are numbers, `true` /
//! `false`, or variable names resolved at evaluation time.

pub mod channel;
pub mod expression;
pub mod operator;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ModbusError, ModbusResult};

pub use expression::Expression;
pub use operator::{Operator, Priority};

/// Value of an operand or a variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(number),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::Bool(flag) => Some(flag),
            Value::Number(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(number) => write!(f, "{}", number),
            Value::Bool(flag) => write!(f, "{}", flag),
        }
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Number(number)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

/// Parsed expression plus its variable bindings
///
/// The tree never changes after parsing. Bindings can be replaced between
/// evaluations, or supplied per call with [`calculate_with`](Self::calculate_with)
/// which leaves the stored bindings untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    text: String,
    root: Expression,
    variables: HashMap<String, Value>,
}

impl Formula {
    pub fn parse(text: &str) -> ModbusResult<Self> {
        Ok(Self {
            text: text.to_string(),
            root: Expression::parse(text)?,
            variables: HashMap::new(),
        })
    }

    /// Source text
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &Expression {
        &self.root
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.variables
    }

    pub fn set_variable<V: Into<Value>>(&mut self, name: &str, value: V) {
        self.variables.insert(name.to_string(), value.into());
    }

    /// Builder form of [`set_variable`](Self::set_variable)
    pub fn with_variable<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.set_variable(name, value);
        self
    }

    /// Evaluate with the stored bindings
    pub fn calculate(&self) -> ModbusResult<Value> {
        self.root.evaluate(&|name: &str| self.variables.get(name).copied())
    }

    /// Evaluate with extra bindings that shadow the stored ones
    pub fn calculate_with(&self, bindings: &[(&str, Value)]) -> ModbusResult<Value> {
        self.root.evaluate(&|name: &str| {
            bindings
                .iter()
                .find(|(bound, _)| *bound == name)
                .map(|(_, value)| *value)
                .or_else(|| self.variables.get(name).copied())
        })
    }

    /// Evaluate and require a numeric result
    pub fn calculate_number(&self, bindings: &[(&str, Value)]) -> ModbusResult<f64> {
        let value = self.calculate_with(bindings)?;
        value
            .as_number()
            .ok_or_else(|| ModbusError::formula(self.text.as_str(), format!("expected a number, got {}", value)))
    }

    /// Evaluate and require a boolean result
    pub fn calculate_bool(&self, bindings: &[(&str, Value)]) -> ModbusResult<bool> {
        let value = self.calculate_with(bindings)?;
        value
            .as_bool()
            .ok_or_else(|| ModbusError::formula(self.text.as_str(), format!("expected a boolean, got {}", value)))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Formula {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

impl Serialize for Formula {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Formula {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Formula::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplication_binds_tighter() {
        let formula = Formula::parse("2+3*4").unwrap();
        assert_eq!(formula.calculate().unwrap(), Value::Number(14.0));
    }

    #[test]
    fn test_comparison_with_variables() {
        let formula = Formula::parse("a>b")
            .unwrap()
            .with_variable("a", 5.0)
            .with_variable("b", 3.0);
        assert_eq!(formula.calculate().unwrap(), Value::Bool(true));

        let mut formula = formula;
        formula.set_variable("a", 1.0);
        assert_eq!(formula.calculate().unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_equal_rejects_mixed_types() {
        let formula = Formula::parse("a==b")
            .unwrap()
            .with_variable("a", 1.0)
            .with_variable("b", true);
        assert!(matches!(formula.calculate(), Err(ModbusError::TypeMismatch { .. })));

        let formula = Formula::parse("a==b")
            .unwrap()
            .with_variable("a", true)
            .with_variable("b", true);
        assert_eq!(formula.calculate().unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_comparison_is_loosest() {
        let formula = Formula::parse("1 + 2 * 3 >= 7").unwrap();
        assert_eq!(formula.calculate().unwrap(), Value::Bool(true));

        let formula = Formula::parse("(1 + 2) * 3 == 9").unwrap();
        assert_eq!(formula.calculate().unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_bindings_shadow_variables() {
        let formula = Formula::parse("${value} * k").unwrap().with_variable("k", 2.0);
        assert_eq!(
            formula.calculate_number(&[("${value}", Value::Number(21.0))]).unwrap(),
            42.0
        );
        assert!(matches!(formula.calculate(), Err(ModbusError::UnknownVariable { .. })));
        assert!(formula.calculate_bool(&[("${value}", Value::Number(1.0))]).is_err());
    }

    #[test]
    fn test_serde_as_text() {
        let formula: Formula = serde_json::from_str("\"${value} / 10\"").unwrap();
        assert_eq!(formula.text(), "${value} / 10");
        assert_eq!(serde_json::to_string(&formula).unwrap(), "\"${value} / 10\"");
        assert!(serde_json::from_str::<Formula>("\"1 +\"").is_err());
    }
}
