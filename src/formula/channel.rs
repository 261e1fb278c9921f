//! Channel value conversion through read, write and danger formulas
//!
//! The raw or engineering value of a channel is bound to [`VALUE_VARIABLE`].

use super::{Formula, Value};
use crate::error::ModbusResult;

/// Variable name carrying the channel value inside a formula
pub const VALUE_VARIABLE: &str = "${value}";

/// Round to `fraction_size` decimal places
pub fn round_to_fraction(value: f64, fraction_size: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(fraction_size.min(15) as i32);
    (value * factor).round() / factor
}

/// Raw register value -> engineering value
///
/// Without a read formula the raw value passes through. The result is
/// rounded to the channel's fraction size either way.
pub fn read_value(formula: Option<&Formula>, raw: f64, fraction_size: u32) -> ModbusResult<f64> {
    let value = match formula {
        Some(formula) => formula.calculate_number(&[(VALUE_VARIABLE, Value::Number(raw))])?,
        None => raw,
    };
    Ok(round_to_fraction(value, fraction_size))
}

/// Engineering value -> value written to the device
pub fn write_value(formula: Option<&Formula>, value: f64) -> ModbusResult<f64> {
    match formula {
        Some(formula) => formula.calculate_number(&[(VALUE_VARIABLE, Value::Number(value))]),
        None => Ok(value),
    }
}

/// Evaluate a danger condition against the engineering value
pub fn is_dangerous(formula: &Formula, value: f64) -> ModbusResult<bool> {
    formula.calculate_bool(&[(VALUE_VARIABLE, Value::Number(value))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_value_scales_and_rounds() {
        let formula = Formula::parse("${value} / 3").unwrap();
        assert_eq!(read_value(Some(&formula), 10.0, 2).unwrap(), 3.33);
        assert_eq!(read_value(None, 1.26, 1).unwrap(), 1.3);
        assert_eq!(read_value(None, 7.0, 0).unwrap(), 7.0);
    }

    #[test]
    fn test_write_value() {
        let formula = Formula::parse("${value} * 10").unwrap();
        assert_eq!(write_value(Some(&formula), 2.5).unwrap(), 25.0);
        assert_eq!(write_value(None, 2.5).unwrap(), 2.5);
    }

    #[test]
    fn test_formula_errors_surface() {
        let formula = Formula::parse("${value} > 3").unwrap();
        assert!(read_value(Some(&formula), 10.0, 0).is_err());
        assert!(is_dangerous(&formula, 4.0).unwrap());
        assert!(!is_dangerous(&formula, 2.0).unwrap());

        let formula = Formula::parse("missing + 1").unwrap();
        assert!(write_value(Some(&formula), 1.0).is_err());
    }
}
