//! Expression tree and parser
//!
//! Parsing happens in two passes. The first pass splits the text into an
//! alternating run of operands and operators, recursing into parenthesised
//! groups. The second pass orders the operators by [`Priority`] (stable, so
//! operators of one tier keep their left to right order) and links them into a
//! tree through a marker table that maps each operand slot to the operator
//! currently owning it.

use std::collections::HashMap;

use super::operator::{Operator, OPERATOR_SYMBOLS};
use super::Value;
use crate::error::{ModbusError, ModbusResult};

/// Parsed expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Variable(String),
    Binary {
        operator: Operator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Parse expression text
    pub fn parse(text: &str) -> ModbusResult<Self> {
        let chars: Vec<char> = text.chars().collect();
        let (operands, operators) = tokenize(text, &chars)?;
        link(text, operands, operators)
    }

    /// Evaluate against a variable resolver
    pub fn evaluate<F>(&self, resolve: &F) -> ModbusResult<Value>
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Expression::Literal(value) => Ok(*value),
            Expression::Variable(name) => {
                resolve(name).ok_or_else(|| ModbusError::unknown_variable(name.as_str()))
            }
            Expression::Binary { operator, left, right } => {
                let left = left.evaluate(resolve)?;
                let right = right.evaluate(resolve)?;
                operator.apply(left, right)
            }
        }
    }

    /// Names of every variable referenced by the expression
    pub fn variable_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Variable(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Expression::Binary { left, right, .. } => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
        }
    }
}

fn is_operator_symbol(ch: char) -> bool {
    OPERATOR_SYMBOLS.contains(&ch)
}

/// Classify a literal token: number, boolean, otherwise variable name
fn classify(token: &str) -> Expression {
    let numeric_start = token
        .trim_start_matches('-')
        .starts_with(|c: char| c.is_ascii_digit() || c == '.');
    if numeric_start {
        if let Ok(number) = token.parse::<f64>() {
            return Expression::Literal(Value::Number(number));
        }
    }
    match token {
        "true" => Expression::Literal(Value::Bool(true)),
        "false" => Expression::Literal(Value::Bool(false)),
        _ => Expression::Variable(token.to_string()),
    }
}

struct Tokenizer<'a> {
    text: &'a str,
    operands: Vec<Expression>,
    operators: Vec<Operator>,
    operand_token: String,
    operator_token: String,
}

impl<'a> Tokenizer<'a> {
    fn error(&self, message: impl Into<String>) -> ModbusError {
        ModbusError::formula(self.text, message)
    }

    fn expects_operand(&self) -> bool {
        self.operand_token.is_empty() && self.operators.len() == self.operands.len()
    }

    /// The pending operand is a number waiting for its exponent, as in "1e-3"
    fn in_exponent(&self) -> bool {
        let token = self.operand_token.trim_start_matches('-');
        token.starts_with(|c: char| c.is_ascii_digit() || c == '.') && token.ends_with(['e', 'E'])
    }

    fn push_operand(&mut self, operand: Expression) -> ModbusResult<()> {
        if self.operands.len() != self.operators.len() {
            return Err(self.error("missing operator between operands"));
        }
        self.operands.push(operand);
        Ok(())
    }

    fn close_operand(&mut self) -> ModbusResult<()> {
        if self.operand_token.is_empty() {
            return Ok(());
        }
        let token = std::mem::take(&mut self.operand_token);
        self.push_operand(classify(&token))
    }

    fn close_operator(&mut self) -> ModbusResult<()> {
        if self.operator_token.is_empty() {
            return Ok(());
        }
        let token = std::mem::take(&mut self.operator_token);
        let operator = Operator::from_symbol(&token)
            .ok_or_else(|| self.error(format!("unknown operator '{}'", token)))?;
        if self.operands.len() != self.operators.len() + 1 {
            return Err(self.error(format!("operator '{}' has no left operand", token)));
        }
        self.operators.push(operator);
        Ok(())
    }
}

fn tokenize(text: &str, chars: &[char]) -> ModbusResult<(Vec<Expression>, Vec<Operator>)> {
    let mut tokenizer = Tokenizer {
        text,
        operands: Vec::new(),
        operators: Vec::new(),
        operand_token: String::new(),
        operator_token: String::new(),
    };

    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        let next_is_digit = chars
            .get(index + 1)
            .map_or(false, |c| c.is_ascii_digit() || *c == '.');

        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        if (ch == '-' || ch == '+') && next_is_digit && tokenizer.in_exponent() {
            tokenizer.operand_token.push(ch);
            index += 1;
            continue;
        }

        if ch == '-' && next_is_digit && !tokenizer.operator_token.is_empty() {
            // "a*-1": the pending operator is complete, the minus signs the literal
            tokenizer.close_operator()?;
        }

        if is_operator_symbol(ch) && !(ch == '-' && next_is_digit && tokenizer.expects_operand()) {
            tokenizer.close_operand()?;
            tokenizer.operator_token.push(ch);
            index += 1;
            continue;
        }

        tokenizer.close_operator()?;
        match ch {
            '(' => {
                if !tokenizer.operand_token.is_empty() {
                    return Err(tokenizer.error("missing operator before '('"));
                }
                let close = matching_paren(chars, index)
                    .ok_or_else(|| tokenizer.error("unbalanced parentheses"))?;
                let inner: String = chars[index + 1..close].iter().collect();
                let nested = Expression::parse(&inner)?;
                tokenizer.push_operand(nested)?;
                index = close;
            }
            ')' => return Err(tokenizer.error("unbalanced parentheses")),
            _ => tokenizer.operand_token.push(ch),
        }
        index += 1;
    }

    tokenizer.close_operand()?;
    if !tokenizer.operator_token.is_empty() {
        return Err(tokenizer.error(format!(
            "operator '{}' has no right operand",
            tokenizer.operator_token
        )));
    }
    if tokenizer.operands.is_empty() {
        return Err(tokenizer.error("empty expression"));
    }

    Ok((tokenizer.operands, tokenizer.operators))
}

fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, ch) in chars[open..].iter().enumerate() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Build the tree from `operands[i] operators[i] operands[i + 1] ...`
fn link(text: &str, operands: Vec<Expression>, operators: Vec<Operator>) -> ModbusResult<Expression> {
    if operators.is_empty() {
        return operands
            .into_iter()
            .next()
            .ok_or_else(|| ModbusError::formula(text, "empty expression"));
    }

    let mut order: Vec<usize> = (0..operators.len()).collect();
    order.sort_by_key(|&index| operators[index].priority());

    let mut operands: Vec<Option<Expression>> = operands.into_iter().map(Some).collect();
    let mut built: Vec<Option<Expression>> = vec![None; operators.len()];
    // operand slot -> operator node that currently owns it
    let mut markers: HashMap<usize, usize> = HashMap::new();

    for &current in &order {
        let mut sides = Vec::with_capacity(2);
        for slot in [current, current + 1] {
            let side = match markers.get(&slot).copied() {
                Some(owner) => {
                    for marker in markers.values_mut() {
                        if *marker == owner {
                            *marker = current;
                        }
                    }
                    built[owner].take()
                }
                None => {
                    markers.insert(slot, current);
                    operands[slot].take()
                }
            };
            sides.push(side.ok_or_else(|| ModbusError::internal(format!("formula '{}' linked twice", text)))?);
        }

        let right = sides.pop();
        let left = sides.pop();
        if let (Some(left), Some(right)) = (left, right) {
            built[current] = Some(Expression::Binary {
                operator: operators[current],
                left: Box::new(left),
                right: Box::new(right),
            });
        }
    }

    order
        .last()
        .and_then(|&root| built[root].take())
        .ok_or_else(|| ModbusError::internal(format!("formula '{}' has no root", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(value: f64) -> Box<Expression> {
        Box::new(Expression::Literal(Value::Number(value)))
    }

    #[test]
    fn test_precedence_builds_tree() {
        let expression = Expression::parse("2+3*4").unwrap();
        assert_eq!(
            expression,
            Expression::Binary {
                operator: Operator::Plus,
                left: number(2.0),
                right: Box::new(Expression::Binary {
                    operator: Operator::Multiply,
                    left: number(3.0),
                    right: number(4.0),
                }),
            }
        );
    }

    #[test]
    fn test_same_tier_is_left_to_right() {
        let expression = Expression::parse("10-4-3").unwrap();
        assert_eq!(expression.evaluate(&|_| None).unwrap(), Value::Number(3.0));

        let expression = Expression::parse("8/4*2").unwrap();
        assert_eq!(expression.evaluate(&|_| None).unwrap(), Value::Number(4.0));
    }

    #[test]
    fn test_parentheses_and_negatives() {
        let expression = Expression::parse("(1 + 2) * -3").unwrap();
        assert_eq!(expression.evaluate(&|_| None).unwrap(), Value::Number(-9.0));

        let expression = Expression::parse("-2 + ((4))").unwrap();
        assert_eq!(expression.evaluate(&|_| None).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_exponent_literals() {
        let expression = Expression::parse("1e-3 * 1000").unwrap();
        assert_eq!(expression.evaluate(&|_| None).unwrap(), Value::Number(1.0));

        let expression = Expression::parse("2.5E+2-1e2").unwrap();
        assert_eq!(expression.evaluate(&|_| None).unwrap(), Value::Number(150.0));

        // a name ending in e still subtracts
        let expression = Expression::parse("rate-3").unwrap();
        let rate = |name: &str| (name == "rate").then_some(Value::Number(5.0));
        assert_eq!(expression.evaluate(&rate).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_literal_classification() {
        assert_eq!(classify("1.5"), Expression::Literal(Value::Number(1.5)));
        assert_eq!(classify("false"), Expression::Literal(Value::Bool(false)));
        assert_eq!(classify("nan"), Expression::Variable("nan".to_string()));
        assert_eq!(classify("${value}"), Expression::Variable("${value}".to_string()));
    }

    #[test]
    fn test_parse_errors() {
        for text in ["", "1+", "*2", "1 = 2", "(1+2", "1+2)", "a(b)", "(a)(b)"] {
            assert!(
                matches!(Expression::parse(text), Err(ModbusError::Formula { .. })),
                "expected parse error for {:?}",
                text
            );
        }
    }

    #[test]
    fn test_variable_names() {
        let expression = Expression::parse("a * b + a > c").unwrap();
        assert_eq!(expression.variable_names(), vec!["a", "b", "c"]);
    }
}
