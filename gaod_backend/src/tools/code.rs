//! Capability-limited expression evaluator behind `[EXECUTE_CODE: ...]`.
//!
//! Arithmetic, comparisons and boolean logic over numbers and `true`/`false`,
//! plus a handful of pure math functions. There are no variables, no
//! assignment, and nothing that can reach the environment.

use std::fmt;

use anyhow::{anyhow, bail, Result};

const MAX_EXPRESSION_LEN: usize = 2_000;
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn as_number(self) -> Result<f64> {
        match self {
            Value::Number(n) => Ok(n),
            Value::Bool(_) => Err(anyhow!("expected a number, found a boolean")),
        }
    }

    /// `true` and `false` read as 1 and 0.
    fn to_number(self) -> f64 {
        match self {
            Value::Number(n) => n,
            Value::Bool(b) => f64::from(u8::from(b)),
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Number(n) => n != 0.0 && !n.is_nan(),
            Value::Bool(b) => b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) if *n != 0.0 && (n.abs() >= 1e21 || n.abs() < 1e-6) => {
                let formatted = format!("{:e}", n);
                match formatted.split_once('e') {
                    Some((mantissa, exp)) if !exp.starts_with('-') => {
                        write!(f, "{}e+{}", mantissa, exp)
                    }
                    _ => f.write_str(&formatted),
                }
            }
            Value::Number(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 19] = [
    "===", "!==", "**", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">",
    "!", "(", ")",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let number = literal
                .parse::<f64>()
                .map_err(|_| anyhow!("invalid number '{}'", literal))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(ident));
            continue;
        }

        if c == ',' {
            tokens.push(Token::Comma);
            i += 1;
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            bail!("unexpected character '{}'", c);
        };
        i += op.chars().count();
        tokens.push(match *op {
            "(" => Token::LParen,
            ")" => Token::RParen,
            other => Token::Op(other),
        });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            bail!("expression nested too deeply");
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Value> {
        self.enter()?;
        let value = self.or();
        self.depth -= 1;
        value
    }

    fn or(&mut self) -> Result<Value> {
        let mut left = self.and()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.and()?;
            left = if left.truthy() { left } else { right };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value> {
        let mut left = self.equality()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.equality()?;
            left = if left.truthy() { right } else { left };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Value> {
        let mut left = self.comparison()?;
        while let Some(op @ ("==" | "!=" | "===" | "!==")) = self.peek_op() {
            self.pos += 1;
            let right = self.comparison()?;
            let equal = match op {
                "==" | "!=" => left.to_number() == right.to_number(),
                _ => left == right,
            };
            left = Value::Bool(if op.starts_with('!') { !equal } else { equal });
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value> {
        let mut left = self.additive()?;
        while let Some(op @ ("<" | "<=" | ">" | ">=")) = self.peek_op() {
            self.pos += 1;
            let a = left.as_number()?;
            let b = self.additive()?.as_number()?;
            left = Value::Bool(match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            });
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Value> {
        let mut left = self.multiplicative()?;
        while let Some(op @ ("+" | "-")) = self.peek_op() {
            self.pos += 1;
            let a = left.as_number()?;
            let b = self.multiplicative()?.as_number()?;
            left = Value::Number(if op == "+" { a + b } else { a - b });
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        while let Some(op @ ("*" | "/" | "%")) = self.peek_op() {
            self.pos += 1;
            let a = left.as_number()?;
            let b = self.unary()?.as_number()?;
            left = Value::Number(match op {
                "*" => a * b,
                _ if b == 0.0 => bail!("division by zero"),
                "/" => a / b,
                _ => a % b,
            });
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                self.enter()?;
                let value = self.unary()?.as_number();
                self.depth -= 1;
                Ok(Value::Number(-value?))
            }
            Some("+") => {
                self.pos += 1;
                self.enter()?;
                let value = self.unary()?.as_number();
                self.depth -= 1;
                Ok(Value::Number(value?))
            }
            Some("!") => {
                self.pos += 1;
                self.enter()?;
                let value = self.unary();
                self.depth -= 1;
                Ok(Value::Bool(!value?.truthy()))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Value> {
        let base = self.primary()?;
        if self.peek_op() == Some("**") {
            self.pos += 1;
            self.enter()?;
            let exponent = self.unary();
            self.depth -= 1;
            return Ok(Value::Number(base.as_number()?.powf(exponent?.as_number()?)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => bail!("expected ')'"),
                }
            }
            Some(Token::Ident(name)) => self.identifier(&name),
            Some(Token::RParen) => bail!("unexpected ')'"),
            Some(Token::Comma) => bail!("unexpected ','"),
            Some(Token::Op(op)) => bail!("unexpected operator '{}'", op),
            None => bail!("unexpected end of expression"),
        }
    }

    fn identifier(&mut self, raw: &str) -> Result<Value> {
        let name = raw.strip_prefix("Math.").unwrap_or(raw);
        match name {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "PI" => return Ok(Value::Number(std::f64::consts::PI)),
            "E" => return Ok(Value::Number(std::f64::consts::E)),
            _ => {}
        }

        if self.tokens.get(self.pos) != Some(&Token::LParen) {
            bail!("unknown identifier '{}'", raw);
        }
        self.pos += 1;
        let args = self.arguments()?;
        call_function(name, &args).map_err(|e| anyhow!("{}: {}", raw, e))
    }

    fn arguments(&mut self) -> Result<Vec<f64>> {
        let mut args = Vec::new();
        if self.tokens.get(self.pos) == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?.as_number()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => bail!("expected ',' or ')' in argument list"),
            }
        }
    }
}

fn call_function(name: &str, args: &[f64]) -> Result<Value> {
    let unary = |f: fn(f64) -> f64| -> Result<Value> {
        match args {
            [x] => Ok(Value::Number(f(*x))),
            _ => bail!("expected 1 argument, got {}", args.len()),
        }
    };

    match name {
        "sqrt" => unary(f64::sqrt),
        "abs" => unary(f64::abs),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        // Half-way cases round up, as in JavaScript
        "round" => unary(|x| (x + 0.5).floor()),
        "pow" => match args {
            [base, exponent] => Ok(Value::Number(base.powf(*exponent))),
            _ => bail!("expected 2 arguments, got {}", args.len()),
        },
        "min" | "max" => {
            if args.is_empty() {
                bail!("expected at least 1 argument");
            }
            let pick = if name == "min" { f64::min } else { f64::max };
            Ok(Value::Number(args[1..].iter().fold(args[0], |acc, x| pick(acc, *x))))
        }
        other => bail!("unknown function '{}'", other),
    }
}

/// Evaluate one expression.
pub fn evaluate(expression: &str) -> Result<Value> {
    let expression = expression.trim();
    if expression.is_empty() {
        bail!("empty expression");
    }
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        bail!("expression too long (max {} chars)", MAX_EXPRESSION_LEN);
    }

    let mut parser = Parser {
        tokens: tokenize(expression)?,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if let Some(token) = parser.tokens.get(parser.pos) {
        bail!("unexpected trailing input at {:?}", token);
    }
    if let Value::Number(n) = value {
        if !n.is_finite() {
            bail!("result is not a finite number");
        }
    }
    Ok(value)
}

/// Evaluate and render the result the way it is shown in a reply.
pub fn evaluate_to_string(expression: &str) -> Result<String> {
    evaluate(expression).map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> String {
        evaluate_to_string(expr).unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("2+2"), "4");
        assert_eq!(eval("10*10"), "100");
        assert_eq!(eval("2 + 3 * 4"), "14");
        assert_eq!(eval("(2 + 3) * 4"), "20");
        assert_eq!(eval("7 / 2"), "3.5");
        assert_eq!(eval("17 % 5"), "2");
        assert_eq!(eval("-3 + 1"), "-2");
        assert_eq!(eval("1.5e3"), "1500");
    }

    #[test]
    fn exponent_is_right_associative() {
        assert_eq!(eval("2 ** 3 ** 2"), "512");
        assert_eq!(eval("2 ** -1"), "0.5");
    }

    #[test]
    fn logic_and_comparisons() {
        assert_eq!(eval("3 > 2 && 1 == 1"), "true");
        assert_eq!(eval("!(1 < 2)"), "false");
        assert_eq!(eval("false || 5"), "5");
        assert_eq!(eval("2 === 2"), "true");
        assert_eq!(eval("true != false"), "true");
    }

    #[test]
    fn loose_equality_coerces_booleans() {
        assert_eq!(eval("1 == true"), "true");
        assert_eq!(eval("0 != false"), "false");
        assert_eq!(eval("1 === true"), "false");
        assert_eq!(eval("1 !== true"), "true");
    }

    #[test]
    fn extreme_magnitudes_use_exponent_notation() {
        assert_eq!(eval("1e21"), "1e+21");
        assert_eq!(eval("1.5e300"), "1.5e+300");
        assert_eq!(eval("1e-7"), "1e-7");
        assert_eq!(eval("2e20"), "200000000000000000000");
        assert_eq!(eval("0.000001"), "0.000001");
    }

    #[test]
    fn functions_and_constants() {
        assert_eq!(eval("sqrt(16)"), "4");
        assert_eq!(eval("Math.max(1, 9, 3)"), "9");
        assert_eq!(eval("min(4, -2)"), "-2");
        assert_eq!(eval("pow(2, 10)"), "1024");
        assert_eq!(eval("round(2.5)"), "3");
        assert_eq!(eval("floor(PI)"), "3");
        assert_eq!(eval("ceil(E)"), "3");
    }

    #[test]
    fn rejects_invalid_input() {
        for bad in [
            "",
            "2 +",
            "1 / 0",
            "5 % 0",
            "alert(1)",
            "x + 1",
            "process.exit()",
            "(1 + 2",
            "1 2",
            "sqrt(-1)",
            "true + 1",
            "\"hello\"",
            "pow(2)",
        ] {
            assert!(evaluate(bad).is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let nested = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        assert!(evaluate(&nested).is_err());
        let negated = format!("{}1", "-".repeat(500));
        assert!(evaluate(&negated).is_err());
    }
}
