//! A small subset of JavaScript expressions, enough to evaluate event data expressions and
//! invocations without a script engine.
//!
//! Supported: `null`, `true`, `false`, number and string literals, `$0`-style parameters,
//! identifiers, member access (`a.b`), `typeof`, array literals, parentheses and a single
//! trailing property assignment (`$0.value = $1`).

use crate::error::DomError;
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
	Literal(Value),
	Parameter(usize),
	Identifier(String),
	Member(Box<Expression>, String),
	Typeof(Box<Expression>),
	Array(Vec<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
	Expression(Expression),
	Assign { target: Expression, property: String, value: Expression },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
	Number(f64),
	String(String),
	Parameter(usize),
	Identifier(String),
	Punctuation(char),
}

fn error(source: &str, reason: impl Into<String>) -> DomError {
	DomError::Expression {
		expression: source.to_owned(),
		reason: reason.into(),
	}
}

#[allow(clippy::too_many_lines)]
fn tokenize(source: &str) -> Result<Vec<Token>, DomError> {
	let mut tokens = vec![];
	let mut chars = source.char_indices().peekable();
	while let Some(&(start, c)) = chars.peek() {
		match c {
			c if c.is_whitespace() => {
				chars.next();
			}
			'.' | '[' | ']' | ',' | '=' | '(' | ')' | ';' => {
				chars.next();
				tokens.push(Token::Punctuation(c));
			}
			'$' => {
				chars.next();
				let mut digits = String::new();
				while let Some(&(_, d)) = chars.peek() {
					if !d.is_ascii_digit() {
						break;
					}
					digits.push(d);
					chars.next();
				}
				let index = digits.parse().map_err(|_| error(source, format!("Expected parameter index at {}", start)))?;
				tokens.push(Token::Parameter(index));
			}
			'"' | '\'' => {
				chars.next();
				let mut string = String::new();
				loop {
					match chars.next() {
						None => return Err(error(source, "Unterminated string literal")),
						Some((_, q)) if q == c => break,
						Some((_, '\\')) => match chars.next() {
							Some((_, 'n')) => string.push('\n'),
							Some((_, 't')) => string.push('\t'),
							Some((_, escaped)) => string.push(escaped),
							None => return Err(error(source, "Unterminated escape sequence")),
						},
						Some((_, other)) => string.push(other),
					}
				}
				tokens.push(Token::String(string));
			}
			c if c.is_ascii_digit() || c == '-' => {
				let mut end = start;
				chars.next();
				end += c.len_utf8();
				while let Some(&(i, d)) = chars.peek() {
					if !(d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E') {
						break;
					}
					end = i + d.len_utf8();
					chars.next();
				}
				let number = source[start..end].parse().map_err(|_| error(source, format!("Invalid number literal {:?}", &source[start..end])))?;
				tokens.push(Token::Number(number));
			}
			c if c.is_alphabetic() || c == '_' => {
				let mut identifier = String::new();
				while let Some(&(_, d)) = chars.peek() {
					if !(d.is_alphanumeric() || d == '_' || d == '$') {
						break;
					}
					identifier.push(d);
					chars.next();
				}
				tokens.push(Token::Identifier(identifier));
			}
			other => return Err(error(source, format!("Unexpected character {:?} at {}", other, start))),
		}
	}
	Ok(tokens)
}

struct Parser<'a> {
	source: &'a str,
	tokens: Vec<Token>,
	position: usize,
}

impl<'a> Parser<'a> {
	fn peek(&self) -> Option<&Token> {
		self.tokens.get(self.position)
	}

	fn next(&mut self) -> Option<Token> {
		let token = self.tokens.get(self.position).cloned();
		self.position += 1;
		token
	}

	fn eat(&mut self, punctuation: char) -> bool {
		if self.peek() == Some(&Token::Punctuation(punctuation)) {
			self.position += 1;
			true
		} else {
			false
		}
	}

	fn expect(&mut self, punctuation: char) -> Result<(), DomError> {
		if self.eat(punctuation) {
			Ok(())
		} else {
			Err(error(self.source, format!("Expected {:?}", punctuation)))
		}
	}

	fn statement(&mut self) -> Result<Statement, DomError> {
		let expression = self.expression()?;
		let statement = if self.eat('=') {
			let value = self.expression()?;
			match expression {
				Expression::Member(target, property) => Statement::Assign { target: *target, property, value },
				_ => return Err(error(self.source, "Only property assignments are supported")),
			}
		} else {
			Statement::Expression(expression)
		};
		self.eat(';');
		if self.position < self.tokens.len() {
			return Err(error(self.source, "Unexpected trailing input"));
		}
		Ok(statement)
	}

	fn expression(&mut self) -> Result<Expression, DomError> {
		if self.peek() == Some(&Token::Identifier("typeof".to_owned())) {
			self.position += 1;
			return Ok(Expression::Typeof(Box::new(self.expression()?)));
		}
		let mut expression = self.primary()?;
		while self.eat('.') {
			match self.next() {
				Some(Token::Identifier(name)) => expression = Expression::Member(Box::new(expression), name),
				_ => return Err(error(self.source, "Expected property name after '.'")),
			}
		}
		Ok(expression)
	}

	fn primary(&mut self) -> Result<Expression, DomError> {
		match self.next() {
			Some(Token::Number(number)) => Ok(Expression::Literal(number_value(number))),
			Some(Token::String(string)) => Ok(Expression::Literal(Value::String(string))),
			Some(Token::Parameter(index)) => Ok(Expression::Parameter(index)),
			Some(Token::Identifier(name)) => Ok(match name.as_str() {
				"null" => Expression::Literal(Value::Null),
				"true" => Expression::Literal(Value::Bool(true)),
				"false" => Expression::Literal(Value::Bool(false)),
				_ => Expression::Identifier(name),
			}),
			Some(Token::Punctuation('[')) => {
				let mut items = vec![];
				if !self.eat(']') {
					loop {
						items.push(self.expression()?);
						if self.eat(']') {
							break;
						}
						self.expect(',')?;
					}
				}
				Ok(Expression::Array(items))
			}
			Some(Token::Punctuation('(')) => {
				let expression = self.expression()?;
				self.expect(')')?;
				Ok(expression)
			}
			other => Err(error(self.source, format!("Unexpected token {:?}", other))),
		}
	}
}

/// Integers stay integers, like `JSON.stringify` prints them.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number_value(number: f64) -> Value {
	if number.fract() == 0.0 && number.abs() < 9_007_199_254_740_992.0 {
		Value::from(number as i64)
	} else {
		Number::from_f64(number).map_or(Value::Null, Value::Number)
	}
}

/// # Errors
///
/// Iff `source` isn't part of the supported subset.
pub fn parse(source: &str) -> Result<Statement, DomError> {
	Parser {
		source,
		tokens: tokenize(source)?,
		position: 0,
	}
	.statement()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn assignment() {
		assert_eq!(
			parse("$0.foobarProperty=$1").unwrap(),
			Statement::Assign {
				target: Expression::Parameter(0),
				property: "foobarProperty".to_owned(),
				value: Expression::Parameter(1),
			}
		);
	}

	#[test]
	fn array_of_typeof_and_member() {
		assert_eq!(
			parse("[typeof event, element.tagName]").unwrap(),
			Statement::Expression(Expression::Array(vec![
				Expression::Typeof(Box::new(Expression::Identifier("event".to_owned()))),
				Expression::Member(Box::new(Expression::Identifier("element".to_owned())), "tagName".to_owned()),
			]))
		);
	}

	#[test]
	fn literals() {
		assert_eq!(
			parse("['a', \"b\", 1, 1.5, -2, null, true]").unwrap(),
			Statement::Expression(Expression::Array(vec![
				Expression::Literal(Value::from("a")),
				Expression::Literal(Value::from("b")),
				Expression::Literal(Value::from(1)),
				Expression::Literal(Value::from(1.5)),
				Expression::Literal(Value::from(-2)),
				Expression::Literal(Value::Null),
				Expression::Literal(Value::Bool(true)),
			]))
		);
	}

	#[test]
	fn rejects_calls() {
		assert!(parse("alert(1)").is_err());
		assert!(parse("a = 1").is_err());
	}
}
