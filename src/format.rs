//! Decoding instrument replies into typed values.
//!
//! Instruments answer in untyped text. A [`Format`] turns that text into a
//! [`Value`]: a number, a vector, a matrix, a list of lines or plain text.
//! Formats are selected by name (`"strip"`, `"array"`, `"matrix"`,
//! `"number"`, `"none"`, `"auto"`) or supplied as a function with
//! [`Format::custom`].
//!
//! ```
//! use xtralien::format::{Format, Value};
//!
//! assert_eq!(Format::Auto.apply("[1,2;3,4]\n"), Value::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
//! assert_eq!(Format::Auto.apply("[1;2;3]"), Value::Array(vec![1.0, 2.0, 3.0]));
//! assert_eq!(Format::Auto.apply("3.14e-2"), Value::Number(0.0314));
//! ```

use crate::error::{ParseValueError, UnknownFormatError};
use regex::Regex;
use std::{fmt, str::FromStr, sync::Arc, sync::LazyLock};

/// A numeric literal: optional sign, digits, optional fraction, optional
/// exponent whose own fraction follows the same digit rule.
const NUMBER: &str = r"[+-]?[0-9]+(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+(?:\.[0-9]+)?)?";

static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| compile(&format!("^{NUMBER}$")));

/// Bracketed, `;` separated rows of `,` separated numbers.
static RE_MATRIX: LazyLock<Regex> = LazyLock::new(|| {
	let row = format!(r"{NUMBER}(?:\s*,\s*{NUMBER})+");
	compile(&format!(r"^\[\s*{row}(?:\s*;\s*{row})*\s*;?\s*\]$"))
});

/// Bracketed, `;` separated numbers.
static RE_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
	compile(&format!(
		r"^\[\s*{NUMBER}(?:\s*;\s*{NUMBER})*\s*;?\s*\]$"
	))
});

/// Compile one of the fixed patterns above.
fn compile(pattern: &str) -> Regex {
	Regex::new(pattern).expect("fixed response pattern is valid")
}

/// The characters removed by the `strip` format.
fn is_strip_char(c: char) -> bool {
	c.is_whitespace() || matches!(c, '[' | ']' | ';')
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
	/// No reply, either because none was requested or because the command
	/// could not be dispatched.
	#[default]
	None,
	/// Plain text.
	Text(String),
	/// A single number.
	Number(f64),
	/// A vector of numbers.
	Array(Vec<f64>),
	/// Rows of numbers.
	Matrix(Vec<Vec<f64>>),
	/// A multi-line reply, one entry per non-empty line.
	Lines(Vec<String>),
}

impl Value {
	/// Whether this is [`Value::None`].
	pub fn is_none(&self) -> bool {
		matches!(self, Value::None)
	}

	/// The text, if this is [`Value::Text`].
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Text(text) => Some(text),
			_ => None,
		}
	}

	/// The number, if this is [`Value::Number`].
	pub fn as_number(&self) -> Option<f64> {
		match self {
			Value::Number(number) => Some(*number),
			_ => None,
		}
	}

	/// The numbers, if this is [`Value::Array`].
	pub fn as_array(&self) -> Option<&[f64]> {
		match self {
			Value::Array(values) => Some(values),
			_ => None,
		}
	}

	/// The rows, if this is [`Value::Matrix`].
	pub fn as_matrix(&self) -> Option<&[Vec<f64>]> {
		match self {
			Value::Matrix(rows) => Some(rows),
			_ => None,
		}
	}

	/// The lines, if this is [`Value::Lines`].
	pub fn as_lines(&self) -> Option<&[String]> {
		match self {
			Value::Lines(lines) => Some(lines),
			_ => None,
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		/// Write `items` separated by `sep`.
		fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
			for (i, item) in items.iter().enumerate() {
				if i > 0 {
					f.write_str(sep)?;
				}
				write!(f, "{item}")?;
			}
			Ok(())
		}

		match self {
			Value::None => Ok(()),
			Value::Text(text) => f.write_str(text),
			Value::Number(number) => write!(f, "{number}"),
			Value::Array(values) => {
				f.write_str("[")?;
				join(f, values, ";")?;
				f.write_str("]")
			}
			Value::Matrix(rows) => {
				f.write_str("[")?;
				for (i, row) in rows.iter().enumerate() {
					if i > 0 {
						f.write_str(";")?;
					}
					join(f, row, ",")?;
				}
				f.write_str("]")
			}
			Value::Lines(lines) => join(f, lines, "\n"),
		}
	}
}

/// A user supplied formatter.
pub type CustomFormat = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// How a reply should be decoded.
#[derive(Clone, Default)]
pub enum Format {
	/// Trim surrounding whitespace, brackets and semicolons.
	Strip,
	/// A `;` separated vector of numbers.
	Array,
	/// `;` separated rows of `,` separated numbers.
	Matrix,
	/// A single number.
	Number,
	/// The raw reply, untouched.
	#[default]
	None,
	/// Detect the shape of the reply.
	///
	/// The first rule that matches the trimmed reply wins:
	///  1. a matrix, e.g. `[1,2;3,4]`,
	///  2. an array, e.g. `[1;2;3]`,
	///  3. a single number, e.g. `-3.14e-2`,
	///  4. text containing a line break, split into lines,
	///  5. anything else, as trimmed text.
	Auto,
	/// A user supplied function.
	Custom(CustomFormat),
}

impl Format {
	/// Wrap a function so it can be used as a format.
	pub fn custom<F>(f: F) -> Self
	where
		F: Fn(&str) -> Value + Send + Sync + 'static,
	{
		Format::Custom(Arc::new(f))
	}

	/// Look up a format by name, falling back to [`Format::None`] with a
	/// warning if the name is unknown.
	///
	/// Use [`str::parse`] to treat unknown names as an error instead.
	pub fn from_name(name: &str) -> Self {
		name.parse().unwrap_or_else(|e: UnknownFormatError| {
			log::warn!("{e}, returning the raw reply");
			Format::None
		})
	}

	/// The name of the format.
	pub fn name(&self) -> &'static str {
		match self {
			Format::Strip => "strip",
			Format::Array => "array",
			Format::Matrix => "matrix",
			Format::Number => "number",
			Format::None => "none",
			Format::Auto => "auto",
			Format::Custom(_) => "custom",
		}
	}

	/// Decode `text`, falling back to the raw text with a warning if it does
	/// not have the expected shape.
	pub fn apply(&self, text: &str) -> Value {
		self.try_apply(text).unwrap_or_else(|e| {
			log::warn!("{e}, returning the raw reply");
			Value::Text(text.to_string())
		})
	}

	/// Decode `text`, reporting an error if it does not have the expected shape.
	///
	/// Only [`Format::Number`], [`Format::Array`] and [`Format::Matrix`] can fail.
	pub fn try_apply(&self, text: &str) -> Result<Value, ParseValueError> {
		match self {
			Format::Strip => Ok(Value::Text(strip(text).to_string())),
			Format::Array => decode_array(text).map(Value::Array),
			Format::Matrix => decode_matrix(text).map(Value::Matrix),
			Format::Number => parse_number(text.trim())
				.map(Value::Number)
				.ok_or_else(|| ParseValueError::new("a number", text)),
			Format::None => Ok(Value::Text(text.to_string())),
			Format::Auto => Ok(detect(text)),
			Format::Custom(f) => Ok(f(text)),
		}
	}
}

impl fmt::Debug for Format {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Format::{}", self.name())
	}
}

impl FromStr for Format {
	type Err = UnknownFormatError;

	fn from_str(name: &str) -> Result<Self, Self::Err> {
		Ok(match name {
			"strip" => Format::Strip,
			"array" => Format::Array,
			"matrix" => Format::Matrix,
			"number" => Format::Number,
			"none" => Format::None,
			"auto" => Format::Auto,
			other => return Err(UnknownFormatError::new(other)),
		})
	}
}

impl From<&str> for Format {
	/// Equivalent to [`Format::from_name`].
	fn from(name: &str) -> Self {
		Format::from_name(name)
	}
}

/// Trim surrounding whitespace, brackets and semicolons.
pub fn strip(text: &str) -> &str {
	text.trim_matches(is_strip_char)
}

/// Parse a numeric literal.
///
/// Accepts exactly the grammar used by [`Format::Auto`], including exponents
/// with a fractional part (`1e2.5`), which `f64::from_str` rejects.
pub fn parse_number(token: &str) -> Option<f64> {
	if !RE_NUMBER.is_match(token) {
		return None;
	}
	if let Ok(number) = token.parse::<f64>() {
		return Some(number);
	}
	let (mantissa, exponent) = token.split_once(['e', 'E'])?;
	let mantissa: f64 = mantissa.parse().ok()?;
	let exponent: f64 = exponent.parse().ok()?;
	Some(mantissa * 10f64.powf(exponent))
}

/// Parse `;` separated numbers, ignoring the surrounding brackets.
fn decode_array(text: &str) -> Result<Vec<f64>, ParseValueError> {
	strip(text)
		.split(';')
		.map(|token| parse_number(token.trim()))
		.collect::<Option<Vec<_>>>()
		.ok_or_else(|| ParseValueError::new("an array", text))
}

/// Parse `;` separated rows of `,` separated numbers, ignoring the
/// surrounding brackets.
fn decode_matrix(text: &str) -> Result<Vec<Vec<f64>>, ParseValueError> {
	strip(text)
		.split(';')
		.map(|row| {
			row.split(',')
				.map(|token| parse_number(token.trim()))
				.collect::<Option<Vec<_>>>()
		})
		.collect::<Option<Vec<_>>>()
		.ok_or_else(|| ParseValueError::new("a matrix", text))
}

/// Classify and decode a reply, see [`Format::Auto`].
fn detect(text: &str) -> Value {
	let trimmed = text.trim();
	if RE_MATRIX.is_match(trimmed) {
		if let Ok(rows) = decode_matrix(trimmed) {
			return Value::Matrix(rows);
		}
	}
	if RE_ARRAY.is_match(trimmed) {
		if let Ok(values) = decode_array(trimmed) {
			return Value::Array(values);
		}
	}
	if let Some(number) = parse_number(trimmed) {
		return Value::Number(number);
	}
	if trimmed.contains('\n') {
		let mut lines: Vec<String> = strip(trimmed)
			.lines()
			.map(str::trim_end)
			.filter(|line| !line.is_empty())
			.map(String::from)
			.collect();
		return match lines.len() {
			// Nothing but brackets and whitespace.
			0 => Value::Text(trimmed.to_string()),
			1 => Value::Text(lines.remove(0)),
			_ => Value::Lines(lines),
		};
	}
	Value::Text(trimmed.to_string())
}
