use std::fmt::{Debug, Formatter};

use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, ExecutionError, Value};
use cel_parser::{Expression as CelExpression, ParseError};
use serde::Serialize;

use crate::eval::EvalContext;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("execution: {0}")]
	Resolve(#[from] ExecutionError),
	#[error("parse: {0}")]
	Parse(#[from] ParseError),
	#[error("variable: {0}")]
	Variable(String),
}

/// A CEL program compiled once at configuration time and evaluated
/// against the per-request state view.
pub struct Expression {
	expression: CelExpression,
	original_expression: String,
}

impl Serialize for Expression {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(&self.original_expression)
	}
}

impl Debug for Expression {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Expression")
			.field("expression", &self.original_expression)
			.finish()
	}
}

impl Expression {
	pub fn new(original_expression: impl Into<String>) -> Result<Self, Error> {
		let original_expression = original_expression.into();
		let expression = cel_parser::parse(&original_expression)?;
		Ok(Self {
			expression,
			original_expression,
		})
	}

	pub fn source(&self) -> &str {
		&self.original_expression
	}

	pub fn eval(&self, ec: &EvalContext) -> Result<serde_json::Value, Error> {
		let value = self.resolve(ec)?;
		value_to_json(&value)
	}

	/// Boolean view of the program result; a non-boolean result is false.
	pub fn eval_bool(&self, ec: &EvalContext) -> Result<bool, Error> {
		Ok(matches!(self.resolve(ec)?, Value::Bool(true)))
	}

	fn resolve(&self, ec: &EvalContext) -> Result<Value, Error> {
		let mut ctx = Context::default();
		ctx.add_variable_from_value("request", to_value(&ec.request)?);
		ctx.add_variable_from_value("admission", to_value(&ec.admission)?);
		ctx.add_variable_from_value("auth", to_value(&ec.auth)?);
		ctx.add_variable_from_value("backend", to_value(&ec.backend)?);
		ctx.add_variable_from_value("vars", to_value(&ec.vars)?);
		ctx.add_variable_from_value("rules", to_value(&ec.rules)?);
		ctx.add_variable_from_value("response", to_value(&ec.response)?);
		ctx.add_variable_from_value("env", to_value(&ec.env)?);
		ctx.add_variable_from_value("secrets", to_value(&ec.secrets)?);
		Ok(Value::resolve(&self.expression, &ctx)?)
	}
}

fn to_value(v: impl Serialize) -> Result<Value, Error> {
	cel_interpreter::to_value(v).map_err(|e| Error::Variable(e.to_string()))
}

/// CEL results cross back into the state as JSON. Integers stay integers;
/// floats stay floats.
pub fn value_to_json(v: &Value) -> Result<serde_json::Value, Error> {
	use serde_json::Value as Json;
	Ok(match v {
		Value::Null => Json::Null,
		Value::Bool(b) => Json::Bool(*b),
		Value::Int(i) => Json::from(*i),
		Value::UInt(u) => Json::from(*u),
		Value::Float(f) => serde_json::Number::from_f64(*f)
			.map(Json::Number)
			.unwrap_or(Json::Null),
		Value::String(s) => Json::String(s.as_ref().clone()),
		Value::Bytes(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
		Value::List(items) => Json::Array(
			items
				.iter()
				.map(value_to_json)
				.collect::<Result<Vec<_>, _>>()?,
		),
		Value::Map(Map { map }) => {
			let mut out = serde_json::Map::with_capacity(map.len());
			for (k, v) in map.iter() {
				let key = match k {
					Key::String(s) => s.as_ref().clone(),
					Key::Int(i) => i.to_string(),
					Key::Uint(u) => u.to_string(),
					Key::Bool(b) => b.to_string(),
				};
				out.insert(key, value_to_json(v)?);
			}
			Json::Object(out)
		},
		Value::Timestamp(t) => Json::String(t.to_rfc3339()),
		Value::Duration(d) => serde_json::Number::from_f64(d.num_milliseconds() as f64 / 1000.0)
			.map(Json::Number)
			.unwrap_or(Json::Null),
		other => {
			return Err(Error::Variable(format!(
				"unsupported expression result: {other:?}"
			)));
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn ctx() -> EvalContext {
		EvalContext {
			request: json!({"method": "GET", "headers": {"x-example": "value"}}),
			backend: json!({"status": 200, "body": {"count": 3, "ratio": 0.5}}),
			..Default::default()
		}
	}

	#[test]
	fn boolean_programs() {
		let e = Expression::new(r#"request.method == "GET" && request.headers["x-example"] == "value""#)
			.unwrap();
		assert!(e.eval_bool(&ctx()).unwrap());
		let e = Expression::new(r#"backend.status == 404"#).unwrap();
		assert!(!e.eval_bool(&ctx()).unwrap());
	}

	#[test]
	fn non_boolean_is_false() {
		let e = Expression::new(r#"backend.status"#).unwrap();
		assert!(!e.eval_bool(&ctx()).unwrap());
	}

	#[test]
	fn integer_float_distinction_survives() {
		let e = Expression::new("backend.body.count").unwrap();
		assert_eq!(e.eval(&ctx()).unwrap(), json!(3));
		let e = Expression::new("backend.body.ratio").unwrap();
		assert_eq!(e.eval(&ctx()).unwrap(), json!(0.5));
	}

	#[test]
	fn parse_errors_surface() {
		assert!(Expression::new("request.method ==").is_err());
	}
}
