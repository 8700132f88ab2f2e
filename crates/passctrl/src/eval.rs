use serde::Serialize;

use crate::template::Templates;
use crate::{cel, template};

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
	#[error(transparent)]
	Cel(#[from] cel::Error),
	#[error(transparent)]
	Template(#[from] template::Error),
}

/// The state view both evaluation engines see. Each field is a JSON
/// snapshot assembled from the pipeline state at the evaluation point.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EvalContext {
	pub request: serde_json::Value,
	pub admission: serde_json::Value,
	pub auth: serde_json::Value,
	pub backend: serde_json::Value,
	pub vars: serde_json::Value,
	pub rules: serde_json::Value,
	pub response: serde_json::Value,
	pub env: serde_json::Value,
	pub secrets: serde_json::Value,
}

/// A variable, condition, or export program. Sources containing `{{` are
/// templates; everything else is a CEL program. Classified once at
/// configuration time.
#[derive(Debug)]
pub enum Program {
	Expression(cel::Expression),
	Template(String),
}

impl Program {
	pub fn compile(source: &str, key: String, templates: &mut Templates) -> Result<Self, EvalError> {
		if source.contains("{{") {
			templates.add(key.clone(), source.to_string())?;
			Ok(Program::Template(key))
		} else {
			Ok(Program::Expression(cel::Expression::new(source)?))
		}
	}

	pub fn eval(
		&self,
		templates: &Templates,
		ctx: &EvalContext,
	) -> Result<serde_json::Value, EvalError> {
		match self {
			Program::Expression(e) => Ok(e.eval(ctx)?),
			Program::Template(name) => Ok(serde_json::Value::String(templates.render(name, ctx)?)),
		}
	}

	/// Predicate view: CEL programs must resolve to `true`; templates must
	/// render to `true` or `1` after trimming.
	pub fn eval_bool(&self, templates: &Templates, ctx: &EvalContext) -> Result<bool, EvalError> {
		match self {
			Program::Expression(e) => Ok(e.eval_bool(ctx)?),
			Program::Template(name) => {
				let rendered = templates.render(name, ctx)?;
				let t = rendered.trim();
				Ok(t.eq_ignore_ascii_case("true") || t == "1")
			},
		}
	}
}

/// A string-valued configuration field: rendered as a template when it
/// contains `{{`, used verbatim otherwise.
#[derive(Debug, Clone)]
pub enum TemplateString {
	Template(String),
	Literal(String),
}

impl TemplateString {
	pub fn compile(source: &str, key: String, templates: &mut Templates) -> Result<Self, EvalError> {
		if source.contains("{{") {
			templates.add(key.clone(), source.to_string())?;
			Ok(TemplateString::Template(key))
		} else {
			Ok(TemplateString::Literal(source.to_string()))
		}
	}

	pub fn render(&self, templates: &Templates, ctx: &EvalContext) -> Result<String, EvalError> {
		match self {
			TemplateString::Template(name) => Ok(templates.render(name, ctx)?),
			TemplateString::Literal(s) => Ok(s.clone()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn ctx() -> EvalContext {
		EvalContext {
			backend: json!({"status": 200, "body": {"user": "ada"}}),
			vars: json!({"who": "ada"}),
			..Default::default()
		}
	}

	#[test]
	fn classification() {
		let mut t = Templates::new();
		let p = Program::compile("backend.status == 200", "k1".into(), &mut t).unwrap();
		assert!(matches!(p, Program::Expression(_)));
		let p = Program::compile("{{ vars.who }}", "k2".into(), &mut t).unwrap();
		assert!(matches!(p, Program::Template(_)));
	}

	#[test]
	fn hybrid_eval() {
		let mut t = Templates::new();
		let expr = Program::compile("backend.body.user", "k1".into(), &mut t).unwrap();
		assert_eq!(expr.eval(&t, &ctx()).unwrap(), json!("ada"));
		let tmpl = Program::compile("user={{ vars.who }}", "k2".into(), &mut t).unwrap();
		assert_eq!(tmpl.eval(&t, &ctx()).unwrap(), json!("user=ada"));
	}

	#[test]
	fn template_predicates() {
		let mut t = Templates::new();
		let p = Program::compile(
			"{% if backend.status == 200 %}true{% endif %}",
			"k".into(),
			&mut t,
		)
		.unwrap();
		assert!(p.eval_bool(&t, &ctx()).unwrap());
	}

	#[test]
	fn template_string_literal_passthrough() {
		let mut t = Templates::new();
		let s = TemplateString::compile("plain value", "k".into(), &mut t).unwrap();
		assert!(matches!(s, TemplateString::Literal(_)));
		assert_eq!(s.render(&t, &ctx()).unwrap(), "plain value");
	}
}
