use minijinja::Environment;

use crate::eval::EvalContext;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("template: {0}")]
	Render(#[from] minijinja::Error),
	#[error("unknown template {0:?}")]
	Unknown(String),
}

/// All templates of one compiled configuration, registered under stable
/// names in a single environment.
pub struct Templates {
	env: Environment<'static>,
}

impl Default for Templates {
	fn default() -> Self {
		Self::new()
	}
}

impl Templates {
	pub fn new() -> Self {
		Templates {
			env: Environment::new(),
		}
	}

	pub fn add(&mut self, name: String, source: String) -> Result<(), Error> {
		self.env.add_template_owned(name, source)?;
		Ok(())
	}

	pub fn render(&self, name: &str, ctx: &EvalContext) -> Result<String, Error> {
		let tmpl = self
			.env
			.get_template(name)
			.map_err(|_| Error::Unknown(name.to_string()))?;
		Ok(tmpl.render(ctx)?)
	}

	/// Render template source that only exists at request time, such as a
	/// rendered body-file path. The template is not retained.
	pub fn render_inline(&self, source: &str, ctx: &EvalContext) -> Result<String, Error> {
		Ok(self.env.render_str(source, ctx)?)
	}
}

impl std::fmt::Debug for Templates {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Templates").finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn render_against_state_view() {
		let mut t = Templates::new();
		t.add(
			"greeting".to_string(),
			"hello {{ request.headers['x-user'] }}".to_string(),
		)
		.unwrap();
		let ctx = EvalContext {
			request: json!({"headers": {"x-user": "ada"}}),
			..Default::default()
		};
		assert_eq!(t.render("greeting", &ctx).unwrap(), "hello ada");
	}

	#[test]
	fn unknown_template() {
		let t = Templates::new();
		assert!(matches!(
			t.render("missing", &EvalContext::default()),
			Err(Error::Unknown(_))
		));
	}
}
