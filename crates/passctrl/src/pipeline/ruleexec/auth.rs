use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use itertools::Itertools;
use serde_json::json;

use crate::eval::EvalContext;
use crate::pipeline::state::{Credential, ForwardDescriptor};
use crate::template::Templates;
use crate::types::{ForwardDef, MatchGroup, Matcher, MatcherKind, RuleDefinition};

/// The matchers of one selected group, resolved against the admission
/// credentials. Matched credentials are held by value so the selection
/// outlives the admission state it was derived from.
pub struct SelectedAuth<'a> {
	pub group: &'a MatchGroup,
	/// Kinds of the satisfied matchers, for observability.
	pub matcher: String,
	/// Nested matched-input map: bearer, basic, header[name], query[name].
	pub input: serde_json::Value,
	/// The credential satisfying each matcher, in matcher order.
	matched: Vec<(&'a Matcher, Credential)>,
}

/// First group whose every matcher is satisfied by some credential wins.
pub fn select_group<'a>(
	rule: &'a RuleDefinition,
	credentials: &[Credential],
) -> Option<SelectedAuth<'a>> {
	for group in &rule.auth {
		let mut matched = Vec::with_capacity(group.matchers.len());
		let all = group.matchers.iter().all(|m| {
			match credentials.iter().find(|c| matcher_satisfied(m, c)) {
				Some(c) => {
					matched.push((m, c.clone()));
					true
				},
				None => false,
			}
		});
		if all {
			let matcher = matched.iter().map(|(m, _)| m.kind.to_string()).join(",");
			let input = matched_input(&matched);
			return Some(SelectedAuth {
				group,
				matcher,
				input,
				matched,
			});
		}
	}
	None
}

fn matcher_satisfied(matcher: &Matcher, credential: &Credential) -> bool {
	let value = match (&matcher.kind, credential) {
		(MatcherKind::None, Credential::None) => return true,
		(MatcherKind::Bearer, Credential::Bearer { token }) => token.as_str(),
		(MatcherKind::Basic, Credential::Basic { user, .. }) => user.as_str(),
		(MatcherKind::Header, Credential::Header { name, value }) => {
			if matcher.name.as_deref() != Some(name.as_str()) {
				return false;
			}
			value.as_str()
		},
		(MatcherKind::Query, Credential::Query { name, value }) => {
			if matcher.name.as_deref() != Some(name.as_str()) {
				return false;
			}
			value.as_str()
		},
		_ => return false,
	};
	matcher.values.is_empty() || matcher.values.iter().any(|vm| vm.matches(value))
}

fn matched_input(matched: &[(&Matcher, Credential)]) -> serde_json::Value {
	let mut out = serde_json::Map::new();
	let mut headers = serde_json::Map::new();
	let mut query = serde_json::Map::new();
	for (_, credential) in matched {
		match credential {
			Credential::Bearer { token } => {
				out.insert("bearer".to_string(), json!({ "token": token }));
			},
			Credential::Basic { user, password } => {
				out.insert(
					"basic".to_string(),
					json!({ "user": user, "password": password }),
				);
			},
			Credential::Header { name, value } => {
				headers.insert(name.clone(), json!(value));
			},
			Credential::Query { name, value } => {
				query.insert(name.clone(), json!(value));
			},
			Credential::None => {},
		}
	}
	if !headers.is_empty() {
		out.insert("header".to_string(), serde_json::Value::Object(headers));
	}
	if !query.is_empty() {
		out.insert("query".to_string(), serde_json::Value::Object(query));
	}
	serde_json::Value::Object(out)
}

/// A forward ready to apply to the rendered backend request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedForward {
	Authorization(String),
	Header { name: String, value: String },
	Query { name: String, value: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
	#[error("forward field {0} was empty after rendering")]
	EmptyField(&'static str),
	#[error(transparent)]
	Eval(#[from] crate::eval::EvalError),
}

/// Render the templated fields of explicitly declared forwards.
pub fn resolve_forwards(
	defs: &[ForwardDef],
	templates: &Templates,
	ctx: &EvalContext,
) -> Result<Vec<ResolvedForward>, ForwardError> {
	defs
		.iter()
		.map(|def| resolve_forward(def, templates, ctx))
		.collect()
}

/// The shape of what the selected group would forward: the declared list
/// when present, otherwise a mirror of the matched credentials. Only the
/// declared form is ever applied to a backend request; credentials the
/// request carried stay stripped unless a forward re-adds them.
pub fn forward_descriptors(selected: &SelectedAuth<'_>) -> Vec<ForwardDescriptor> {
	use crate::eval::TemplateString;
	let literal = |t: &TemplateString| match t {
		TemplateString::Literal(s) => Some(s.clone()),
		TemplateString::Template(_) => None,
	};
	match &selected.group.forwards {
		Some(defs) => defs
			.iter()
			.map(|def| match def {
				ForwardDef::Bearer { .. } => ForwardDescriptor {
					kind: "bearer",
					name: None,
				},
				ForwardDef::Basic { .. } => ForwardDescriptor {
					kind: "basic",
					name: None,
				},
				ForwardDef::Header { name, .. } => ForwardDescriptor {
					kind: "header",
					name: literal(name),
				},
				ForwardDef::Query { name, .. } => ForwardDescriptor {
					kind: "query",
					name: literal(name),
				},
			})
			.collect(),
		None => selected
			.matched
			.iter()
			.filter_map(|(_, credential)| match credential {
				Credential::None => None,
				c => Some(ForwardDescriptor {
					kind: c.kind(),
					name: c.name().map(|n| n.to_string()),
				}),
			})
			.collect(),
	}
}

fn resolve_forward(
	def: &ForwardDef,
	templates: &Templates,
	ctx: &EvalContext,
) -> Result<ResolvedForward, ForwardError> {
	Ok(match def {
		ForwardDef::Bearer { token } => {
			let token = token.render(templates, ctx)?;
			if token.is_empty() {
				return Err(ForwardError::EmptyField("token"));
			}
			ResolvedForward::Authorization(format!("Bearer {token}"))
		},
		ForwardDef::Basic { user, password } => {
			let user = user.render(templates, ctx)?;
			if user.is_empty() {
				return Err(ForwardError::EmptyField("user"));
			}
			let password = password.render(templates, ctx)?;
			let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
			ResolvedForward::Authorization(format!("Basic {encoded}"))
		},
		ForwardDef::Header { name, value } => {
			let name = name.render(templates, ctx)?.to_ascii_lowercase();
			if name.is_empty() {
				return Err(ForwardError::EmptyField("name"));
			}
			let value = value.render(templates, ctx)?;
			if value.is_empty() {
				return Err(ForwardError::EmptyField("value"));
			}
			ResolvedForward::Header { name, value }
		},
		ForwardDef::Query { name, value } => {
			let name = name.render(templates, ctx)?;
			if name.is_empty() {
				return Err(ForwardError::EmptyField("name"));
			}
			let value = value.render(templates, ctx)?;
			if value.is_empty() {
				return Err(ForwardError::EmptyField("value"));
			}
			ResolvedForward::Query { name, value }
		},
	})
}


#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::ValueMatcher;

	fn bearer_rule(groups: Vec<MatchGroup>) -> RuleDefinition {
		RuleDefinition {
			name: "r".to_string(),
			auth: groups,
			backend: None,
			variables: Default::default(),
			conditions: Default::default(),
			responses: Default::default(),
		}
	}

	fn matcher(kind: MatcherKind, name: Option<&str>, values: Vec<ValueMatcher>) -> Matcher {
		Matcher {
			kind,
			name: name.map(|s| s.to_string()),
			values,
		}
	}

	#[test]
	fn first_matching_group_wins() {
		let rule = bearer_rule(vec![
			MatchGroup {
				matchers: vec![matcher(
					MatcherKind::Bearer,
					None,
					vec![ValueMatcher::Prefix("adm_".into())],
				)],
				forwards: None,
			},
			MatchGroup {
				matchers: vec![matcher(MatcherKind::Bearer, None, vec![])],
				forwards: None,
			},
		]);
		let creds = vec![Credential::Bearer {
			token: "user_1".to_string(),
		}];
		let selected = select_group(&rule, &creds).unwrap();
		// The admin group did not match; the catch-all did.
		assert!(std::ptr::eq(selected.group, &rule.auth[1]));
		assert_eq!(selected.input["bearer"]["token"], "user_1");
	}

	#[test]
	fn conjunction_requires_every_matcher() {
		let rule = bearer_rule(vec![MatchGroup {
			matchers: vec![
				matcher(MatcherKind::Bearer, None, vec![]),
				matcher(MatcherKind::Header, Some("x-tenant"), vec![]),
			],
			forwards: None,
		}]);
		let only_bearer = vec![Credential::Bearer {
			token: "t".to_string(),
		}];
		assert!(select_group(&rule, &only_bearer).is_none());
		let both = vec![
			Credential::Bearer {
				token: "t".to_string(),
			},
			Credential::Header {
				name: "x-tenant".to_string(),
				value: "acme".to_string(),
			},
		];
		let selected = select_group(&rule, &both).unwrap();
		assert_eq!(selected.matcher, "bearer,header");
		assert_eq!(selected.input["header"]["x-tenant"], "acme");
	}

	#[test]
	fn value_matchers_are_or_among_themselves() {
		let rule = bearer_rule(vec![MatchGroup {
			matchers: vec![matcher(
				MatcherKind::Query,
				Some("key"),
				vec![
					ValueMatcher::Exact("a".into()),
					ValueMatcher::Exact("b".into()),
				],
			)],
			forwards: None,
		}]);
		let creds = |v: &str| {
			vec![Credential::Query {
				name: "key".to_string(),
				value: v.to_string(),
			}]
		};
		assert!(select_group(&rule, &creds("a")).is_some());
		assert!(select_group(&rule, &creds("b")).is_some());
		assert!(select_group(&rule, &creds("c")).is_none());
	}

	#[test]
	fn descriptors_mirror_matched_credentials_when_undeclared() {
		let rule = bearer_rule(vec![MatchGroup {
			matchers: vec![matcher(MatcherKind::Header, Some("x-token"), vec![])],
			forwards: None,
		}]);
		let creds = vec![Credential::Header {
			name: "x-token".to_string(),
			value: "abc".to_string(),
		}];
		let selected = select_group(&rule, &creds).unwrap();
		assert_eq!(
			forward_descriptors(&selected),
			vec![ForwardDescriptor {
				kind: "header",
				name: Some("x-token".to_string()),
			}]
		);
	}

	#[test]
	fn declared_forwards_render_and_reject_empty_fields() {
		let mut templates = Templates::new();
		let def = ForwardDef::Header {
			name: crate::eval::TemplateString::Literal("x-subject".to_string()),
			value: crate::eval::TemplateString::compile(
				"{{ auth.bearer.token }}",
				"t".to_string(),
				&mut templates,
			)
			.unwrap(),
		};
		let ctx = EvalContext {
			auth: serde_json::json!({"bearer": {"token": "tok_1"}}),
			..Default::default()
		};
		let resolved = resolve_forwards(std::slice::from_ref(&def), &templates, &ctx).unwrap();
		assert_eq!(
			resolved,
			vec![ResolvedForward::Header {
				name: "x-subject".to_string(),
				value: "tok_1".to_string(),
			}]
		);

		let empty_ctx = EvalContext {
			auth: serde_json::json!({"bearer": {"token": ""}}),
			..Default::default()
		};
		assert!(matches!(
			resolve_forwards(std::slice::from_ref(&def), &templates, &empty_ctx),
			Err(ForwardError::EmptyField(_))
		));
	}

	#[test]
	fn anonymous_matcher() {
		let rule = bearer_rule(vec![MatchGroup {
			matchers: vec![matcher(MatcherKind::None, None, vec![])],
			forwards: None,
		}]);
		let creds = vec![Credential::None];
		assert!(select_group(&rule, &creds).is_some());
	}
}
