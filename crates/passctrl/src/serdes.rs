use std::io;
use std::path::PathBuf;

/// Serde yaml represents things different than just as "JSON in YAML format".
/// We don't want this. Instead, we transcode YAML via the JSON module.
pub mod yamlviajson {
	use serde::de;

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let de_yaml = serde_yaml::Deserializer::from_str(s);
		let mut buf = Vec::with_capacity(128);
		{
			let mut se_json = serde_json::Serializer::new(&mut buf);
			serde_transcode::transcode(de_yaml, &mut se_json)?;
		}
		Ok(serde_json::from_slice(&buf)?)
	}
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_dur {
	pub use duration_str::deserialize_duration as deserialize;
}

pub mod serde_dur_option {
	pub use duration_str::deserialize_option_duration as deserialize;
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum FileOrInline {
	File { file: PathBuf },
	Inline(String),
}

impl FileOrInline {
	pub fn load(&self) -> io::Result<String> {
		match self {
			FileOrInline::File { file } => fs_err::read_to_string(file),
			FileOrInline::Inline(s) => Ok(s.clone()),
		}
	}
}
