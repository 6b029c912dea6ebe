use axum::{
	headers::{Error, Header},
	http::{HeaderName, HeaderValue},
};
use itertools::Itertools;
use lazy_static::lazy_static;
use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};
use std::{borrow::Cow, collections::HashMap, time::Duration};

lazy_static! {
	static ref PREFER: HeaderName = HeaderName::from_static("prefer");
}

/// The `Prefer` request header (RFC 7240), e.g. `Prefer: respond-async` or `Prefer: wait=10`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prefer(pub HashMap<String, String>);

impl Prefer {
	pub fn has(&self, key: &str) -> bool {
		self.0.contains_key(key)
	}

	pub fn respond_async(&self) -> bool {
		self.has("respond-async")
	}

	/// How long the client is willing to wait for a synchronous response.
	pub fn wait(&self) -> Option<Duration> {
		self.0
			.get("wait")
			.and_then(|seconds| seconds.parse().ok())
			.map(Duration::from_secs)
	}
}

impl Header for Prefer {
	fn name() -> &'static HeaderName {
		&PREFER
	}

	fn decode<'i, I>(values: &mut I) -> Result<Self, Error>
	where
		Self: Sized,
		I: Iterator<Item = &'i HeaderValue>,
	{
		let mut preferences = HashMap::new();

		for value in values {
			let value = value.to_str().map_err(|_| Error::invalid())?;

			preferences.extend(
				value
					.split(',')
					.map(str::trim)
					.filter(|s| !s.is_empty())
					.map(|s| {
						let (key, value) = s.split_once('=').unwrap_or((s, ""));
						let value = value.trim().trim_matches('"');

						(
							key.trim().to_lowercase(),
							percent_decode_str(value)
								.decode_utf8()
								.unwrap_or(Cow::Borrowed(value))
								.to_string(),
						)
					}),
			);
		}

		if preferences.is_empty() {
			return Err(Error::invalid());
		}

		Ok(Self(preferences))
	}

	fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
		let value = self
			.0
			.iter()
			.sorted()
			.map(|(key, value)| {
				format!(
					"{key}{}{}",
					if value.is_empty() { "" } else { "=" },
					percent_encode(value.as_bytes(), NON_ALPHANUMERIC)
				)
			})
			.join(",");

		if let Ok(value) = HeaderValue::from_str(&value) {
			values.extend(std::iter::once(value));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::HeaderMap;
	use map_macro::hash_map;

	fn decode(headers: &HeaderMap) -> Result<Prefer, Error> {
		Prefer::decode(&mut headers.get_all("Prefer").iter())
	}

	#[test]
	fn header_is_parsed_correctly() {
		let mut headers = HeaderMap::new();
		headers.insert(
			"Prefer",
			HeaderValue::from_static("wait=10, handling=lenient, respond-async"),
		);

		assert_eq!(
			decode(&headers).unwrap(),
			Prefer(hash_map! {
				"wait".to_string() => "10".to_string(),
				"handling".to_string() => "lenient".to_string(),
				"respond-async".to_string() => String::new(),
			})
		);
	}

	#[test]
	fn repeated_headers_are_merged() {
		let mut headers = HeaderMap::new();
		headers.append("Prefer", HeaderValue::from_static("respond-async"));
		headers.append("Prefer", HeaderValue::from_static("wait=\"5\""));

		let prefer = decode(&headers).unwrap();

		assert!(prefer.respond_async());
		assert_eq!(prefer.wait(), Some(Duration::from_secs(5)));
	}

	#[test]
	fn empty_header_is_invalid() {
		let mut headers = HeaderMap::new();
		headers.insert("Prefer", HeaderValue::from_static(" , "));

		assert!(decode(&headers).is_err());
		assert!(decode(&HeaderMap::new()).is_err());
	}

	#[test]
	fn header_is_encoded_correctly() {
		let prefer = Prefer(hash_map! {
			"wait".to_string() => "10".to_string(),
			"respond-async".to_string() => String::new(),
		});

		let mut values = Vec::new();
		prefer.encode(&mut values);

		assert_eq!(
			values,
			vec![HeaderValue::from_static("respond-async,wait=10")]
		);
	}

	#[test]
	fn wait_ignores_garbage() {
		let prefer = Prefer(hash_map! {
			"wait".to_string() => "soon".to_string(),
		});

		assert!(!prefer.respond_async());
		assert_eq!(prefer.wait(), None);
		assert_eq!(Prefer::default().wait(), None);
	}
}
