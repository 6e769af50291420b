// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
  #[error("Required parameter `{key}` is missing")]
  Missing { key: String },
  #[error("Parameter `{key}` has invalid value {value:?}: {reason}")]
  Invalid {
    key: String,
    value: String,
    reason: String,
  },
}

/// String-keyed configuration handed to a service at construction
///
/// The core never interprets these; each service variant validates the keys it recognizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceParameters(BTreeMap<String, String>);

impl ServiceParameters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(s)
  }

  pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> Option<String> {
    self.0.insert(key.into(), value.into())
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn require(&self, key: &str) -> Result<&str, ParameterError> {
    self.get(key).ok_or_else(|| ParameterError::Missing {
      key: key.to_string(),
    })
  }

  /// Parses an optional parameter, failing only if it is present but malformed
  pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ParameterError>
  where
    T: FromStr,
    T::Err: std::fmt::Display,
  {
    self
      .get(key)
      .map(|value| {
        value.parse::<T>().map_err(|e| ParameterError::Invalid {
          key: key.to_string(),
          value: value.to_string(),
          reason: e.to_string(),
        })
      })
      .transpose()
  }

  pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ParameterError>
  where
    T: FromStr,
    T::Err: std::fmt::Display,
  {
    self.parse(key).map(|v| v.unwrap_or(default))
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl From<BTreeMap<String, String>> for ServiceParameters {
  fn from(map: BTreeMap<String, String>) -> Self {
    Self(map)
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ServiceParameters {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::{ParameterError, ServiceParameters};
  use std::net::SocketAddr;

  #[test]
  fn typed_lookups() {
    let params = ServiceParameters::new()
      .with("port", "8080")
      .with("target", "10.0.0.1:22");
    assert_eq!(params.parse::<u16>("port").unwrap(), Some(8080));
    assert_eq!(
      params.parse::<SocketAddr>("target").unwrap(),
      Some("10.0.0.1:22".parse().unwrap())
    );
    assert_eq!(params.parse::<u16>("absent").unwrap(), None);
    assert!(params.parse_or("flag", false).is_ok());
  }

  #[test]
  fn malformed_and_missing_values() {
    let params: ServiceParameters = [("port", "eighty")].into_iter().collect();
    match params.parse::<u16>("port") {
      Err(ParameterError::Invalid { key, value, .. }) => {
        assert_eq!(key, "port");
        assert_eq!(value, "eighty");
      }
      other => panic!("Expected an invalid parameter error, got {:?}", other),
    }
    assert_eq!(
      params.require("target"),
      Err(ParameterError::Missing {
        key: "target".into()
      })
    );
  }

  #[test]
  fn json_documents_are_flat_string_maps() {
    let params = ServiceParameters::from_json_str(r#"{"b": "2", "a": "1"}"#).unwrap();
    let keys: Vec<_> = params.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert!(ServiceParameters::from_json_str(r#"{"a": 1}"#).is_err());
    assert_eq!(serde_json::to_string(&params).unwrap(), r#"{"a":"1","b":"2"}"#);
  }
}
