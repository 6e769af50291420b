// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Argument parsers shaped for `clap` validators
use anyhow::{Error as AnyErr, Result};

use crate::common::{fiber::LocalId, service::ServiceParameters};

pub fn parse_local_id(v: &str) -> Result<LocalId> {
  v.parse::<LocalId>()
    .map_err(|e| AnyErr::msg(format!("Local id must be an unsigned 32-bit integer: {}", e)))
}

/// Parses a single `key=value` service parameter
pub fn parse_parameter(v: &str) -> Result<(String, String)> {
  match v.split_once('=').map(|(key, value)| (key.trim(), value)) {
    None => Err(AnyErr::msg("Could not match '=' in parameter string")),
    Some(("", _)) => Err(AnyErr::msg("Parameter key must not be empty")),
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
  }
}

/// Parses a JSON object of string values into [ServiceParameters]
pub fn parse_parameters_json(v: &str) -> Result<ServiceParameters> {
  ServiceParameters::from_json_str(v).map_err(Into::into)
}

pub fn validate_local_id(v: &str) -> Result<(), String> {
  parse_local_id(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_parameter(v: &str) -> Result<(), String> {
  parse_parameter(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_parameters_json(v: &str) -> Result<(), String> {
  parse_parameters_json(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn local_ids() {
    assert_eq!(parse_local_id("12").unwrap(), LocalId::new(12));
    assert!(validate_local_id("twelve").is_err());
    assert!(validate_local_id("4294967296").is_err());
  }

  #[test]
  fn parameters() {
    assert_eq!(
      parse_parameter("target=10.0.0.1:22").unwrap(),
      ("target".to_string(), "10.0.0.1:22".to_string())
    );
    assert_eq!(
      parse_parameter("empty=").unwrap(),
      ("empty".to_string(), String::new())
    );
    assert_eq!(
      parse_parameter(" label =x").unwrap(),
      ("label".to_string(), "x".to_string())
    );
    assert!(validate_parameter("=value").is_err());
    assert!(validate_parameter(" =value").is_err());
    assert!(validate_parameter("novalue").is_err());
  }

  #[test]
  fn parameter_documents() {
    let params = parse_parameters_json(r#"{"port": "8080"}"#).unwrap();
    assert_eq!(params.get("port"), Some("8080"));
    assert!(validate_parameters_json(r#"{"port": 8080}"#).is_err());
  }
}
