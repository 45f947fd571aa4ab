use std::path::PathBuf;

use thiserror::Error;

/// Structural failures raised while turning a subscription into servers.
///
/// Envelope-level variants (`InvalidUtf8`, `Fetch`, `HttpStatus`, `Cache`) abort
/// a whole subscription. Everything else is scoped to a single share-link and
/// is reported by the dispatcher, which then drops that one entry.
#[derive(Debug, Error)]
pub enum SubError {
  #[error("{context} is not valid utf-8 at byte {offset}: [{hex}]")]
  InvalidUtf8 {
    context: &'static str,
    offset: usize,
    hex: String,
  },

  #[error("vmess payload does not decode to utf-8 text: [{hex}]")]
  VmessBase64 { hex: String },

  #[error("vmess payload is not valid json '{text}': {source}")]
  VmessJson {
    text: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("{scheme} link has no '{separator}' separator")]
  MissingSeparator {
    scheme: &'static str,
    separator: char,
  },

  #[error("{scheme} link is missing required field '{field}'")]
  MissingField {
    scheme: &'static str,
    field: &'static str,
  },

  #[error("{scheme} link has invalid {field} '{value}'")]
  InvalidField {
    scheme: &'static str,
    field: &'static str,
    value: String,
  },

  #[error("invalid port '{0}'")]
  InvalidPort(String),

  #[error("subscription request failed: {0}")]
  Fetch(#[from] reqwest::Error),

  #[error("subscription response not ok: http {0}")]
  HttpStatus(u16),

  #[error("can not read cache file {}: {source}", .path.display())]
  Cache {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

pub type Result<T> = std::result::Result<T, SubError>;
