use anyhow::{Context, Result};
use base64::engine::general_purpose;
use base64::Engine;
use clap::Args as ClapArgs;
use percent_encoding::percent_decode_str;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::SubError;
use crate::node::{Endpoint, Protocol, ServerNode, ShadowsocksNode, VlessNode, VmessNode};

#[derive(ClapArgs, Debug, Clone)]
pub struct Args {
  /// Read subscription text from stdin.
  #[arg(long, default_value_t = false)]
  pub stdin: bool,

  /// Subscription text provided directly as an argument. Prefer --stdin for large inputs.
  #[arg(long)]
  pub text: Option<String>,
}

/// Longest byte run shown in encoding diagnostics.
const HEX_DUMP_LIMIT: usize = 64;

fn to_opt_string(s: &str) -> Option<String> {
  let t = s.trim();
  if t.is_empty() {
    None
  } else {
    Some(t.to_string())
  }
}

fn percent_decode_to_string(s: &str) -> String {
  match percent_decode_str(s).decode_utf8() {
    Ok(cow) => cow.to_string(),
    Err(_) => s.to_string(),
  }
}

pub fn hex_dump(bytes: &[u8]) -> String {
  let mut out = bytes
    .iter()
    .take(HEX_DUMP_LIMIT)
    .map(|b| format!("{b:02x}"))
    .collect::<Vec<_>>()
    .join(" ");
  if bytes.len() > HEX_DUMP_LIMIT {
    out.push_str(&format!(" ... ({} bytes)", bytes.len()));
  }
  out
}

pub fn pad_base64(s: &str) -> String {
  let rem = s.len() % 4;
  if rem == 0 {
    s.to_string()
  } else {
    format!("{s}{}", "=".repeat(4 - rem))
  }
}

/// Decodes base64 after stripping whitespace and repairing padding.
/// Returns `None` when neither the standard nor the url-safe alphabet accepts it.
pub fn try_decode_base64(s: &str) -> Option<Vec<u8>> {
  let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
  let padded = pad_base64(&cleaned);
  for engine in [&general_purpose::STANDARD, &general_purpose::URL_SAFE] {
    if let Ok(bytes) = engine.decode(&padded) {
      return Some(bytes);
    }
  }
  None
}

pub fn decode_base64_lenient(s: &str) -> Vec<u8> {
  match try_decode_base64(s) {
    Some(bytes) => bytes,
    None => {
      debug!(len = s.len(), "input is not base64, using it verbatim");
      s.as_bytes().to_vec()
    }
  }
}

/// Like [`decode_base64_lenient`] but also falls back when the decoded bytes
/// are not text. Used where links show up both encoded and plain.
fn decode_or_original(s: &str) -> String {
  try_decode_base64(s)
    .and_then(|bytes| String::from_utf8(bytes).ok())
    .unwrap_or_else(|| s.to_string())
}

fn utf8_strict(bytes: Vec<u8>, context: &'static str) -> Result<String, SubError> {
  String::from_utf8(bytes).map_err(|e| {
    let offset = e.utf8_error().valid_up_to();
    let bytes = e.into_bytes();
    let start = offset.saturating_sub(8);
    SubError::InvalidUtf8 {
      context,
      offset,
      hex: hex_dump(&bytes[start..]),
    }
  })
}

/// Opens the outer base64 envelope of a subscription body.
///
/// Malformed base64 is not an error: the text is then assumed to already be a
/// plain link list. Bytes that decode but are not utf-8 are.
pub fn unwrap_blob(raw: &str) -> Result<String, SubError> {
  utf8_strict(decode_base64_lenient(raw), "subscription body")
}

fn parse_port(scheme: &'static str, raw: &str) -> Result<u16, SubError> {
  match raw.trim().parse::<u16>() {
    Ok(port) if port > 0 => Ok(port),
    _ => {
      debug!(scheme, port = raw, "rejecting port");
      Err(SubError::InvalidPort(raw.to_string()))
    }
  }
}

fn split_host_port(scheme: &'static str, s: &str) -> Result<(String, u16), SubError> {
  let (host, port) = s.split_once(':').ok_or(SubError::MissingSeparator {
    scheme,
    separator: ':',
  })?;
  Ok((host.trim().to_string(), parse_port(scheme, port)?))
}

fn json_get_str(obj: &JsonValue, key: &str) -> String {
  let v = obj.get(key);
  if let Some(s) = v.and_then(|x| x.as_str()) {
    return s.trim().to_string();
  }
  if let Some(n) = v.and_then(|x| x.as_i64()) {
    return n.to_string();
  }
  if let Some(b) = v.and_then(|x| x.as_bool()) {
    return if b { "true".to_string() } else { "false".to_string() };
  }
  String::new()
}

fn json_get_i64(obj: &JsonValue, field: &'static str, default: i64) -> Result<i64, SubError> {
  let Some(v) = obj.get(field) else {
    return Ok(default);
  };
  if let Some(n) = v.as_i64() {
    return Ok(n);
  }
  if let Some(n) = v.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
    return Ok(n);
  }
  Err(SubError::InvalidField {
    scheme: "vmess",
    field,
    value: v.to_string(),
  })
}

fn parse_ss_uri(body: &str) -> Result<Option<ServerNode>, SubError> {
  let (before_hash, tag) = match body.split_once('#') {
    Some((a, b)) => (a, percent_decode_to_string(b).trim().to_string()),
    None => (body, String::new()),
  };

  // strip plugin params
  let main = before_hash.split('?').next().unwrap_or("").trim();

  let plain = if main.contains('@') && main.contains(':') {
    main.to_string()
  } else {
    decode_or_original(main)
  };

  let Some((creds_part, host_part)) = plain.rsplit_once('@') else {
    debug!(tag = %tag, "ss link has no server part, skipping");
    return Ok(None);
  };

  let creds = if creds_part.contains(':') {
    creds_part.to_string()
  } else {
    decode_or_original(creds_part)
  };
  let (method, password) = creds.split_once(':').ok_or(SubError::MissingSeparator {
    scheme: "ss",
    separator: ':',
  })?;

  let (host, port) = split_host_port("ss", host_part.trim_end_matches('/'))?;

  Ok(Some(ServerNode::Shadowsocks(ShadowsocksNode {
    endpoint: Endpoint { tag, host, port },
    method: method.to_string(),
    password: password.to_string(),
  })))
}

fn parse_vmess_uri(body: &str) -> Result<ServerNode, SubError> {
  let bytes = decode_base64_lenient(body.trim());
  let json_text = String::from_utf8(bytes).map_err(|e| SubError::VmessBase64 {
    hex: hex_dump(e.as_bytes()),
  })?;
  let obj: JsonValue = serde_json::from_str(&json_text).map_err(|source| SubError::VmessJson {
    text: json_text.clone(),
    source,
  })?;

  let port = match obj.get("port") {
    None => 0,
    Some(v) => {
      let raw = json_get_str(&obj, "port");
      match raw.parse::<u16>() {
        Ok(p) => p,
        Err(_) => return Err(SubError::InvalidPort(v.to_string())),
      }
    }
  };

  let camouflage = match obj.get("type") {
    None => {
      return Err(SubError::MissingField {
        scheme: "vmess",
        field: "type",
      })
    }
    Some(_) => {
      let t = json_get_str(&obj, "type");
      if t.is_empty() {
        "none".to_string()
      } else {
        t
      }
    }
  };

  let network = if obj.get("net").is_some() {
    json_get_str(&obj, "net")
  } else {
    "tcp".to_string()
  };

  let path = obj.get("path").map(|_| json_get_str(&obj, "path"));

  Ok(ServerNode::Vmess(VmessNode {
    endpoint: Endpoint {
      tag: json_get_str(&obj, "ps"),
      host: json_get_str(&obj, "add"),
      port,
    },
    uuid: json_get_str(&obj, "id"),
    cipher: "auto".to_string(),
    alter_id: json_get_i64(&obj, "aid", 0)?,
    network,
    camouflage,
    tls: json_get_str(&obj, "tls") == "tls",
    sni: to_opt_string(&json_get_str(&obj, "sni")),
    path,
  }))
}

fn parse_vless_uri(body: &str) -> Result<ServerNode, SubError> {
  let missing = |separator| SubError::MissingSeparator {
    scheme: "vless",
    separator,
  };

  let (rest, tag) = body.split_once('#').ok_or(missing('#'))?;
  let tag = percent_decode_to_string(tag).trim().to_string();
  let (base, query) = rest.split_once('?').ok_or(missing('?'))?;
  let (uuid, host_port) = base.split_once('@').ok_or(missing('@'))?;
  let (host, port) = split_host_port("vless", host_port)?;

  let mut node = VlessNode {
    endpoint: Endpoint { tag, host, port },
    uuid: uuid.to_string(),
    network: "tcp".to_string(),
    tls: false,
    sni: None,
    flow: None,
    fingerprint: None,
  };

  for token in query.split('&') {
    if token == "security=tls" {
      node.tls = true;
      continue;
    }
    let Some((key, value)) = token.split_once('=') else {
      continue;
    };
    match key {
      "type" => node.network = value.to_string(),
      "flow" => node.flow = Some(value.to_string()),
      "sni" => node.sni = Some(value.to_string()),
      "fp" => node.fingerprint = Some(value.to_string()),
      _ => {}
    }
  }

  Ok(ServerNode::Vless(node))
}

/// Decodes one share-link.
///
/// `Ok(None)` means the line is not a server entry we handle: no `://`, an
/// unknown scheme, or a shadowsocks link without a server part.
pub fn decode_uri(line: &str) -> Result<Option<ServerNode>, SubError> {
  let Some((scheme, body)) = line.split_once("://") else {
    return Ok(None);
  };
  let Some(protocol) = Protocol::from_scheme(scheme) else {
    debug!(scheme, "skipping unsupported scheme");
    return Ok(None);
  };
  match protocol {
    Protocol::Shadowsocks => parse_ss_uri(body),
    Protocol::Vmess => parse_vmess_uri(body).map(Some),
    Protocol::Vless => parse_vless_uri(body).map(Some),
  }
}

/// [`decode_uri`] with errors logged and turned into `None`.
pub fn parse_node_from_uri_line(line: &str) -> Option<ServerNode> {
  match decode_uri(line.trim()) {
    Ok(node) => node,
    Err(e) => {
      warn!("dropping share-link: {e}");
      None
    }
  }
}

#[derive(Debug)]
pub struct Rejected {
  pub line: String,
  pub error: SubError,
}

#[derive(Debug, Default)]
pub struct Decoded {
  pub servers: Vec<ServerNode>,
  pub rejected: Vec<Rejected>,
}

/// Decodes every line of an already unwrapped link list.
/// Each bad entry is logged once and skipped.
pub fn decode_lines(text: &str) -> Decoded {
  let mut out = Decoded::default();
  for line in text.split('\n') {
    let s = line.trim();
    if s.is_empty() {
      continue;
    }
    match decode_uri(s) {
      Ok(Some(node)) => out.servers.push(node),
      Ok(None) => {}
      Err(error) => {
        warn!("dropping share-link: {error}");
        out.rejected.push(Rejected {
          line: s.to_string(),
          error,
        });
      }
    }
  }
  debug!(
    servers = out.servers.len(),
    rejected = out.rejected.len(),
    "decoded subscription lines"
  );
  out
}

pub fn parse_subscription_text(raw: &str) -> Result<Decoded, SubError> {
  let body = unwrap_blob(raw)?;
  Ok(decode_lines(&body))
}

pub async fn run(args: Args) -> Result<()> {
  let input = if args.stdin || args.text.is_none() {
    let mut buf = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    stdin.read_to_string(&mut buf).await?;
    buf
  } else {
    args.text.unwrap_or_default()
  };

  let decoded = parse_subscription_text(&input).context("decode subscription")?;
  for n in decoded.servers {
    if let Ok(line) = serde_json::to_string(&n) {
      println!("{line}");
    }
  }
  Ok(())
}
