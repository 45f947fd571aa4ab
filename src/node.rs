use serde::Serialize;

/// Share-link schemes this tool understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  Shadowsocks,
  Vmess,
  Vless,
}

impl Protocol {
  /// Maps the text before `://` to a protocol. Unknown schemes yield `None`.
  pub fn from_scheme(scheme: &str) -> Option<Self> {
    match scheme {
      "ss" => Some(Self::Shadowsocks),
      "vmess" => Some(Self::Vmess),
      "vless" => Some(Self::Vless),
      _ => None,
    }
  }

  pub fn scheme(self) -> &'static str {
    match self {
      Self::Shadowsocks => "ss",
      Self::Vmess => "vmess",
      Self::Vless => "vless",
    }
  }

  /// Value of the `type` key in a Clash proxy entry.
  pub fn clash_type(self) -> &'static str {
    self.scheme()
  }
}

/// Fields every protocol carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
  pub tag: String,
  pub host: String,
  pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowsocksNode {
  #[serde(flatten)]
  pub endpoint: Endpoint,
  pub method: String,
  pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmessNode {
  #[serde(flatten)]
  pub endpoint: Endpoint,
  pub uuid: String,
  pub cipher: String,
  pub alter_id: i64,
  pub network: String,
  /// Header obfuscation hint. Kept for completeness, Clash output ignores it.
  pub camouflage: String,
  pub tls: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sni: Option<String>,
  /// `None` when the link had no `path` key at all.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VlessNode {
  #[serde(flatten)]
  pub endpoint: Endpoint,
  pub uuid: String,
  pub network: String,
  pub tls: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sni: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub flow: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fingerprint: Option<String>,
}

/// One decoded proxy server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ServerNode {
  #[serde(rename = "ss")]
  Shadowsocks(ShadowsocksNode),
  #[serde(rename = "vmess")]
  Vmess(VmessNode),
  #[serde(rename = "vless")]
  Vless(VlessNode),
}

impl ServerNode {
  pub fn protocol(&self) -> Protocol {
    match self {
      Self::Shadowsocks(_) => Protocol::Shadowsocks,
      Self::Vmess(_) => Protocol::Vmess,
      Self::Vless(_) => Protocol::Vless,
    }
  }

  pub fn endpoint(&self) -> &Endpoint {
    match self {
      Self::Shadowsocks(n) => &n.endpoint,
      Self::Vmess(n) => &n.endpoint,
      Self::Vless(n) => &n.endpoint,
    }
  }

  pub fn tag(&self) -> &str {
    &self.endpoint().tag
  }

  /// Password for shadowsocks, UUID for vmess and vless.
  pub fn credential(&self) -> &str {
    match self {
      Self::Shadowsocks(n) => &n.password,
      Self::Vmess(n) => &n.uuid,
      Self::Vless(n) => &n.uuid,
    }
  }
}
