use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::debug;

use crate::node::ServerNode;

/// Server ids in the order they should be tried by the fallback group.
pub const SERVERS_PRIORITY: [u32; 6] = [3, 5, 1, 2, 4, 801];

pub const AVAILABLE_GROUP: &str = "jms-available";
pub const MANUAL_GROUP: &str = "manual";

const FALLBACK_CHECK_URL: &str = "https://cp.cloudflare.com/";
const PROVIDER_CHECK_URL: &str = "https://cp.cloudflare.com/generate_204";
const CHECK_INTERVAL: u64 = 300;
const DEFAULT_SERVERNAME: &str = "example.com";

fn put(m: &mut Mapping, key: &str, value: impl Into<YamlValue>) {
  m.insert(YamlValue::from(key), value.into());
}

fn y_map_get<'a>(m: &'a Mapping, key: &str) -> Option<&'a YamlValue> {
  for (k, v) in m {
    if let Some(ks) = k.as_str() {
      if ks == key {
        return Some(v);
      }
    }
  }
  None
}

fn put_tls(m: &mut Mapping, tls: bool, sni: Option<&str>) {
  put(m, "tls", tls);
  if tls {
    put(m, "skip-cert-verify", true);
    let name = sni.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SERVERNAME);
    put(m, "servername", name);
  }
}

pub fn clash_proxy(node: &ServerNode) -> Mapping {
  let ep = node.endpoint();
  let mut m = Mapping::new();
  put(&mut m, "name", ep.tag.as_str());
  put(&mut m, "type", node.protocol().clash_type());
  put(&mut m, "server", ep.host.as_str());
  put(&mut m, "port", ep.port);

  match node {
    ServerNode::Shadowsocks(ss) => {
      put(&mut m, "cipher", ss.method.as_str());
      put(&mut m, "password", ss.password.as_str());
    }
    ServerNode::Vmess(v) => {
      put(&mut m, "cipher", v.cipher.as_str());
      put(&mut m, "uuid", v.uuid.as_str());
      put(&mut m, "alterId", v.alter_id);
      put(&mut m, "network", v.network.as_str());
      put_tls(&mut m, v.tls, v.sni.as_deref());
      if v.network == "grpc" {
        let mut grpc = Mapping::new();
        if let Some(path) = v.path.as_deref().filter(|p| !p.is_empty()) {
          put(&mut grpc, "grpc-service-name", path);
        }
        put(&mut m, "grpc-opts", grpc);
      }
    }
    ServerNode::Vless(v) => {
      put(&mut m, "uuid", v.uuid.as_str());
      if let Some(flow) = &v.flow {
        put(&mut m, "flow", flow.as_str());
      }
      let network = if v.network.is_empty() { "tcp" } else { v.network.as_str() };
      put(&mut m, "network", network);
      put_tls(&mut m, v.tls, v.sni.as_deref());
      if let Some(fp) = &v.fingerprint {
        put(&mut m, "client-fingerprint", fp.as_str());
      }
    }
  }
  m
}

/// Pulls `3` out of names shaped like `JP@xs3.example.net`.
pub fn server_id(name: &str) -> Option<u32> {
  let host = name.split('@').nth(1)?;
  let label = host.split('.').next()?;
  label.split('s').nth(1)?.trim().parse().ok()
}

/// Position of the name's server id in `table`; unmatched names rank last.
pub fn priority_rank(name: &str, table: &[u32]) -> usize {
  server_id(name)
    .and_then(|id| table.iter().position(|p| *p == id))
    .unwrap_or(table.len())
}

pub fn sort_by_priority(names: &mut [String], table: &[u32]) {
  names.sort_by_key(|n| priority_rank(n, table));
}

#[derive(Debug, Clone)]
pub struct ClashOptions {
  pub port: u16,
  pub allow_lan: bool,
  /// Emit Clash.Meta rule providers and geo rules.
  pub meta: bool,
}

fn health_checked_group(name: &str, kind: &str, url: &str) -> Mapping {
  let mut g = Mapping::new();
  put(&mut g, "name", name);
  put(&mut g, "type", kind);
  put(&mut g, "url", url);
  put(&mut g, "interval", CHECK_INTERVAL);
  g
}

fn string_seq<I, S>(items: I) -> YamlValue
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  YamlValue::Sequence(
    items
      .into_iter()
      .map(|s| YamlValue::String(s.into()))
      .collect(),
  )
}

/// Full Clash document with the servers behind a fallback group.
pub fn clash_config(servers: &[ServerNode], opts: &ClashOptions) -> Mapping {
  let proxies: Vec<YamlValue> = servers
    .iter()
    .map(|s| YamlValue::Mapping(clash_proxy(s)))
    .collect();
  let mut names: Vec<String> = servers.iter().map(|s| s.tag().to_string()).collect();
  sort_by_priority(&mut names, &SERVERS_PRIORITY);

  let mut available = health_checked_group(AVAILABLE_GROUP, "fallback", FALLBACK_CHECK_URL);
  put(&mut available, "proxies", string_seq(names));
  let mut manual = Mapping::new();
  put(&mut manual, "name", MANUAL_GROUP);
  put(&mut manual, "type", "select");
  put(&mut manual, "proxies", string_seq([AVAILABLE_GROUP]));

  let mut doc = Mapping::new();
  put(&mut doc, "allow-lan", opts.allow_lan);
  put(&mut doc, "port", opts.port);
  put(&mut doc, "socks-port", u32::from(opts.port) + 1);
  put(&mut doc, "mode", "rule");
  put(&mut doc, "log-level", "warning");
  put(&mut doc, "external-controller", "127.0.0.1:9090");
  put(&mut doc, "proxies", YamlValue::Sequence(proxies));
  put(
    &mut doc,
    "proxy-groups",
    YamlValue::Sequence(vec![available.into(), manual.into()]),
  );

  let fallthrough = format!("MATCH,{MANUAL_GROUP}");
  if opts.meta {
    let mut custom_direct = Mapping::new();
    put(&mut custom_direct, "type", "file");
    put(&mut custom_direct, "behavior", "classical");
    put(&mut custom_direct, "path", "./custom-direct.yaml");
    let mut providers = Mapping::new();
    put(&mut providers, "custom-direct", custom_direct);
    put(&mut doc, "rule-providers", providers);
    put(
      &mut doc,
      "rules",
      string_seq([
        "RULE-SET,custom-direct,DIRECT",
        "GEOSITE,cn,DIRECT",
        "GEOIP,CN,DIRECT",
        "GEOIP,LAN,DIRECT,no-resolve",
        fallthrough.as_str(),
      ]),
    );
    if opts.allow_lan {
      put(&mut doc, "bind-address", "*");
    }
  } else {
    put(&mut doc, "rules", string_seq([fallthrough]));
  }

  debug!(proxies = servers.len(), meta = opts.meta, "built clash config");
  doc
}

pub fn provider_document(servers: &[ServerNode]) -> Mapping {
  let proxies = servers
    .iter()
    .map(|s| YamlValue::Mapping(clash_proxy(s)))
    .collect();
  let mut doc = Mapping::new();
  put(&mut doc, "proxies", YamlValue::Sequence(proxies));
  doc
}

/// Points an existing Clash document at a provider file.
///
/// Registers `<name>-provider`, adds a url-test group `<name>` that uses it and
/// offers that group in the manual selector when one exists.
pub fn attach_provider(doc: &mut Mapping, provider_file_name: &str, name: &str) -> Result<()> {
  let provider_name = format!("{name}-provider");

  let mut health_check = Mapping::new();
  put(&mut health_check, "enable", true);
  put(&mut health_check, "url", PROVIDER_CHECK_URL);
  put(&mut health_check, "interval", CHECK_INTERVAL);
  let mut provider = Mapping::new();
  put(&mut provider, "type", "file");
  put(&mut provider, "path", format!("./{provider_file_name}"));
  put(&mut provider, "health-check", health_check);

  match doc.get_mut("proxy-providers").and_then(|v| v.as_mapping_mut()) {
    Some(providers) => put(providers, &provider_name, provider),
    None => {
      let mut providers = Mapping::new();
      put(&mut providers, &provider_name, provider);
      put(doc, "proxy-providers", providers);
    }
  }

  let groups = doc
    .get_mut("proxy-groups")
    .and_then(|v| v.as_sequence_mut())
    .ok_or_else(|| anyhow!("main config has no proxy-groups list"))?;

  let mut group = health_checked_group(name, "url-test", PROVIDER_CHECK_URL);
  put(&mut group, "use", string_seq([provider_name.as_str()]));
  groups.push(group.into());

  for g in groups.iter_mut() {
    let Some(m) = g.as_mapping_mut() else {
      continue;
    };
    if y_map_get(m, "name").and_then(|v| v.as_str()) != Some(MANUAL_GROUP) {
      continue;
    }
    match m.get_mut("proxies").and_then(|v| v.as_sequence_mut()) {
      Some(list) => list.push(YamlValue::from(name)),
      None => put(m, "proxies", string_seq([name])),
    }
    break;
  }
  Ok(())
}

pub fn read_yaml(path: &Path) -> Result<Mapping> {
  let text = std::fs::read_to_string(path)
    .with_context(|| format!("Can not load yaml from path: '{}'", path.display()))?;
  let doc: YamlValue = serde_yaml::from_str(&text)
    .with_context(|| format!("Can not parse yaml from path: '{}'", path.display()))?;
  match doc {
    YamlValue::Mapping(m) => Ok(m),
    _ => Err(anyhow!("Can not load yaml from path: '{}'", path.display())),
  }
}

pub fn write_yaml(path: &Path, doc: &Mapping) -> Result<()> {
  let text = serde_yaml::to_string(doc).context("serialize yaml")?;
  std::fs::write(path, text)
    .with_context(|| format!("Can not dump yaml to path: '{}'", path.display()))?;
  debug!(path = %path.display(), "wrote yaml");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::{Endpoint, ShadowsocksNode, VlessNode, VmessNode};

  fn endpoint(tag: &str) -> Endpoint {
    Endpoint {
      tag: tag.to_string(),
      host: "h.example".to_string(),
      port: 443,
    }
  }

  fn vmess_node(tls: bool, network: &str, path: Option<&str>) -> ServerNode {
    ServerNode::Vmess(VmessNode {
      endpoint: endpoint("vm"),
      uuid: "u".to_string(),
      cipher: "auto".to_string(),
      alter_id: 0,
      network: network.to_string(),
      camouflage: "none".to_string(),
      tls,
      sni: None,
      path: path.map(str::to_string),
    })
  }

  fn vless_node(tls: bool, fingerprint: Option<&str>) -> ServerNode {
    ServerNode::Vless(VlessNode {
      endpoint: endpoint("vl"),
      uuid: "u".to_string(),
      network: String::new(),
      tls,
      sni: Some("sni.example".to_string()),
      flow: Some(String::new()),
      fingerprint: fingerprint.map(str::to_string),
    })
  }

  fn keys(m: &Mapping) -> Vec<&str> {
    m.keys().filter_map(|k| k.as_str()).collect()
  }

  fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn shadowsocks_entry() {
    let node = ServerNode::Shadowsocks(ShadowsocksNode {
      endpoint: endpoint("ss"),
      method: "aes-256-gcm".to_string(),
      password: "pw".to_string(),
    });
    let m = clash_proxy(&node);
    assert_eq!(
      keys(&m),
      ["name", "type", "server", "port", "cipher", "password"]
    );
    assert_eq!(m["type"], "ss");
    assert_eq!(m["port"], 443);
    assert_eq!(m["password"], "pw");
  }

  #[test]
  fn vmess_tls_defaults_servername() {
    let m = clash_proxy(&vmess_node(true, "tcp", None));
    assert_eq!(m["tls"], true);
    assert_eq!(m["skip-cert-verify"], true);
    assert_eq!(m["servername"], "example.com");
    assert_eq!(m["cipher"], "auto");
    assert_eq!(m["uuid"], "u");
    assert_eq!(m["alterId"], 0);
    assert!(m.get("grpc-opts").is_none());
  }

  #[test]
  fn vmess_without_tls_omits_verify_fields() {
    let m = clash_proxy(&vmess_node(false, "ws", None));
    assert_eq!(m["tls"], false);
    assert!(m.get("skip-cert-verify").is_none());
    assert!(m.get("servername").is_none());
  }

  #[test]
  fn vmess_grpc_options() {
    let m = clash_proxy(&vmess_node(false, "grpc", Some("svc")));
    assert_eq!(m["grpc-opts"]["grpc-service-name"], "svc");

    let m = clash_proxy(&vmess_node(false, "grpc", None));
    let opts = m["grpc-opts"].as_mapping().unwrap();
    assert!(opts.is_empty());
  }

  #[test]
  fn vmess_grpc_empty_path_has_no_service_name() {
    let m = clash_proxy(&vmess_node(false, "grpc", Some("")));
    let opts = m["grpc-opts"].as_mapping().unwrap();
    assert!(opts.get("grpc-service-name").is_none());
    assert!(opts.is_empty());
  }

  #[test]
  fn vless_entry() {
    let m = clash_proxy(&vless_node(true, Some("chrome")));
    assert_eq!(m["type"], "vless");
    assert_eq!(m["flow"], "");
    assert_eq!(m["network"], "tcp");
    assert_eq!(m["servername"], "sni.example");
    assert_eq!(m["client-fingerprint"], "chrome");
    assert!(m.get("cipher").is_none());
    assert!(m.get("password").is_none());

    let m = clash_proxy(&vless_node(false, None));
    assert_eq!(m["tls"], false);
    assert!(m.get("skip-cert-verify").is_none());
    assert!(m.get("client-fingerprint").is_none());
  }

  #[test]
  fn server_id_extraction() {
    assert_eq!(server_id("a@xs3.y"), Some(3));
    assert_eq!(server_id("JMS-1@c88s801.portablesubmarines.com:443"), Some(801));
    assert_eq!(server_id("c@nomatch"), None);
    assert_eq!(server_id("no-at-sign"), None);
  }

  #[test]
  fn priority_sort_keeps_ranked_order() {
    let mut list = names(&["a@xs3.y", "b@xs5.y", "c@nomatch"]);
    sort_by_priority(&mut list, &SERVERS_PRIORITY);
    assert_eq!(list, names(&["a@xs3.y", "b@xs5.y", "c@nomatch"]));
  }

  #[test]
  fn priority_sort_reorders_and_is_stable() {
    let mut list = names(&["b@xs5.y", "z", "a@xs3.y", "y@xs9.y"]);
    sort_by_priority(&mut list, &SERVERS_PRIORITY);
    assert_eq!(list, names(&["a@xs3.y", "b@xs5.y", "z", "y@xs9.y"]));
    assert_eq!(priority_rank("z", &SERVERS_PRIORITY), SERVERS_PRIORITY.len());
  }

  #[test]
  fn config_document_shape() {
    let servers = vec![
      vmess_node(false, "tcp", None),
      ServerNode::Shadowsocks(ShadowsocksNode {
        endpoint: endpoint("x@s3.example"),
        method: "m".to_string(),
        password: "p".to_string(),
      }),
    ];
    let opts = ClashOptions {
      port: 1082,
      allow_lan: true,
      meta: false,
    };
    let doc = clash_config(&servers, &opts);
    assert_eq!(doc["socks-port"], 1083);
    assert_eq!(doc["proxies"].as_sequence().unwrap().len(), 2);
    let groups = doc["proxy-groups"].as_sequence().unwrap();
    assert_eq!(groups[0]["name"], AVAILABLE_GROUP);
    assert_eq!(groups[0]["proxies"][0], "x@s3.example");
    assert_eq!(groups[0]["proxies"][1], "vm");
    assert_eq!(groups[1]["proxies"][0], AVAILABLE_GROUP);
    assert_eq!(doc["rules"][0], "MATCH,manual");
    assert!(doc.get("bind-address").is_none());
  }

  #[test]
  fn meta_document_adds_rules() {
    let opts = ClashOptions {
      port: 7890,
      allow_lan: true,
      meta: true,
    };
    let doc = clash_config(&[], &opts);
    let rules = doc["rules"].as_sequence().unwrap();
    assert_eq!(rules.len(), 5);
    assert_eq!(rules[0], "RULE-SET,custom-direct,DIRECT");
    assert_eq!(rules[4], "MATCH,manual");
    assert_eq!(doc["bind-address"], "*");
    assert_eq!(doc["rule-providers"]["custom-direct"]["behavior"], "classical");
  }

  #[test]
  fn attach_provider_updates_groups() {
    let mut doc = clash_config(
      &[],
      &ClashOptions {
        port: 1082,
        allow_lan: false,
        meta: false,
      },
    );
    attach_provider(&mut doc, "extra.yaml", "extra").unwrap();

    let provider = &doc["proxy-providers"]["extra-provider"];
    assert_eq!(provider["path"], "./extra.yaml");
    assert_eq!(provider["health-check"]["enable"], true);

    let groups = doc["proxy-groups"].as_sequence().unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[2]["type"], "url-test");
    assert_eq!(groups[2]["use"][0], "extra-provider");
    assert_eq!(groups[1]["proxies"][1], "extra");
  }

  #[test]
  fn attach_provider_needs_groups() {
    let mut doc = Mapping::new();
    assert!(attach_provider(&mut doc, "p.yaml", "extra").is_err());
  }
}
