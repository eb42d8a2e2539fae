//! Clash / mihomo 适配器：YAML 配置

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::{parse_domain, parse_ip, tun_requires_privileges, CoreAdapter, DomainMatch, GeoFiles, IpMatch};
use crate::common::{Result, VeaError};
use crate::compiler::{Action, RuntimePlan};
use crate::domain::node::outbound_tag_for;
use crate::domain::proxy::{DEFAULT_TUN_ADDRESS, DEFAULT_TUN_MTU};
use crate::domain::{EngineKind, InboundMode, Node, NodeProtocol, ProxyConfig, TunSettings};

const PROTOCOLS: &[NodeProtocol] = &[
    NodeProtocol::Vless,
    NodeProtocol::Vmess,
    NodeProtocol::Trojan,
    NodeProtocol::Shadowsocks,
    NodeProtocol::Hysteria2,
    NodeProtocol::Tuic,
];

/// 与 fake-ip 段一致的 TUN 地址
pub const CLASH_TUN_ADDRESS: &str = "198.18.0.1/30";
const LINUX_TUN_MTU: u32 = 1500;

const GEO_BASE: &str = "https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release";
const BOOTSTRAP_DNS: &[&str] = &["223.5.5.5", "119.29.29.29", "1.1.1.1", "8.8.8.8"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClashDocument {
    mode: &'static str,
    log_level: &'static str,
    allow_lan: bool,
    bind_address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    authentication: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mixed_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    socks_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    geox_url: GeoxUrl,
    geo_auto_update: bool,
    geo_update_interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    find_process_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing_mark: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sniffer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tun: Option<ClashTun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<Value>,
    proxies: Vec<Value>,
    rules: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GeoxUrl {
    geoip: String,
    geosite: String,
    mmdb: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClashTun {
    enable: bool,
    stack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    inet4_address: Vec<String>,
    mtu: u32,
    auto_route: bool,
    auto_detect_interface: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    auto_redirect: bool,
    strict_route: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    endpoint_independent_nat: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    route_address: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    route_exclude_address: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dns_hijack: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClashAdapter;

#[async_trait]
impl CoreAdapter for ClashAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Clash
    }

    fn binary_names(&self) -> &'static [&'static str] {
        if cfg!(windows) {
            &["mihomo.exe", "clash.exe", "mihomo", "clash"]
        } else {
            &["mihomo", "mihomo.exe", "clash", "clash.exe"]
        }
    }

    fn supported_protocols(&self) -> &'static [NodeProtocol] {
        PROTOCOLS
    }

    fn supports_inbound(&self, _mode: InboundMode) -> bool {
        true
    }

    fn config_file_name(&self) -> &'static str {
        "config.yaml"
    }

    fn build_config(&self, plan: &RuntimePlan, _geo: &GeoFiles) -> Result<Vec<u8>> {
        let cfg = &plan.proxy_config;
        let tun_mode = cfg.inbound_mode.is_tun();
        let linux = cfg!(target_os = "linux");

        let listen = cfg.listen_address();
        let allow_lan = cfg.inbound_config.as_ref().map(|ic| ic.allow_lan).unwrap_or(false)
            || !is_loopback(&listen);

        let port = (cfg.inbound_port > 0).then_some(cfg.inbound_port);
        if !tun_mode && port.is_none() {
            return Err(VeaError::invalid("inbound port is required"));
        }
        let (mixed_port, socks_port, http_port) = match cfg.inbound_mode {
            InboundMode::Mixed | InboundMode::Tun => (port, None, None),
            InboundMode::Socks => (None, port, None),
            InboundMode::Http => (None, None, port),
        };

        let mut proxies = Vec::with_capacity(plan.nodes.len());
        for node in &plan.nodes {
            let upstream = plan.compiled.detour.get(&node.id).map(String::as_str);
            proxies.push(proxy(node, upstream)?);
        }

        let tun = tun_mode.then(|| {
            let mut t = cfg.tun();
            t.fill_defaults();
            tun_block(&t, linux)
        });

        let doc = ClashDocument {
            mode: "rule",
            log_level: log_level(&cfg.log_level()),
            allow_lan,
            bind_address: if allow_lan && is_loopback(&listen) {
                "0.0.0.0".to_string()
            } else {
                listen
            },
            authentication: cfg
                .auth()
                .map(|a| vec![format!("{}:{}", a.username, a.password)])
                .unwrap_or_default(),
            mixed_port,
            socks_port,
            port: http_port,
            geox_url: GeoxUrl {
                geoip: format!("{}/geoip.dat", GEO_BASE),
                geosite: format!("{}/geosite.dat", GEO_BASE),
                mmdb: format!("{}/geoip.metadb", GEO_BASE),
            },
            geo_auto_update: false,
            geo_update_interval: 24,
            find_process_mode: (tun_mode && linux).then_some("strict"),
            routing_mark: (tun_mode && linux).then_some(6666),
            profile: (tun_mode && linux)
                .then(|| json!({"store-selected": true, "store-fake-ip": true})),
            sniffer: tun_mode.then(sniffer),
            tun,
            dns: tun_mode.then(|| dns(cfg)),
            proxies,
            rules: rules(plan)?,
        };

        let yaml = serde_yml::to_string(&doc).map_err(anyhow::Error::from)?;
        Ok(yaml.into_bytes())
    }

    fn requires_privileges(&self, cfg: &ProxyConfig) -> bool {
        tun_requires_privileges(cfg)
    }

    fn command_args(&self, config_path: &Path) -> Vec<String> {
        let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        vec![
            "-d".to_string(),
            dir.display().to_string(),
            "-f".to_string(),
            config_path.display().to_string(),
        ]
    }

    /// Linux 上 mihomo 的 TUN 在大 MTU 下不稳定；地址与 fake-ip 段对齐
    fn tune(&self, cfg: &mut ProxyConfig) {
        if !cfg.inbound_mode.is_tun() {
            return;
        }
        let tun = cfg.tun_settings.get_or_insert_with(TunSettings::default);
        if cfg!(target_os = "linux") && (tun.mtu == DEFAULT_TUN_MTU || tun.mtu == 0) {
            tun.mtu = LINUX_TUN_MTU;
        }
        if tun.address.is_empty() || tun.address == [DEFAULT_TUN_ADDRESS.to_string()] {
            tun.address = vec![CLASH_TUN_ADDRESS.to_string()];
        }
    }

    /// TUN 模式下同样暴露 mixed-port
    fn probe_port(&self, cfg: &ProxyConfig) -> u16 {
        cfg.inbound_port
    }
}

fn log_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => "debug",
        "warn" | "warning" => "warning",
        "error" => "error",
        "none" | "silent" => "silent",
        _ => "info",
    }
}

fn is_loopback(addr: &str) -> bool {
    addr == "localhost"
        || addr
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn sniffer() -> Value {
    json!({
        "enable": true,
        "sniff": {
            "TLS": {"ports": [443]},
            "HTTP": {"ports": [80], "override-destination": true},
        },
    })
}

fn tun_block(tun: &TunSettings, linux: bool) -> ClashTun {
    let name = tun.interface_name.trim();
    // 非 Linux 上 utun 名称由系统分配，只有显式改名才下发
    let device = if linux || !(name.is_empty() || name == "tun0" || name == "vea") {
        Some(name.to_string()).filter(|n| !n.is_empty())
    } else {
        None
    };
    let inet4: Vec<String> = tun
        .address
        .iter()
        .filter(|a| !a.contains(':'))
        .cloned()
        .collect();

    ClashTun {
        enable: true,
        stack: tun.stack.clone(),
        device,
        inet4_address: if inet4.is_empty() {
            vec![CLASH_TUN_ADDRESS.to_string()]
        } else {
            inet4
        },
        mtu: tun.mtu,
        auto_route: tun.auto_route,
        auto_detect_interface: tun.auto_route,
        auto_redirect: linux && tun.auto_redirect,
        strict_route: tun.strict_route,
        endpoint_independent_nat: tun.endpoint_independent_nat,
        route_address: tun.route_address.clone(),
        route_exclude_address: tun.route_exclude_address.clone(),
        dns_hijack: if tun.dns_hijack {
            vec!["any:53".to_string(), "tcp://any:53".to_string()]
        } else {
            Vec::new()
        },
    }
}

fn dns(cfg: &ProxyConfig) -> Value {
    let remote: Vec<String> = cfg
        .dns_config
        .as_ref()
        .map(|d| {
            d.remote_servers
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let nameserver = if remote.is_empty() {
        vec![
            "https://doh.pub/dns-query".to_string(),
            "https://dns.alidns.com/dns-query".to_string(),
        ]
    } else {
        remote
    };
    json!({
        "enable": true,
        "listen": "0.0.0.0:1053",
        "ipv6": false,
        "enhanced-mode": "fake-ip",
        "fake-ip-range": "198.18.0.1/16",
        "fake-ip-filter": ["+.lan", "+.local", "time.*.com", "ntp.*.com"],
        "nameserver": nameserver,
        "default-nameserver": BOOTSTRAP_DNS,
        "proxy-server-nameserver": BOOTSTRAP_DNS,
        "direct-nameserver": BOOTSTRAP_DNS,
    })
}

fn proxy(node: &Node, upstream: Option<&str>) -> Result<Value> {
    let sec = node.security();
    let mut p = Map::new();
    p.insert("name".into(), json!(node.outbound_tag()));
    p.insert("server".into(), json!(node.address));
    p.insert("port".into(), json!(node.port));
    p.insert("udp".into(), json!(true));

    match node.protocol {
        NodeProtocol::Vless => {
            require(&sec.uuid, node, "uuid")?;
            p.insert("type".into(), json!("vless"));
            p.insert("uuid".into(), json!(sec.uuid));
            if !sec.flow.is_empty() {
                p.insert("flow".into(), json!(sec.flow));
            }
        }
        NodeProtocol::Vmess => {
            require(&sec.uuid, node, "uuid")?;
            p.insert("type".into(), json!("vmess"));
            p.insert("uuid".into(), json!(sec.uuid));
            p.insert("alterId".into(), json!(sec.alter_id));
            let cipher = if sec.method.is_empty() { "auto" } else { sec.method.as_str() };
            p.insert("cipher".into(), json!(cipher));
        }
        NodeProtocol::Trojan => {
            require(&sec.password, node, "password")?;
            p.insert("type".into(), json!("trojan"));
            p.insert("password".into(), json!(sec.password));
        }
        NodeProtocol::Shadowsocks => {
            require(&sec.method, node, "method")?;
            require(&sec.password, node, "password")?;
            p.insert("type".into(), json!("ss"));
            p.insert("cipher".into(), json!(sec.method));
            p.insert("password".into(), json!(sec.password));
            if let Some((plugin, opts)) = ss_plugin(&sec.plugin, &sec.plugin_opts) {
                p.insert("plugin".into(), json!(plugin));
                p.insert("plugin-opts".into(), opts);
            }
        }
        NodeProtocol::Hysteria2 => {
            require(&sec.password, node, "password")?;
            p.insert("type".into(), json!("hysteria2"));
            p.insert("password".into(), json!(sec.password));
        }
        NodeProtocol::Tuic => {
            require(&sec.uuid, node, "uuid")?;
            p.insert("type".into(), json!("tuic"));
            p.insert("uuid".into(), json!(sec.uuid));
            p.insert("password".into(), json!(sec.password));
            p.insert("congestion-controller".into(), json!("bbr"));
            p.insert("reduce-rtt".into(), json!(true));
            p.insert("request-timeout".into(), json!(8000));
            p.insert("udp-relay-mode".into(), json!("native"));
        }
    }

    transport(node, &mut p);
    tls(node, &mut p);
    if let Some(up) = upstream {
        p.insert("dialer-proxy".into(), json!(outbound_tag_for(up)));
    }
    Ok(Value::Object(p))
}

/// `obfs-local` / `simple-obfs` → obfs；其余插件按 `k=v;k=v` 原样展开
fn ss_plugin(plugin: &str, opts: &str) -> Option<(String, Value)> {
    let plugin = plugin.trim();
    if plugin.is_empty() {
        return None;
    }
    let mut fields = Map::new();
    for part in opts.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (k, v) = part.split_once('=').unwrap_or((part, "true"));
        fields.insert(k.trim().to_string(), json!(v.trim()));
    }

    if plugin == "obfs-local" || plugin == "simple-obfs" || plugin == "obfs" {
        let mode = fields.get("obfs").cloned().unwrap_or_else(|| json!("http"));
        let mut out = json!({"mode": mode});
        if let Some(host) = fields.get("obfs-host") {
            out["host"] = host.clone();
        }
        return Some(("obfs".to_string(), out));
    }
    Some((plugin.to_string(), Value::Object(fields)))
}

fn transport(node: &Node, p: &mut Map<String, Value>) {
    let Some(t) = node.transport.as_ref() else {
        if node.protocol == NodeProtocol::Vless {
            p.insert("network".into(), json!("tcp"));
        }
        return;
    };
    let path = if t.path.is_empty() { "/" } else { t.path.as_str() };
    match t.kind.to_ascii_lowercase().as_str() {
        "ws" | "websocket" => {
            let mut opts = json!({"path": path});
            if !t.host.is_empty() {
                opts["headers"] = json!({"Host": t.host});
            }
            p.insert("network".into(), json!("ws"));
            p.insert("ws-opts".into(), opts);
        }
        "grpc" => {
            p.insert("network".into(), json!("grpc"));
            p.insert(
                "grpc-opts".into(),
                json!({"grpc-service-name": t.service_name}),
            );
        }
        "http" | "h2" => {
            let mut opts = json!({"path": path});
            if !t.host.is_empty() {
                opts["host"] = json!([t.host]);
            }
            p.insert("network".into(), json!("h2"));
            p.insert("h2-opts".into(), opts);
        }
        _ if t.header_type.eq_ignore_ascii_case("http") => {
            let mut opts = json!({"path": [path]});
            if !t.host.is_empty() {
                opts["headers"] = json!({"Host": [t.host]});
            }
            p.insert("network".into(), json!("http"));
            p.insert("http-opts".into(), opts);
        }
        _ => {
            p.insert("network".into(), json!("tcp"));
        }
    }
}

fn tls(node: &Node, p: &mut Map<String, Value>) {
    let uses_sni = matches!(
        node.protocol,
        NodeProtocol::Trojan | NodeProtocol::Hysteria2 | NodeProtocol::Tuic
    );
    let Some(tls) = node.tls.as_ref().filter(|t| t.enabled) else {
        return;
    };
    if !tls.server_name.is_empty() {
        let key = if uses_sni { "sni" } else { "servername" };
        p.insert(key.into(), json!(tls.server_name));
    }
    if !uses_sni {
        p.insert("tls".into(), json!(true));
    }
    if tls.insecure {
        p.insert("skip-cert-verify".into(), json!(true));
    }
    let alpn = if tls.alpn.is_empty() {
        node.security().alpn
    } else {
        tls.alpn.clone()
    };
    if !alpn.is_empty() {
        p.insert("alpn".into(), json!(alpn));
    }
    if !tls.fingerprint.is_empty() {
        p.insert("client-fingerprint".into(), json!(tls.fingerprint));
    }
    if tls.is_reality() {
        p.insert(
            "reality-opts".into(),
            json!({"public-key": tls.reality_public_key, "short-id": tls.reality_short_id}),
        );
        if tls.fingerprint.is_empty() {
            p.insert("client-fingerprint".into(), json!("chrome"));
        }
    }
}

fn target(action: &Action) -> String {
    match action {
        Action::Node(id) => outbound_tag_for(id),
        Action::Direct => "DIRECT".to_string(),
        Action::Block => "REJECT".to_string(),
    }
}

fn rules(plan: &RuntimePlan) -> Result<Vec<String>> {
    let mut rules = Vec::new();
    if plan.proxy_config.inbound_mode.is_tun() {
        for process in ["mihomo", "clash", "vea"] {
            rules.push(format!("PROCESS-NAME,{},DIRECT", process));
        }
        rules.push("AND,((NETWORK,UDP),(DST-PORT,443)),REJECT".to_string());
    }

    for rule in &plan.compiled.rules {
        let to = target(&rule.action);
        for d in rule.matcher.domains.iter().filter_map(|d| parse_domain(d)) {
            let (kind, value) = match d {
                DomainMatch::Geosite(v) => ("GEOSITE", v),
                DomainMatch::Full(v) => ("DOMAIN", v),
                DomainMatch::Suffix(v) => ("DOMAIN-SUFFIX", v),
                DomainMatch::Keyword(v) => ("DOMAIN-KEYWORD", v),
                DomainMatch::Regex(v) => ("DOMAIN-REGEX", v),
                DomainMatch::Geoip(v) => {
                    return Err(VeaError::invalid(format!(
                        "edge {}: geoip:{} belongs in ips, not domains",
                        rule.edge_id, v
                    )))
                }
            };
            check_value(&rule.edge_id, value)?;
            rules.push(format!("{},{},{}", kind, value, to));
        }
        for i in rule.matcher.ips.iter().filter_map(|i| parse_ip(i)) {
            let line = match i {
                IpMatch::Private => format!("GEOIP,private,{},no-resolve", to),
                IpMatch::Geoip(v) => {
                    check_value(&rule.edge_id, v)?;
                    format!("GEOIP,{},{},no-resolve", v, to)
                }
                IpMatch::Cidr(v) => {
                    check_value(&rule.edge_id, v)?;
                    let v6 = v.contains(':');
                    let cidr = match (v.contains('/'), v6) {
                        (true, _) => v.to_string(),
                        (false, true) => format!("{}/128", v),
                        (false, false) => format!("{}/32", v),
                    };
                    let kind = if v6 { "IP-CIDR6" } else { "IP-CIDR" };
                    format!("{},{},{},no-resolve", kind, cidr, to)
                }
            };
            rules.push(line);
        }
    }

    rules.push("GEOSITE,category-ads-all,REJECT".to_string());
    rules.push("GEOIP,private,DIRECT,no-resolve".to_string());
    rules.push("GEOSITE,cn,DIRECT".to_string());
    rules.push("GEOIP,cn,DIRECT".to_string());
    rules.push(format!("MATCH,{}", target(&plan.compiled.default)));
    Ok(rules)
}

/// 规则以逗号分隔，值里不能再出现逗号
fn check_value(edge_id: &str, value: &str) -> Result<()> {
    if value.contains(',') || value.trim().is_empty() {
        return Err(VeaError::invalid(format!(
            "edge {}: invalid rule value {:?}",
            edge_id, value
        )));
    }
    Ok(())
}

fn require(value: &str, node: &Node, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(VeaError::invalid(format!(
            "node {}: {} {} is required",
            node.name, node.protocol, field
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
