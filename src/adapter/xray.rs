//! Xray 适配器：JSON 配置，不支持 TUN

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{action_tag, parse_domain, parse_ip, CoreAdapter, DomainMatch, GeoFiles, IpMatch};
use crate::common::{Result, VeaError};
use crate::compiler::RuntimePlan;
use crate::domain::node::outbound_tag_for;
use crate::domain::{EngineKind, InboundMode, Node, NodeProtocol, ProxyConfig};

const PROTOCOLS: &[NodeProtocol] = &[
    NodeProtocol::Vless,
    NodeProtocol::Vmess,
    NodeProtocol::Trojan,
    NodeProtocol::Shadowsocks,
];

#[derive(Debug, Default, Clone, Copy)]
pub struct XrayAdapter;

#[async_trait]
impl CoreAdapter for XrayAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Xray
    }

    fn binary_names(&self) -> &'static [&'static str] {
        if cfg!(windows) {
            &["xray.exe", "xray"]
        } else {
            &["xray", "xray.exe"]
        }
    }

    fn supported_protocols(&self) -> &'static [NodeProtocol] {
        PROTOCOLS
    }

    fn supports_inbound(&self, mode: InboundMode) -> bool {
        !mode.is_tun()
    }

    fn build_config(&self, plan: &RuntimePlan, geo: &GeoFiles) -> Result<Vec<u8>> {
        let cfg = &plan.proxy_config;
        if cfg.inbound_mode.is_tun() {
            return Err(VeaError::invalid("xray does not support TUN inbound"));
        }

        let mut outbounds = Vec::with_capacity(plan.nodes.len() + 2);
        for node in &plan.nodes {
            let upstream = plan.compiled.detour.get(&node.id).map(String::as_str);
            outbounds.push(node_outbound(node, upstream)?);
        }
        outbounds.push(json!({"tag": "direct", "protocol": "freedom"}));
        outbounds.push(json!({
            "tag": "block",
            "protocol": "blackhole",
            "settings": {"response": {"type": "http"}}
        }));

        let dns_servers = cfg
            .dns_config
            .as_ref()
            .map(|d| d.remote_servers.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]);

        let config = json!({
            "log": {"loglevel": log_level(&cfg.log_level())},
            "inbounds": inbounds(cfg)?,
            "outbounds": outbounds,
            "routing": {
                "domainStrategy": "AsIs",
                "rules": routing_rules(plan, geo),
            },
            "dns": {"servers": dns_servers},
        });
        Ok(serde_json::to_vec_pretty(&config).map_err(anyhow::Error::from)?)
    }

    fn command_args(&self, config_path: &Path) -> Vec<String> {
        vec![
            "run".to_string(),
            "-c".to_string(),
            config_path.display().to_string(),
        ]
    }

    /// xray 按 XRAY_LOCATION_ASSET 查找 geoip.dat / geosite.dat
    fn process_env(&self, geo: &GeoFiles) -> Vec<(String, String)> {
        geo.geo_dir()
            .map(|dir| vec![("XRAY_LOCATION_ASSET".to_string(), dir.display().to_string())])
            .unwrap_or_default()
    }

    /// mixed 模式下 socks 在 port+1，只探测 http 口
    fn probe_port(&self, cfg: &ProxyConfig) -> u16 {
        cfg.inbound_port
    }
}

fn log_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => "debug",
        "warn" | "warning" => "warning",
        "error" => "error",
        "none" | "silent" => "none",
        _ => "info",
    }
}

fn sniffing() -> Value {
    json!({"enabled": true, "destOverride": ["http", "tls"]})
}

fn inbounds(cfg: &ProxyConfig) -> Result<Vec<Value>> {
    let port = cfg.inbound_port;
    if port == 0 {
        return Err(VeaError::invalid("inbound port is required"));
    }
    let auth = cfg.auth();

    let socks = |port: u16| {
        let mut settings = json!({"auth": "noauth", "udp": true});
        if let Some(a) = auth {
            settings["auth"] = json!("password");
            settings["accounts"] = json!([{"user": a.username, "pass": a.password}]);
        }
        json!({
            "tag": "socks-in",
            "listen": "127.0.0.1",
            "port": port,
            "protocol": "socks",
            "settings": settings,
            "sniffing": sniffing(),
        })
    };
    let http = |port: u16| {
        let mut settings = json!({"allowTransparent": false});
        if let Some(a) = auth {
            settings["accounts"] = json!([{"user": a.username, "pass": a.password}]);
        }
        json!({
            "tag": "http-in",
            "listen": "127.0.0.1",
            "port": port,
            "protocol": "http",
            "settings": settings,
            "sniffing": sniffing(),
        })
    };

    Ok(match cfg.inbound_mode {
        InboundMode::Socks => vec![socks(port)],
        InboundMode::Http => vec![http(port)],
        InboundMode::Mixed => {
            let socks_port = port
                .checked_add(1)
                .ok_or_else(|| VeaError::invalid("mixed inbound needs port+1 for socks"))?;
            vec![http(port), socks(socks_port)]
        }
        InboundMode::Tun => return Err(VeaError::invalid("xray does not support TUN inbound")),
    })
}

fn node_outbound(node: &Node, upstream: Option<&str>) -> Result<Value> {
    let sec = node.security();
    let settings = match node.protocol {
        NodeProtocol::Vless => {
            require(&sec.uuid, node, "uuid")?;
            let mut user = json!({
                "id": sec.uuid,
                "encryption": non_empty_or(&sec.encryption, "none"),
            });
            if !sec.flow.is_empty() {
                user["flow"] = json!(sec.flow);
            }
            json!({"vnext": [{"address": node.address, "port": node.port, "users": [user]}]})
        }
        NodeProtocol::Vmess => {
            require(&sec.uuid, node, "uuid")?;
            json!({"vnext": [{
                "address": node.address,
                "port": node.port,
                "users": [{
                    "id": sec.uuid,
                    "alterId": sec.alter_id,
                    "security": non_empty_or(&sec.method, "auto"),
                }],
            }]})
        }
        NodeProtocol::Trojan => {
            require(&sec.password, node, "password")?;
            json!({"servers": [{"address": node.address, "port": node.port, "password": sec.password}]})
        }
        NodeProtocol::Shadowsocks => {
            require(&sec.password, node, "password")?;
            require(&sec.method, node, "method")?;
            if !sec.plugin.trim().is_empty() {
                return Err(VeaError::invalid(format!(
                    "node {}: shadowsocks plugin requires sing-box",
                    node.name
                )));
            }
            json!({"servers": [{
                "address": node.address,
                "port": node.port,
                "method": sec.method,
                "password": sec.password,
            }]})
        }
        other => {
            return Err(VeaError::invalid(format!(
                "xray does not support protocol {} (node {})",
                other, node.name
            )))
        }
    };

    let mut out = json!({
        "tag": node.outbound_tag(),
        "protocol": node.protocol.as_str(),
        "settings": settings,
        "streamSettings": stream_settings(node),
        "mux": {"enabled": false, "concurrency": 8},
    });
    if let Some(up) = upstream {
        out["proxySettings"] = json!({"tag": outbound_tag_for(up)});
    }
    Ok(out)
}

fn stream_settings(node: &Node) -> Value {
    let mut stream = Map::new();
    let transport = node.transport.clone().unwrap_or_default();
    match transport.kind.to_ascii_lowercase().as_str() {
        "ws" | "websocket" => {
            let mut ws = json!({"path": non_empty_or(&transport.path, "/")});
            if !transport.host.is_empty() {
                ws["headers"] = json!({"Host": transport.host});
            }
            stream.insert("network".into(), json!("ws"));
            stream.insert("wsSettings".into(), ws);
        }
        "grpc" => {
            stream.insert("network".into(), json!("grpc"));
            stream.insert(
                "grpcSettings".into(),
                json!({"serviceName": transport.service_name}),
            );
        }
        "http" | "h2" => {
            let mut h = json!({"path": non_empty_or(&transport.path, "/")});
            if !transport.host.is_empty() {
                h["host"] = json!([transport.host]);
            }
            stream.insert("network".into(), json!("http"));
            stream.insert("httpSettings".into(), h);
        }
        _ => {
            stream.insert("network".into(), json!("tcp"));
            if transport.header_type.eq_ignore_ascii_case("http") {
                let mut request = json!({"path": [non_empty_or(&transport.path, "/")]});
                if !transport.host.is_empty() {
                    request["headers"] = json!({"Host": [transport.host]});
                }
                stream.insert(
                    "tcpSettings".into(),
                    json!({"header": {"type": "http", "request": request}}),
                );
            }
        }
    }

    if let Some(tls) = node.tls.as_ref().filter(|t| t.enabled) {
        let server_name = non_empty_or(&tls.server_name, &node.address);
        if tls.is_reality() {
            stream.insert("security".into(), json!("reality"));
            stream.insert(
                "realitySettings".into(),
                json!({
                    "serverName": server_name,
                    "fingerprint": non_empty_or(&tls.fingerprint, "chrome"),
                    "publicKey": tls.reality_public_key,
                    "shortId": tls.reality_short_id,
                }),
            );
        } else {
            let mut t = json!({"serverName": server_name, "allowInsecure": tls.insecure});
            if !tls.fingerprint.is_empty() {
                t["fingerprint"] = json!(tls.fingerprint);
            }
            let alpn = if tls.alpn.is_empty() {
                node.security().alpn
            } else {
                tls.alpn.clone()
            };
            if !alpn.is_empty() {
                t["alpn"] = json!(alpn);
            }
            stream.insert("security".into(), json!("tls"));
            stream.insert("tlsSettings".into(), t);
        }
    }
    Value::Object(stream)
}

fn routing_rules(plan: &RuntimePlan, geo: &GeoFiles) -> Vec<Value> {
    let mut rules = Vec::new();

    for rule in &plan.compiled.rules {
        let tag = action_tag(&rule.action);
        let domains: Vec<String> = rule
            .matcher
            .domains
            .iter()
            .filter_map(|d| parse_domain(d))
            .filter_map(|d| match d {
                DomainMatch::Geosite(v) => Some(format!("geosite:{}", v)),
                DomainMatch::Full(v) => Some(format!("full:{}", v)),
                DomainMatch::Suffix(v) => Some(format!("domain:{}", v)),
                DomainMatch::Keyword(v) => Some(format!("keyword:{}", v)),
                DomainMatch::Regex(v) => Some(format!("regexp:{}", v)),
                // geoip 误填在域名里时挪到 IP 规则
                DomainMatch::Geoip(_) => None,
            })
            .collect();
        let ips: Vec<String> = rule
            .matcher
            .ips
            .iter()
            .chain(rule.matcher.domains.iter().filter(|d| d.trim().starts_with("geoip:")))
            .filter_map(|i| parse_ip(i))
            .map(|i| match i {
                IpMatch::Private => "geoip:private".to_string(),
                IpMatch::Geoip(v) => format!("geoip:{}", v),
                IpMatch::Cidr(v) => v.to_string(),
            })
            .collect();

        // 同一条 field 规则里 domain 与 ip 是"与"关系，分开写成两条
        if !domains.is_empty() {
            rules.push(json!({"type": "field", "outboundTag": tag, "domain": domains}));
        }
        if !ips.is_empty() {
            rules.push(json!({"type": "field", "outboundTag": tag, "ip": ips}));
        }
    }

    if geo.geosite.is_some() {
        rules.push(json!({"type": "field", "outboundTag": "block", "domain": ["geosite:category-ads-all"]}));
        rules.push(json!({"type": "field", "outboundTag": "direct", "domain": ["geosite:cn", "geosite:private"]}));
    }
    if geo.geoip.is_some() {
        rules.push(json!({"type": "field", "outboundTag": "direct", "ip": ["geoip:cn", "geoip:private"]}));
    }
    rules.push(json!({
        "type": "field",
        "network": "tcp,udp",
        "outboundTag": action_tag(&plan.compiled.default),
    }));
    rules
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

fn non_empty_or<'a>(v: &'a str, fallback: &'a str) -> &'a str {
    if v.trim().is_empty() {
        fallback
    } else {
        v
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testutil::{plan, trojan_ws_node, vless_node};
    use crate::domain::Node;

    fn build(cfg: ProxyConfig, nodes: Vec<Node>, geo: &GeoFiles) -> Value {
        let plan = plan(EngineKind::Xray, cfg, nodes);
        let bytes = XrayAdapter.build_config(&plan, geo).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn mixed(port: u16) -> ProxyConfig {
        ProxyConfig {
            inbound_mode: InboundMode::Mixed,
            inbound_port: port,
            ..Default::default()
        }
    }

    #[test]
    fn mixed_inbound_is_http_plus_socks() {
        let v = build(mixed(1080), vec![vless_node("aaaaaaaa-1")], &GeoFiles::default());
        let inbounds = v["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["protocol"], "http");
        assert_eq!(inbounds[0]["port"], 1080);
        assert_eq!(inbounds[1]["protocol"], "socks");
        assert_eq!(inbounds[1]["port"], 1081);
        assert_eq!(inbounds[1]["settings"]["auth"], "noauth");
    }

    #[test]
    fn reality_vless_outbound() {
        let v = build(mixed(1080), vec![vless_node("aaaaaaaa-1")], &GeoFiles::default());
        let out = &v["outbounds"][0];
        assert_eq!(out["tag"], "node-aaaaaaaa");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["flow"], "xtls-rprx-vision");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["encryption"], "none");
        assert_eq!(out["streamSettings"]["security"], "reality");
        assert_eq!(out["streamSettings"]["realitySettings"]["publicKey"], "pubkey");
    }

    #[test]
    fn detour_and_user_rules() {
        let nodes = vec![vless_node("aaaaaaaa-1"), trojan_ws_node("bbbbbbbb-2")];
        let v = build(mixed(1080), nodes, &GeoFiles::default());

        let trojan = &v["outbounds"][1];
        assert_eq!(trojan["proxySettings"]["tag"], "node-aaaaaaaa");
        assert_eq!(trojan["streamSettings"]["network"], "ws");
        assert_eq!(trojan["streamSettings"]["wsSettings"]["headers"]["Host"], "cdn.example.com");

        let rules = v["routing"]["rules"].as_array().unwrap();
        assert_eq!(rules[0]["outboundTag"], "node-bbbbbbbb");
        assert_eq!(rules[0]["domain"], json!(["geosite:netflix", "full:api.example.com"]));
        assert_eq!(rules[1]["ip"], json!(["10.0.0.0/8", "geoip:private"]));
        // 无 geo 文件时只有兜底规则
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[2]["network"], "tcp,udp");
        assert_eq!(rules[2]["outboundTag"], "node-aaaaaaaa");
    }

    #[test]
    fn geo_defaults_follow_available_files() {
        let geo = GeoFiles {
            geoip: Some("/g/geoip.dat".into()),
            geosite: Some("/g/geosite.dat".into()),
            ..Default::default()
        };
        let v = build(mixed(1080), vec![vless_node("aaaaaaaa-1")], &geo);
        let rules = v["routing"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0]["outboundTag"], "block");
        assert_eq!(
            XrayAdapter.process_env(&geo),
            vec![("XRAY_LOCATION_ASSET".to_string(), "/g".to_string())]
        );
    }

    #[test]
    fn rejects_tun_and_singbox_protocols() {
        let mut cfg = mixed(1080);
        cfg.inbound_mode = InboundMode::Tun;
        let p = plan(EngineKind::Xray, cfg, vec![vless_node("aaaaaaaa-1")]);
        assert!(XrayAdapter.build_config(&p, &GeoFiles::default()).is_err());

        let mut hy2 = Node::new("hy", "h.example.com", 443, NodeProtocol::Hysteria2);
        hy2.id = "cccccccc-3".into();
        let p = plan(EngineKind::Xray, mixed(1080), vec![hy2]);
        let err = XrayAdapter.build_config(&p, &GeoFiles::default()).unwrap_err();
        assert!(err.to_string().contains("hysteria2"));
    }

    #[test]
    fn argv() {
        assert_eq!(
            XrayAdapter.command_args(Path::new("/c/config.json")),
            vec!["run", "-c", "/c/config.json"]
        );
        assert!(!XrayAdapter.supports_inbound(InboundMode::Tun));
    }
}
