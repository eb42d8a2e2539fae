//! sing-box 适配器：JSON 配置，支持全部协议与 TUN
//!
//! 使用 1.11+ 的规则动作（sniff / hijack-dns / reject）与新版 DNS 服务器格式。
//! geosite / geoip 一律通过本地 `.srs` rule-set 引用。

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{
    action_tag, parse_domain, parse_ip, tun_requires_privileges, CoreAdapter, DomainMatch,
    GeoFiles, IpMatch,
};
use crate::common::{Result, VeaError};
use crate::compiler::{Action, RouteRule, RuntimePlan};
use crate::domain::node::outbound_tag_for;
use crate::domain::{EngineKind, InboundMode, Node, NodeProtocol, ProxyConfig, TunSettings};

const PROTOCOLS: &[NodeProtocol] = &[
    NodeProtocol::Vless,
    NodeProtocol::Vmess,
    NodeProtocol::Trojan,
    NodeProtocol::Shadowsocks,
    NodeProtocol::Hysteria2,
    NodeProtocol::Tuic,
];

/// 始终引用的 rule-set
pub const DEFAULT_RULE_SETS: &[&str] = &["geosite-category-ads-all", "geosite-cn", "geoip-cn"];

const DNS_LOCAL: &str = "dns-local";
const DNS_REMOTE: &str = "dns-remote";

#[derive(Debug, Default, Clone, Copy)]
pub struct SingBoxAdapter;

#[async_trait]
impl CoreAdapter for SingBoxAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::SingBox
    }

    fn binary_names(&self) -> &'static [&'static str] {
        if cfg!(windows) {
            &["sing-box.exe", "sing-box"]
        } else {
            &["sing-box", "sing-box.exe"]
        }
    }

    fn supported_protocols(&self) -> &'static [NodeProtocol] {
        PROTOCOLS
    }

    fn supports_inbound(&self, _mode: InboundMode) -> bool {
        true
    }

    fn build_config(&self, plan: &RuntimePlan, geo: &GeoFiles) -> Result<Vec<u8>> {
        let cfg = &plan.proxy_config;

        let mut outbounds = Vec::with_capacity(plan.nodes.len() + 2);
        for node in &plan.nodes {
            let upstream = plan.compiled.detour.get(&node.id).map(String::as_str);
            outbounds.push(node_outbound(node, upstream)?);
        }
        outbounds.push(json!({"type": "direct", "tag": "direct"}));
        if plan.compiled.default == Action::Block {
            outbounds.push(json!({"type": "block", "tag": "block"}));
        }

        let (route, tags) = route(plan, geo)?;
        let config = json!({
            "log": log(cfg),
            "dns": dns(plan, &tags),
            "inbounds": inbounds(cfg)?,
            "outbounds": outbounds,
            "route": route,
        });
        Ok(serde_json::to_vec_pretty(&config).map_err(anyhow::Error::from)?)
    }

    fn requires_privileges(&self, cfg: &ProxyConfig) -> bool {
        tun_requires_privileges(cfg)
    }

    fn command_args(&self, config_path: &Path) -> Vec<String> {
        vec![
            "run".to_string(),
            "-c".to_string(),
            config_path.display().to_string(),
        ]
    }
}

/// 从配置字节中提取 `route.rule_set[].tag`（仅 geosite-/geoip-）
pub fn extract_rule_set_tags(config: &[u8]) -> Result<Vec<String>> {
    let value: Value = serde_json::from_slice(config)
        .map_err(|e| VeaError::invalid(format!("parse sing-box config: {}", e)))?;
    let tags: BTreeSet<String> = value
        .pointer("/route/rule_set")
        .and_then(Value::as_array)
        .map(|sets| {
            sets.iter()
                .filter_map(|s| s.get("tag").and_then(Value::as_str))
                .map(str::trim)
                .filter(|t| t.starts_with("geosite-") || t.starts_with("geoip-"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(tags.into_iter().collect())
}

fn log(cfg: &ProxyConfig) -> Value {
    let lc = cfg.log_config.clone().unwrap_or_default();
    let level = match cfg.log_level().to_ascii_lowercase().as_str() {
        "warning" | "warn" => "warn",
        "none" | "silent" => return json!({"disabled": true}),
        "trace" => "trace",
        "debug" => "debug",
        "error" => "error",
        _ => "info",
    };
    let mut log = json!({"level": level, "timestamp": lc.timestamp});
    let output = lc.output.trim();
    if !output.is_empty() && output != "stdout" && output != "stderr" {
        log["output"] = json!(output);
    }
    log
}

fn inbounds(cfg: &ProxyConfig) -> Result<Vec<Value>> {
    if cfg.inbound_mode.is_tun() {
        let mut tun = cfg.tun();
        tun.fill_defaults();
        return Ok(vec![tun_inbound(&tun)]);
    }
    if cfg.inbound_port == 0 {
        return Err(VeaError::invalid("inbound port is required"));
    }
    let (kind, tag) = match cfg.inbound_mode {
        InboundMode::Socks => ("socks", "socks-in"),
        InboundMode::Http => ("http", "http-in"),
        _ => ("mixed", "mixed-in"),
    };
    let mut inbound = json!({
        "type": kind,
        "tag": tag,
        "listen": cfg.listen_address(),
        "listen_port": cfg.inbound_port,
    });
    if let Some(auth) = cfg.auth() {
        inbound["users"] = json!([{"username": auth.username, "password": auth.password}]);
    }
    Ok(vec![inbound])
}

fn tun_inbound(tun: &TunSettings) -> Value {
    let mut inbound = json!({
        "type": "tun",
        "tag": "tun-in",
        "interface_name": tun.interface_name,
        "mtu": tun.mtu,
        "address": tun.address,
        "auto_route": tun.auto_route,
        "strict_route": tun.strict_route,
        "stack": tun.stack,
    });
    if tun.auto_redirect && cfg!(target_os = "linux") {
        inbound["auto_redirect"] = json!(true);
    }
    if tun.endpoint_independent_nat {
        inbound["endpoint_independent_nat"] = json!(true);
    }
    if tun.udp_timeout > 0 {
        inbound["udp_timeout"] = json!(format_duration(tun.udp_timeout));
    }
    if !tun.route_address.is_empty() {
        inbound["route_address"] = json!(tun.route_address);
    }
    if !tun.route_exclude_address.is_empty() {
        inbound["route_exclude_address"] = json!(tun.route_exclude_address);
    }
    inbound
}

/// 秒数转为 sing-box 时长字符串，取能整除的最大单位
fn format_duration(secs: u32) -> String {
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

fn node_outbound(node: &Node, upstream: Option<&str>) -> Result<Value> {
    let sec = node.security();
    let mut out = json!({
        "type": node.protocol.as_str(),
        "tag": node.outbound_tag(),
        "server": node.address,
        "server_port": node.port,
    });

    match node.protocol {
        NodeProtocol::Vless => {
            require(&sec.uuid, node, "uuid")?;
            out["uuid"] = json!(sec.uuid);
            if !sec.flow.is_empty() {
                out["flow"] = json!(sec.flow);
            }
        }
        NodeProtocol::Vmess => {
            require(&sec.uuid, node, "uuid")?;
            out["uuid"] = json!(sec.uuid);
            out["alter_id"] = json!(sec.alter_id);
            let security = if sec.method.is_empty() { "auto" } else { sec.method.as_str() };
            out["security"] = json!(security);
        }
        NodeProtocol::Trojan => {
            require(&sec.password, node, "password")?;
            out["password"] = json!(sec.password);
        }
        NodeProtocol::Shadowsocks => {
            require(&sec.method, node, "method")?;
            require(&sec.password, node, "password")?;
            out["method"] = json!(sec.method);
            out["password"] = json!(sec.password);
            if !sec.plugin.trim().is_empty() {
                out["plugin"] = json!(sec.plugin.trim());
                out["plugin_opts"] = json!(sec.plugin_opts);
            }
        }
        NodeProtocol::Hysteria2 => {
            require(&sec.password, node, "password")?;
            out["password"] = json!(sec.password);
            out["up_mbps"] = json!(100);
            out["down_mbps"] = json!(100);
        }
        NodeProtocol::Tuic => {
            require(&sec.uuid, node, "uuid")?;
            out["uuid"] = json!(sec.uuid);
            out["password"] = json!(sec.password);
            out["congestion_control"] = json!("bbr");
        }
    }

    if let Some(tls) = tls(node) {
        out["tls"] = tls;
    }
    if let Some(transport) = transport(node) {
        out["transport"] = transport;
    }
    if let Some(up) = upstream {
        out["detour"] = json!(outbound_tag_for(up));
    }
    if node.address.parse::<std::net::IpAddr>().is_err() {
        out["domain_resolver"] = json!(DNS_LOCAL);
    }
    Ok(out)
}

fn tls(node: &Node) -> Option<Value> {
    // QUIC 系协议必须带 TLS
    let quic = matches!(node.protocol, NodeProtocol::Hysteria2 | NodeProtocol::Tuic);
    let tls = node.tls.clone().filter(|t| t.enabled || quic);
    if tls.is_none() && !quic {
        return None;
    }
    let tls = tls.unwrap_or_default();

    let server_name = if tls.server_name.trim().is_empty() {
        node.address.clone()
    } else {
        tls.server_name.clone()
    };
    let mut out = json!({"enabled": true, "server_name": server_name});
    if tls.insecure {
        out["insecure"] = json!(true);
    }
    let alpn = if tls.alpn.is_empty() {
        node.security().alpn
    } else {
        tls.alpn.clone()
    };
    if !alpn.is_empty() {
        out["alpn"] = json!(alpn);
    }

    let fingerprint = if tls.fingerprint.is_empty() && tls.is_reality() {
        "chrome".to_string()
    } else {
        tls.fingerprint.clone()
    };
    if !fingerprint.is_empty() {
        out["utls"] = json!({"enabled": true, "fingerprint": fingerprint});
    }
    if tls.is_reality() {
        out["reality"] = json!({
            "enabled": true,
            "public_key": tls.reality_public_key,
            "short_id": tls.reality_short_id,
        });
    }
    Some(out)
}

fn transport(node: &Node) -> Option<Value> {
    let t = node.transport.as_ref()?;
    let value = match t.kind.to_ascii_lowercase().as_str() {
        "ws" | "websocket" => {
            let path = if t.path.is_empty() { "/" } else { t.path.as_str() };
            let mut ws = json!({"type": "ws", "path": path});
            let mut headers = Map::new();
            for (k, v) in &t.headers {
                headers.insert(k.clone(), json!(v));
            }
            if !t.host.is_empty() {
                headers.insert("Host".into(), json!(t.host));
            }
            if !headers.is_empty() {
                ws["headers"] = Value::Object(headers);
            }
            ws
        }
        "grpc" => json!({"type": "grpc", "service_name": t.service_name}),
        "http" | "h2" => {
            let mut h = json!({"type": "http"});
            if !t.host.is_empty() {
                h["host"] = json!([t.host]);
            }
            if !t.path.is_empty() {
                h["path"] = json!(t.path);
            }
            h
        }
        "tcp" | "" if t.header_type.eq_ignore_ascii_case("http") => {
            let mut h = json!({"type": "http", "method": "GET"});
            if !t.host.is_empty() {
                h["host"] = json!([t.host]);
            }
            if !t.path.is_empty() {
                h["path"] = json!(t.path);
            }
            h
        }
        _ => return None,
    };
    Some(value)
}

fn push(m: &mut Map<String, Value>, key: &str, value: &str) {
    let entry = m.entry(key.to_string()).or_insert_with(|| json!([]));
    if let Some(arr) = entry.as_array_mut() {
        arr.push(json!(value));
    }
}

fn rule_target(action: &Action) -> Value {
    match action {
        Action::Block => json!({"action": "reject"}),
        other => json!({"outbound": action_tag(other)}),
    }
}

fn with_target(mut rule: Map<String, Value>, action: &Action) -> Value {
    if let Value::Object(target) = rule_target(action) {
        rule.extend(target);
    }
    Value::Object(rule)
}

/// 一条用户规则拆成域名规则与 IP 规则（同一条规则内不同字段是"与"关系）
fn user_rules(rule: &RouteRule, tags: &mut BTreeSet<String>) -> Result<Vec<Value>> {
    let mut domain = Map::new();

    for d in rule.matcher.domains.iter().filter_map(|d| parse_domain(d)) {
        match d {
            DomainMatch::Geosite(v) => {
                let tag = format!("geosite-{}", v.to_ascii_lowercase());
                push(&mut domain, "rule_set", &tag);
                tags.insert(tag);
            }
            DomainMatch::Geoip(v) => {
                return Err(VeaError::invalid(format!(
                    "edge {}: geoip:{} belongs in ips, not domains",
                    rule.edge_id, v
                )))
            }
            DomainMatch::Full(v) => push(&mut domain, "domain", v),
            DomainMatch::Suffix(v) => push(&mut domain, "domain_suffix", v),
            DomainMatch::Keyword(v) => push(&mut domain, "domain_keyword", v),
            DomainMatch::Regex(v) => push(&mut domain, "domain_regex", v),
        }
    }

    let mut ip = Map::new();
    for i in rule.matcher.ips.iter().filter_map(|i| parse_ip(i)) {
        match i {
            IpMatch::Private => {
                ip.insert("ip_is_private".into(), json!(true));
            }
            IpMatch::Geoip(v) => {
                let tag = format!("geoip-{}", v.to_ascii_lowercase());
                push(&mut ip, "rule_set", &tag);
                tags.insert(tag);
            }
            IpMatch::Cidr(v) => push(&mut ip, "ip_cidr", v),
        }
    }

    let mut out = Vec::new();
    if !domain.is_empty() {
        out.push(with_target(domain, &rule.action));
    }
    if !ip.is_empty() {
        out.push(with_target(ip, &rule.action));
    }
    Ok(out)
}

fn route(plan: &RuntimePlan, geo: &GeoFiles) -> Result<(Value, BTreeSet<String>)> {
    let cfg = &plan.proxy_config;
    let tun = cfg.inbound_mode.is_tun().then(|| cfg.tun());

    let mut rules = vec![json!({"action": "sniff"})];
    if tun.as_ref().map(|t| t.dns_hijack).unwrap_or(true) {
        rules.push(json!({"protocol": "dns", "action": "hijack-dns"}));
    }
    if tun.is_some() {
        rules.push(json!({"protocol": "quic", "action": "reject"}));
        rules.push(json!({"process_name": ["sing-box", "xray", "v2ray"], "outbound": "direct"}));
    }

    let mut tags: BTreeSet<String> = DEFAULT_RULE_SETS.iter().map(|s| s.to_string()).collect();
    tags.extend(plan.rule_set_tags.iter().cloned());
    for rule in &plan.compiled.rules {
        rules.extend(user_rules(rule, &mut tags)?);
    }

    rules.push(json!({"rule_set": ["geosite-category-ads-all"], "action": "reject"}));
    rules.push(json!({"ip_is_private": true, "outbound": "direct"}));
    rules.push(json!({"rule_set": ["geosite-cn"], "outbound": "direct"}));
    rules.push(json!({"rule_set": ["geoip-cn"], "outbound": "direct"}));

    let rule_set: Vec<Value> = tags
        .iter()
        .map(|tag| {
            json!({
                "tag": tag,
                "type": "local",
                "format": "binary",
                "path": geo.rule_set_dir.join(format!("{}.srs", tag)).display().to_string(),
            })
        })
        .collect();

    let route = json!({
        "rules": rules,
        "rule_set": rule_set,
        "final": action_tag(&plan.compiled.default),
        "auto_detect_interface": true,
        "default_domain_resolver": DNS_LOCAL,
    });
    Ok((route, tags))
}

/// `tls://1.1.1.1`、`https://dns.google/dns-query`、`8.8.8.8` 等
fn dns_server(tag: &str, spec: &str, default_type: &str) -> Value {
    let (kind, rest) = match spec.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => (default_type.to_string(), spec),
    };
    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, Some(format!("/{}", p))),
        None => (rest, None),
    };
    let mut server = json!({"tag": tag, "type": kind, "server": host});
    if let Some(p) = path.filter(|p| p != "/" && kind == "https") {
        server["path"] = json!(p);
    }
    server
}

fn dns(plan: &RuntimePlan, tags: &BTreeSet<String>) -> Value {
    let dns_cfg = plan.proxy_config.dns_config.clone().unwrap_or_default();
    let remote = dns_cfg
        .remote_servers
        .iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or("8.8.8.8");

    let mut remote_server = dns_server(DNS_REMOTE, remote, "tcp");
    if let Action::Node(id) = &plan.compiled.default {
        remote_server["detour"] = json!(outbound_tag_for(id));
    }

    let mut rules = Vec::new();
    if tags.contains("geosite-cn") {
        rules.push(json!({"rule_set": ["geosite-cn"], "server": DNS_LOCAL}));
    }

    let strategy = if dns_cfg.strategy.trim().is_empty() {
        "prefer_ipv4".to_string()
    } else {
        dns_cfg.strategy.trim().to_string()
    };

    json!({
        "servers": [
            {"tag": DNS_LOCAL, "type": "udp", "server": "223.5.5.5"},
            remote_server,
        ],
        "rules": rules,
        "strategy": strategy,
        "final": DNS_REMOTE,
    })
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
