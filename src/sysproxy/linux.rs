//! GNOME gsettings 系统代理

use super::{argv, ProxyEndpoint, SystemProxyRequest};

pub const MISSING_GSETTINGS: &str = "gsettings 未找到：已保存设置，但无法切换系统代理";

const SCHEMA: &str = "org.gnome.system.proxy";

/// 生成要执行的 gsettings 命令
pub fn plan(req: &SystemProxyRequest) -> Vec<Vec<String>> {
    if !req.enabled {
        return vec![set(SCHEMA, "mode", "'none'")];
    }

    let mut cmds = vec![
        set(SCHEMA, "mode", "'manual'"),
        set(SCHEMA, "ignore-hosts", &gvariant_list(&req.ignore_hosts)),
    ];
    for (section, endpoint) in [
        ("http", &req.http),
        ("https", &req.https),
        ("socks", &req.socks),
    ] {
        let schema = format!("{}.{}", SCHEMA, section);
        match endpoint {
            Some(ProxyEndpoint { host, port }) if !host.is_empty() && *port != 0 => {
                cmds.push(set(&schema, "host", &gvariant_string(host)));
                cmds.push(set(&schema, "port", &port.to_string()));
            }
            _ => {
                cmds.push(set(&schema, "host", "''"));
                cmds.push(set(&schema, "port", "0"));
            }
        }
    }
    cmds
}

fn set(schema: &str, key: &str, value: &str) -> Vec<String> {
    argv(["gsettings", "set", schema, key, value])
}

fn gvariant_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `['a', 'b']`
pub fn gvariant_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| gvariant_string(s)).collect();
    format!("[{}]", quoted.join(", "))
}
