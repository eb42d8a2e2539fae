//! macOS networksetup 系统代理

use super::{argv, ProxyEndpoint, SystemProxyRequest};

/// 解析 `networksetup -listallnetworkservices`，跳过说明行和已禁用（`*` 前缀）的服务
pub fn parse_services(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("An asterisk") && !l.starts_with('*'))
        .map(str::to_string)
        .collect()
}

pub fn plan(req: &SystemProxyRequest, services: &[String]) -> Vec<Vec<String>> {
    let sections: [(&str, &str, &Option<ProxyEndpoint>); 3] = [
        ("-setwebproxy", "-setwebproxystate", &req.http),
        ("-setsecurewebproxy", "-setsecurewebproxystate", &req.https),
        ("-setsocksfirewallproxy", "-setsocksfirewallproxystate", &req.socks),
    ];

    let mut cmds = Vec::new();
    for svc in services {
        for (set_cmd, state_cmd, endpoint) in sections {
            match endpoint {
                Some(ProxyEndpoint { host, port })
                    if req.enabled && !host.is_empty() && *port != 0 =>
                {
                    cmds.push(argv([
                        "networksetup",
                        set_cmd,
                        svc,
                        host,
                        &port.to_string(),
                    ]));
                    cmds.push(argv(["networksetup", state_cmd, svc, "on"]));
                }
                _ => cmds.push(argv(["networksetup", state_cmd, svc, "off"])),
            }
        }
        if req.enabled && !req.ignore_hosts.is_empty() {
            let mut cmd = argv(["networksetup", "-setproxybypassdomains", svc.as_str()]);
            cmd.extend(req.ignore_hosts.iter().cloned());
            cmds.push(cmd);
        }
    }
    cmds
}
