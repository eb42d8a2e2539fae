//! Windows 系统代理：写 Internet Settings 注册表（经 reg.exe）

use super::{argv, ProxyEndpoint, SystemProxyRequest};
use crate::common::{Result, VeaError};

const INTERNET_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// INTERNET_OPTION_SETTINGS_CHANGED / INTERNET_OPTION_REFRESH
const NOTIFY_OPTIONS: [&str; 2] = ["39", "37"];

pub fn plan(req: &SystemProxyRequest) -> Result<Vec<Vec<String>>> {
    if !req.enabled {
        return Ok(vec![
            reg_set_dword("ProxyEnable", 0),
            reg_set_string("ProxyServer", ""),
            reg_set_string("ProxyOverride", ""),
        ]);
    }
    let server = proxy_server(req);
    if server.is_empty() {
        return Err(VeaError::invalid("no proxy endpoint to enable"));
    }
    Ok(vec![
        reg_set_string("ProxyServer", &server),
        reg_set_string("ProxyOverride", &req.ignore_hosts.join(";")),
        reg_set_dword("ProxyEnable", 1),
    ])
}

/// `http=h:p;https=h:p;socks=h:p`，只包含已设置的分项
pub fn proxy_server(req: &SystemProxyRequest) -> String {
    [("http", &req.http), ("https", &req.https), ("socks", &req.socks)]
        .into_iter()
        .filter_map(|(scheme, ep)| match ep {
            Some(ProxyEndpoint { host, port }) if !host.is_empty() && *port != 0 => {
                Some(format!("{}={}:{}", scheme, host, port))
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn reg_set_dword(name: &str, value: u32) -> Vec<String> {
    argv([
        "reg",
        "add",
        INTERNET_SETTINGS_KEY,
        "/v",
        name,
        "/t",
        "REG_DWORD",
        "/d",
        &value.to_string(),
        "/f",
    ])
}

fn reg_set_string(name: &str, value: &str) -> Vec<String> {
    argv([
        "reg",
        "add",
        INTERNET_SETTINGS_KEY,
        "/v",
        name,
        "/t",
        "REG_SZ",
        "/d",
        value,
        "/f",
    ])
}

/// 让 WinINet 重新读取代理设置；经 rundll32 调 InternetSetOptionW
#[cfg_attr(not(windows), allow(dead_code))]
pub fn notify_settings_changed() {
    for option in NOTIFY_OPTIONS {
        let _ = crate::common::platform::hidden_command("rundll32")
            .args(["wininet.dll,InternetSetOptionW", "0", option, "0", "0"])
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_lists_only_set_sections() {
        let req = SystemProxyRequest {
            enabled: true,
            http: Some(ProxyEndpoint::new("127.0.0.1", 1081)),
            https: None,
            socks: Some(ProxyEndpoint::new("127.0.0.1", 1080)),
            ignore_hosts: vec![],
        };
        assert_eq!(proxy_server(&req), "http=127.0.0.1:1081;socks=127.0.0.1:1080");
    }

    #[test]
    fn enable_without_endpoint_is_rejected() {
        let req = SystemProxyRequest {
            enabled: true,
            ..Default::default()
        };
        assert!(plan(&req).is_err());
    }

    #[test]
    fn disable_clears_values() {
        let cmds = plan(&SystemProxyRequest::disabled()).unwrap();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains(&"ProxyEnable".to_string()));
        assert_eq!(cmds[0][8], "0");
    }

    #[test]
    fn override_joins_with_semicolon() {
        let req = SystemProxyRequest {
            enabled: true,
            http: Some(ProxyEndpoint::new("127.0.0.1", 1081)),
            ignore_hosts: vec!["localhost".into(), "127.0.0.0/8".into()],
            ..Default::default()
        };
        let cmds = plan(&req).unwrap();
        assert_eq!(cmds[1][8], "localhost;127.0.0.0/8");
    }
}
