//! 前端设置的类型化视图
//!
//! 前端设置在持久化层保持为自由 JSON 对象，核心只读取其中少数几个键。

use serde_json::{Map, Value};

use crate::domain::EngineKind;

pub const KEY_DEFAULT_ENGINE: &str = "engine.defaultEngine";
pub const KEY_PROXY_PORT: &str = "proxy.port";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendSettingsView {
    /// None 表示未设置或为 auto
    pub default_engine: Option<EngineKind>,
    pub proxy_port: Option<u16>,
}

impl FrontendSettingsView {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let default_engine = map
            .get(KEY_DEFAULT_ENGINE)
            .and_then(Value::as_str)
            .and_then(EngineKind::parse)
            .filter(|e| !e.is_auto());

        let proxy_port = match map.get(KEY_PROXY_PORT) {
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        }
        .filter(|p| *p > 0);

        Self {
            default_engine,
            proxy_port,
        }
    }
}
