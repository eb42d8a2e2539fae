// Style lints the codebase opts out of; correctness lints stay on.
#![allow(
    clippy::collapsible_if,
    clippy::field_reassign_with_default,
    clippy::large_enum_variant,
    clippy::new_without_default,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

//! Vea：代理内核（Xray / sing-box / mihomo）的生命周期管理
//!
//! 把用户的 FRouter 路由图编译成具体内核的配置，负责启动、切换、回滚与停止内核进程，
//! 并处理 TUN 权限、系统代理与状态持久化。

pub mod adapter;
pub mod api;
pub mod app;
pub mod common;
pub mod compiler;
pub mod config;
pub mod domain;
pub mod engine;
pub mod helper;
pub mod repository;
pub mod resources;
pub mod supervisor;
pub mod sysproxy;
pub mod tun;
