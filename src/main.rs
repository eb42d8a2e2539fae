use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use vea::api;
use vea::app::App;
use vea::common::fsutil;
use vea::config::{Paths, SupervisorOptions};
use vea::domain::EngineKind;

/// Vea 后端：管理代理内核的生命周期并提供本地 HTTP API
#[derive(Parser, Debug)]
#[command(name = "vea", version, about)]
struct Cli {
    /// HTTP 监听地址；`:port` 表示监听全部网卡
    #[arg(long, global = true, default_value = ":19080")]
    addr: String,

    /// 状态文件路径
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// 开发模式（默认 debug 日志）
    #[arg(long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 为 sing-box 配置 TUN 权限（Linux，需要 root）
    SetupTun(SetupTunArgs),

    /// 特权 helper（内部使用，由 pkexec 拉起）
    #[command(hide = true)]
    ResolvectlHelper(HelperArgs),

    /// resolvectl 替身（内部使用）
    #[command(hide = true)]
    ResolvectlShim {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct SetupTunArgs {
    /// sing-box 可执行文件，默认取 artifacts 中已安装的版本
    #[arg(long)]
    singbox_binary: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct HelperArgs {
    #[arg(long)]
    socket: PathBuf,
    #[arg(long)]
    uid: u32,
    #[arg(long, default_value_t = 0)]
    parent_pid: u32,
}

fn init_logging(dev: bool) {
    let default = if dev { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // 输出必须与真实 resolvectl 一致，不初始化日志
        Some(Commands::ResolvectlShim { args }) => {
            let code = vea::helper::shim::run_shim(args).await;
            std::process::exit(code);
        }
        Some(Commands::ResolvectlHelper(args)) => {
            init_logging(cli.dev);
            run_helper(args).await
        }
        Some(Commands::SetupTun(args)) => {
            init_logging(cli.dev);
            run_setup_tun(args, cli.state)
        }
        None => {
            init_logging(cli.dev);
            run_server(&cli.addr, cli.state).await
        }
    }
}

async fn run_server(addr: &str, state: Option<PathBuf>) -> Result<()> {
    let addr = api::parse_listen_addr(addr)?;
    let paths = Paths::resolve(state);
    info!(version = env!("CARGO_PKG_VERSION"), "vea starting");

    let app = App::bootstrap(paths, SupervisorOptions::default())
        .await
        .context("bootstrap")?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    };
    let served = api::serve(addr, Arc::clone(&app.facade), shutdown).await;
    app.shutdown().await;
    served
}

fn run_setup_tun(args: SetupTunArgs, state: Option<PathBuf>) -> Result<()> {
    let binary = match args.singbox_binary {
        Some(path) => path,
        None => {
            let dir = Paths::resolve(state).core_dir(EngineKind::SingBox);
            fsutil::find_binary_in_dir(&dir, &["sing-box", "sing-box.exe"])
                .ok_or_else(|| anyhow!("sing-box not found in {}", dir.display()))?
        }
    };
    vea::tun::setup::setup_tun_binary(&binary)?;
    println!("TUN capabilities configured for {}", binary.display());
    Ok(())
}

#[cfg(unix)]
async fn run_helper(args: HelperArgs) -> Result<()> {
    use vea::helper::server::{self, HelperServerConfig, SystemExecutor};

    server::run_helper(
        HelperServerConfig {
            socket: args.socket,
            uid: args.uid,
            parent_pid: args.parent_pid,
        },
        Arc::new(SystemExecutor),
    )
    .await
}

#[cfg(not(unix))]
async fn run_helper(_args: HelperArgs) -> Result<()> {
    Err(anyhow!("resolvectl-helper is only supported on Linux"))
}
