use std::time::Duration;

/// Supervisor 可调参数
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// 端口就绪等待
    pub ready_timeout: Duration,
    /// TUN 接口出现等待
    pub tun_ready_timeout: Duration,
    /// 旧 TUN 接口消失等待
    pub tun_absent_timeout: Duration,
    /// 优雅停止等待，超时后强杀
    pub stop_grace: Duration,
    /// 按地址探测 TUN 时，超过该时长才接受"看起来像 TUN"的旧接口
    pub tun_like_threshold: Duration,
    /// 内核日志单次读取上限
    pub kernel_log_chunk: u64,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            tun_ready_timeout: Duration::from_secs(10),
            tun_absent_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(10),
            tun_like_threshold: Duration::from_secs(2),
            kernel_log_chunk: 512 * 1024,
        }
    }
}
