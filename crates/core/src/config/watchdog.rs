use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_PORT: u16 = 44533;
pub const DEFAULT_RENEW_INTERVAL_MS: u64 = 1000;
pub const MIN_RENEW_INTERVAL_MS: u64 = 5;
pub const MAX_RENEW_INTERVAL_MS: u64 = 10000;

/// 节点存活检测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// 是否在本节点启动看门狗服务端
    pub start_server: bool,
    /// 远程服务端主机（未启动本地服务端时使用）
    pub server_host: String,
    /// 服务端端口，0 表示随机端口
    pub server_port: u32,
    /// 节点续约间隔
    pub renew_interval_ms: u64,
    /// 客户端回调端口，0 表示随机端口
    pub client_port: u32,
    /// 对外公布的回调主机，缺省时使用本机主机名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            start_server: true,
            server_host: "localhost".to_string(),
            server_port: DEFAULT_SERVER_PORT as u32,
            renew_interval_ms: DEFAULT_RENEW_INTERVAL_MS,
            client_port: 0,
            client_host: None,
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_port > u16::MAX as u32 {
            return Err(anyhow::anyhow!(
                "服务端端口超出范围: {}，有效范围 0-65535",
                self.server_port
            ));
        }

        if self.client_port > u16::MAX as u32 {
            return Err(anyhow::anyhow!(
                "客户端端口超出范围: {}，有效范围 0-65535",
                self.client_port
            ));
        }

        if !(MIN_RENEW_INTERVAL_MS..=MAX_RENEW_INTERVAL_MS).contains(&self.renew_interval_ms) {
            return Err(anyhow::anyhow!(
                "续约间隔超出范围: {}ms，有效范围 {}-{}ms",
                self.renew_interval_ms,
                MIN_RENEW_INTERVAL_MS,
                MAX_RENEW_INTERVAL_MS
            ));
        }

        if !self.start_server && self.server_host.is_empty() {
            return Err(anyhow::anyhow!("未启动本地服务端时必须指定服务端主机"));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server_port as u16
    }

    pub fn client_port(&self) -> u16 {
        self.client_port as u16
    }
}
