use serde::{Deserialize, Serialize};

/// 持久化存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    pub backend: DataStoreBackend,
    pub url: String,
    pub max_connections: u32,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            backend: DataStoreBackend::Memory,
            url: "sqlite://darkstar.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl DataStoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == DataStoreBackend::Sqlite {
            if self.url.is_empty() {
                return Err(anyhow::anyhow!("数据库URL不能为空"));
            }
            if !self.url.starts_with("sqlite:") {
                return Err(anyhow::anyhow!("无效的SQLite连接URL: {}", self.url));
            }
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        Ok(())
    }
}
