use async_trait::async_trait;
use darkstar_core::{BindingOp, DataStore, SchedulerError, SchedulerResult};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// SQLite 数据存储
///
/// 所有绑定存放在 `bindings` 表中，一次提交对应一个数据库事务。
pub struct SqliteDataStore {
    pool: SqlitePool,
}

/// SQLITE_BUSY / SQLITE_LOCKED 及其扩展码（低 8 位为主结果码）
fn is_transient_code(code: &str) -> bool {
    code.parse::<i32>()
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

fn map_sqlx_error(err: sqlx::Error) -> SchedulerError {
    let retryable = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| is_transient_code(&code)),
        _ => false,
    };
    SchedulerError::data_store(format!("SQLite操作失败: {err}"), retryable)
}

impl SqliteDataStore {
    /// 连接数据库并创建表结构
    pub async fn connect(url: &str, max_connections: u32) -> SchedulerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bindings (
                name TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!("SQLite数据存储表结构已就绪");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DataStore for SqliteDataStore {
    async fn get_binding(&self, name: &str) -> SchedulerResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM bindings WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Ok(Some(row.try_get("value").map_err(map_sqlx_error)?)),
            None => Ok(None),
        }
    }

    async fn bound_names(&self, prefix: &str) -> SchedulerResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM bindings WHERE substr(name, 1, $1) = $2 ORDER BY name",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(map_sqlx_error))
            .collect()
    }

    async fn commit(&self, ops: Vec<BindingOp>) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for op in &ops {
            match op {
                BindingOp::Set { name, value } => {
                    sqlx::query(
                        r#"
                        INSERT INTO bindings (name, value) VALUES ($1, $2)
                        ON CONFLICT(name) DO UPDATE SET value = excluded.value
                        "#,
                    )
                    .bind(name)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                }
                BindingOp::Remove { name } => {
                    sqlx::query("DELETE FROM bindings WHERE name = $1")
                        .bind(name)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!("提交 {} 个绑定修改", ops.len());
        Ok(())
    }
}
