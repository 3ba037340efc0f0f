//! HTTP 传输
//!
//! 服务端路由:
//! - `POST /watchdog/register`
//! - `POST /watchdog/nodes/{id}/renew`
//! - `GET /watchdog/nodes/{id}/alive`
//!
//! 客户端路由:
//! - `POST /watchdog/client/status-changes`
//!
//! 远程代理实现与进程内对象相同的 trait。注册请求携带客户端的回调地址，
//! 服务端据此构造 [`RemoteWatchdogClient`] 推送状态变化。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use darkstar_core::{SchedulerError, SchedulerResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api::{check_status_arrays, Registration, WatchdogClient, WatchdogServerApi};

pub const REGISTER_PATH: &str = "/watchdog/register";
pub const STATUS_CHANGES_PATH: &str = "/watchdog/client/status-changes";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct RegisterRequest {
    node_id: Option<u64>,
    host: String,
    callback_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AliveResponse {
    alive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusChangesRequest {
    ids: Vec<u64>,
    hosts: Vec<String>,
    alive: Vec<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(default)]
    node_id: Option<u64>,
}

struct TransportError(SchedulerError);

impl From<SchedulerError> for TransportError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let (status, code, node_id, message) = match &self.0 {
            SchedulerError::NodeAlreadyRegistered { id } => (
                StatusCode::CONFLICT,
                "NODE_ALREADY_REGISTERED",
                Some(*id),
                self.0.to_string(),
            ),
            SchedulerError::NodeRegistrationFailed { id, message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NODE_REGISTRATION_FAILED",
                Some(*id),
                message.clone(),
            ),
            SchedulerError::InvalidArgument(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                None,
                message.clone(),
            ),
            SchedulerError::IllegalState(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ILLEGAL_STATE",
                None,
                message.clone(),
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                None,
                other.to_string(),
            ),
        };

        let body = ErrorBody {
            error: code.to_string(),
            message,
            node_id,
        };
        (status, Json(body)).into_response()
    }
}

/// 把错误响应还原为调用方可识别的错误
fn error_from_response(status: StatusCode, body: Option<ErrorBody>) -> SchedulerError {
    let Some(body) = body else {
        return SchedulerError::Network(format!("HTTP {status}"));
    };
    let id = body.node_id.unwrap_or_default();
    match body.error.as_str() {
        "NODE_ALREADY_REGISTERED" => SchedulerError::NodeAlreadyRegistered { id },
        "NODE_REGISTRATION_FAILED" => SchedulerError::NodeRegistrationFailed {
            id,
            message: body.message,
        },
        "INVALID_ARGUMENT" => SchedulerError::InvalidArgument(body.message),
        "ILLEGAL_STATE" => SchedulerError::IllegalState(body.message),
        _ => SchedulerError::Internal(format!("HTTP {status}: {}", body.message)),
    }
}

fn network_error(err: reqwest::Error) -> SchedulerError {
    SchedulerError::Network(err.to_string())
}

async fn ensure_success(response: reqwest::Response) -> SchedulerResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ErrorBody>().await.ok();
    Err(error_from_response(status, body))
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> SchedulerResult<T> {
    ensure_success(response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| SchedulerError::Serialization(format!("无法解析响应: {e}")))
}

#[derive(Clone)]
struct ServerState {
    server: Arc<dyn WatchdogServerApi>,
    http: reqwest::Client,
}

/// 服务端路由
pub fn server_routes(server: Arc<dyn WatchdogServerApi>) -> Router {
    let state = ServerState {
        server,
        http: reqwest::Client::new(),
    };
    Router::new()
        .route(REGISTER_PATH, post(register_node))
        .route("/watchdog/nodes/{id}/renew", post(renew_node))
        .route("/watchdog/nodes/{id}/alive", get(is_alive))
        .with_state(state)
}

/// 客户端路由
pub fn client_routes(client: Arc<dyn WatchdogClient>) -> Router {
    Router::new()
        .route(STATUS_CHANGES_PATH, post(node_status_changes))
        .with_state(client)
}

async fn register_node(
    State(state): State<ServerState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Registration>, TransportError> {
    debug!(
        "收到节点注册请求: host={}, callback={}",
        request.host, request.callback_url
    );
    let client: Arc<dyn WatchdogClient> = Arc::new(RemoteWatchdogClient::with_http_client(
        request.callback_url,
        state.http.clone(),
    ));
    let registration = state
        .server
        .register_node(request.node_id, &request.host, client)
        .await?;
    Ok(Json(registration))
}

async fn renew_node(
    State(state): State<ServerState>,
    Path(id): Path<u64>,
) -> Result<Json<AliveResponse>, TransportError> {
    let alive = state.server.renew_node(id).await?;
    Ok(Json(AliveResponse { alive }))
}

async fn is_alive(
    State(state): State<ServerState>,
    Path(id): Path<u64>,
) -> Result<Json<AliveResponse>, TransportError> {
    let alive = state.server.is_alive(id).await?;
    Ok(Json(AliveResponse { alive }))
}

async fn node_status_changes(
    State(client): State<Arc<dyn WatchdogClient>>,
    Json(request): Json<StatusChangesRequest>,
) -> Result<StatusCode, TransportError> {
    client
        .node_status_changes(&request.ids, &request.hosts, &request.alive)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 运行中的 HTTP 监听端点，丢弃时停止
pub struct HttpEndpoint {
    name: &'static str,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HttpEndpoint {
    /// 绑定地址并开始服务，端口为 0 时使用随机端口
    pub async fn bind(
        name: &'static str,
        host: &str,
        port: u16,
        router: Router,
    ) -> SchedulerResult<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| SchedulerError::Network(format!("绑定地址失败 {host}:{port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SchedulerError::Network(format!("无法获取监听地址: {e}")))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("{}运行失败: {}", name, e);
            }
        });
        info!("{}启动在 http://{}", name, addr);

        Ok(Self { name, addr, handle })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// 以指定主机名对外公布的地址
    pub fn url_for_host(&self, host: &str) -> String {
        format!("http://{}:{}", host, self.addr.port())
    }

    pub fn stop(&self) {
        if !self.handle.is_finished() {
            self.handle.abort();
            info!("{}已停止", self.name);
        }
    }
}

impl Drop for HttpEndpoint {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn serve_server(
    server: Arc<dyn WatchdogServerApi>,
    host: &str,
    port: u16,
) -> SchedulerResult<HttpEndpoint> {
    HttpEndpoint::bind("看门狗服务端", host, port, server_routes(server)).await
}

pub async fn serve_client(
    client: Arc<dyn WatchdogClient>,
    host: &str,
    port: u16,
) -> SchedulerResult<HttpEndpoint> {
    HttpEndpoint::bind("看门狗客户端", host, port, client_routes(client)).await
}

/// 远程看门狗服务端代理
pub struct RemoteWatchdogServer {
    base_url: String,
    callback_url: String,
    http: reqwest::Client,
}

impl RemoteWatchdogServer {
    /// `callback_url` 为本节点客户端端点的地址，随注册请求发给服务端
    pub fn new(base_url: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            callback_url: callback_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl WatchdogServerApi for RemoteWatchdogServer {
    async fn register_node(
        &self,
        node_id: Option<u64>,
        host: &str,
        _client: Arc<dyn WatchdogClient>,
    ) -> SchedulerResult<Registration> {
        let request = RegisterRequest {
            node_id,
            host: host.to_string(),
            callback_url: self.callback_url.clone(),
        };
        let response = self
            .http
            .post(format!("{}{}", self.base_url, REGISTER_PATH))
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(network_error)?;
        read_json(response).await
    }

    async fn renew_node(&self, node_id: u64) -> SchedulerResult<bool> {
        let response = self
            .http
            .post(format!("{}/watchdog/nodes/{}/renew", self.base_url, node_id))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(network_error)?;
        let body: AliveResponse = read_json(response).await?;
        Ok(body.alive)
    }

    async fn is_alive(&self, node_id: u64) -> SchedulerResult<bool> {
        let response = self
            .http
            .get(format!("{}/watchdog/nodes/{}/alive", self.base_url, node_id))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(network_error)?;
        let body: AliveResponse = read_json(response).await?;
        Ok(body.alive)
    }
}

/// 远程看门狗客户端代理，服务端用它向节点推送状态变化
pub struct RemoteWatchdogClient {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteWatchdogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http_client(base_url, reqwest::Client::new())
    }

    pub fn with_http_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl WatchdogClient for RemoteWatchdogClient {
    async fn node_status_changes(
        &self,
        ids: &[u64],
        hosts: &[String],
        alive: &[bool],
    ) -> SchedulerResult<()> {
        check_status_arrays(ids, hosts, alive)?;
        let request = StatusChangesRequest {
            ids: ids.to_vec(),
            hosts: hosts.to_vec(),
            alive: alive.to_vec(),
        };
        let response = self
            .http
            .post(format!("{}{}", self.base_url, STATUS_CHANGES_PATH))
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(network_error)?;
        ensure_success(response).await?;
        Ok(())
    }
}
