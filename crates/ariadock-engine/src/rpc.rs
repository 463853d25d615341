//! JSON-RPC 2.0 client for the worker's HTTP interface.

use crate::error::RpcError;
use crate::task::Task;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const RPC_PATH: &str = "/jsonrpc";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Page size for the waiting and stopped lists.
pub const LIST_PAGE: usize = 1000;

/// Task fields requested by the list calls. Everything [`Task`] reads, plus
/// the few extras kept in archived snapshots.
pub const TASK_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "uploadSpeed",
    "dir",
    "files",
    "bittorrent",
    "errorCode",
    "errorMessage",
    "infoHash",
    "numSeeders",
    "connections",
    "followedBy",
    "following",
];

/// Where the worker's RPC interface listens and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
}

impl RpcEndpoint {
    pub fn local(port: u16, secret: Option<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}:{}{RPC_PATH}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}{RPC_PATH}", self.host, self.port)
    }

    /// Parameter list with the `token:` secret prepended when configured.
    pub fn params(&self, params: Vec<Value>) -> Vec<Value> {
        match &self.secret {
            Some(secret) => std::iter::once(Value::String(format!("token:{secret}")))
                .chain(params)
                .collect(),
            None => params,
        }
    }
}

/// Worker-wide transfer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStat {
    #[serde(default)]
    pub download_speed: String,
    #[serde(default)]
    pub upload_speed: String,
    #[serde(default)]
    pub num_active: String,
    #[serde(default)]
    pub num_waiting: String,
    #[serde(default)]
    pub num_stopped: String,
    #[serde(default)]
    pub num_stopped_total: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerVersion {
    pub version: String,
    #[serde(default)]
    pub enabled_features: Vec<String>,
}

/// The slice of the worker's RPC surface the reconciliation and session
/// components depend on.
pub trait WorkerApi: Send + Sync {
    fn tell_active(&self) -> impl Future<Output = Result<Vec<Task>, RpcError>> + Send;

    fn tell_waiting(
        &self,
        offset: usize,
        num: usize,
    ) -> impl Future<Output = Result<Vec<Task>, RpcError>> + Send;

    fn tell_stopped(
        &self,
        offset: usize,
        num: usize,
    ) -> impl Future<Output = Result<Vec<Task>, RpcError>> + Send;

    fn tell_status(&self, gid: &str) -> impl Future<Output = Result<Task, RpcError>> + Send;

    fn add_uri(
        &self,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<String, RpcError>> + Send;

    fn add_torrent(
        &self,
        torrent_b64: &str,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<String, RpcError>> + Send;

    fn remove(&self, gid: &str) -> impl Future<Output = Result<(), RpcError>> + Send;

    fn force_remove(&self, gid: &str) -> impl Future<Output = Result<(), RpcError>> + Send;

    fn pause(&self, gid: &str) -> impl Future<Output = Result<(), RpcError>> + Send;

    fn force_pause(&self, gid: &str) -> impl Future<Output = Result<(), RpcError>> + Send;

    fn unpause(&self, gid: &str) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Drop a finished task from the worker's history.
    fn remove_download_result(&self, gid: &str)
    -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Ask the worker to write its session file now.
    fn save_session(&self) -> impl Future<Output = Result<(), RpcError>> + Send;
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Deserialize)]
struct RpcFault {
    code: i64,
    #[serde(default)]
    message: String,
}

/// HTTP JSON-RPC client. The endpoint can be swapped when the worker is
/// restarted on a new port or secret.
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: RwLock<RpcEndpoint>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(endpoint: RpcEndpoint) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("ariadock/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: RwLock::new(endpoint),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> RpcEndpoint {
        self.endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_endpoint(&self, endpoint: RpcEndpoint) {
        let mut guard = self.endpoint.write().unwrap_or_else(|e| e.into_inner());
        if *guard != endpoint {
            tracing::info!(port = endpoint.port, "rpc endpoint updated");
            *guard = endpoint;
        }
    }

    /// Issue one `aria2.<method>` call.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let endpoint = self.endpoint();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": format!("aria2.{method}"),
            "params": endpoint.params(params),
        });

        // Error replies arrive with a non-2xx status and a JSON body, so the
        // status is not checked before decoding.
        let reply: RpcReply = self
            .http
            .post(endpoint.http_url())
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(fault) = reply.error {
            return Err(RpcError::Remote {
                code: fault.code,
                message: fault.message,
            });
        }
        let result = reply.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    pub async fn pause_all(&self) -> Result<(), RpcError> {
        self.call::<Value>("pauseAll", vec![]).await.map(drop)
    }

    pub async fn force_pause_all(&self) -> Result<(), RpcError> {
        self.call::<Value>("forcePauseAll", vec![]).await.map(drop)
    }

    pub async fn unpause_all(&self) -> Result<(), RpcError> {
        self.call::<Value>("unpauseAll", vec![]).await.map(drop)
    }

    pub async fn purge_download_result(&self) -> Result<(), RpcError> {
        self.call::<Value>("purgeDownloadResult", vec![])
            .await
            .map(drop)
    }

    pub async fn get_global_stat(&self) -> Result<GlobalStat, RpcError> {
        self.call("getGlobalStat", vec![]).await
    }

    pub async fn get_version(&self) -> Result<WorkerVersion, RpcError> {
        self.call("getVersion", vec![]).await
    }

    pub async fn get_global_option(&self) -> Result<BTreeMap<String, String>, RpcError> {
        self.call("getGlobalOption", vec![]).await
    }

    pub async fn change_global_option(
        &self,
        options: &BTreeMap<String, String>,
    ) -> Result<(), RpcError> {
        self.call::<Value>("changeGlobalOption", vec![json!(options)])
            .await
            .map(drop)
    }
}

impl WorkerApi for RpcClient {
    async fn tell_active(&self) -> Result<Vec<Task>, RpcError> {
        self.call("tellActive", vec![json!(TASK_KEYS)]).await
    }

    async fn tell_waiting(&self, offset: usize, num: usize) -> Result<Vec<Task>, RpcError> {
        self.call("tellWaiting", vec![json!(offset), json!(num), json!(TASK_KEYS)])
            .await
    }

    async fn tell_stopped(&self, offset: usize, num: usize) -> Result<Vec<Task>, RpcError> {
        self.call("tellStopped", vec![json!(offset), json!(num), json!(TASK_KEYS)])
            .await
    }

    async fn tell_status(&self, gid: &str) -> Result<Task, RpcError> {
        self.call("tellStatus", vec![json!(gid)]).await
    }

    async fn add_uri(
        &self,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<String, RpcError> {
        self.call("addUri", vec![json!(uris), json!(options)]).await
    }

    async fn add_torrent(
        &self,
        torrent_b64: &str,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<String, RpcError> {
        self.call(
            "addTorrent",
            vec![json!(torrent_b64), json!(uris), json!(options)],
        )
        .await
    }

    async fn remove(&self, gid: &str) -> Result<(), RpcError> {
        self.call::<Value>("remove", vec![json!(gid)]).await.map(drop)
    }

    async fn force_remove(&self, gid: &str) -> Result<(), RpcError> {
        self.call::<Value>("forceRemove", vec![json!(gid)])
            .await
            .map(drop)
    }

    async fn pause(&self, gid: &str) -> Result<(), RpcError> {
        self.call::<Value>("pause", vec![json!(gid)]).await.map(drop)
    }

    async fn force_pause(&self, gid: &str) -> Result<(), RpcError> {
        self.call::<Value>("forcePause", vec![json!(gid)])
            .await
            .map(drop)
    }

    async fn unpause(&self, gid: &str) -> Result<(), RpcError> {
        self.call::<Value>("unpause", vec![json!(gid)]).await.map(drop)
    }

    async fn remove_download_result(&self, gid: &str) -> Result<(), RpcError> {
        self.call::<Value>("removeDownloadResult", vec![json!(gid)])
            .await
            .map(drop)
    }

    async fn save_session(&self) -> Result<(), RpcError> {
        self.call::<Value>("saveSession", vec![]).await.map(drop)
    }
}
