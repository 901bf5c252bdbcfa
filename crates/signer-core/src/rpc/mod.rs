//! RPC backend (spec §4.4): one instance per active key, decrypting and
//! dispatching inbound NIP-46 requests and publishing signed responses.

pub mod backend;
pub mod connect;
pub mod methods;

pub use backend::RpcBackend;

/// `kind = 24133` per NIP-46.
pub const NIP46_KIND: u64 = 24133;

/// Parsed request body, `{id, method, params}` per spec §4.4.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Response body. `result` carries the success payload or, on the
/// `auth_url` variant, a sentinel string; `error` carries a message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcResponse {
    pub id: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self { id: id.into(), result: Some(result.into()), error: None }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), result: Some("error".into()), error: Some(message.into()) }
    }

    pub fn auth_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self { id: id.into(), result: Some("auth_url".into()), error: Some(url.into()) }
    }
}
