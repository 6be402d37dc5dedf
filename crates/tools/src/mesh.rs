//! Mesh tools: discover and call services on the peer-to-peer mesh.
//!
//! Both talk to the local mesh node's HTTP gateway:
//! - `GET  {mesh_url}/services` lists the services peers advertise
//! - `POST {mesh_url}/call` invokes `{service, method, params}` and returns
//!   `{"result": ...}` or `{"error": "..."}`

use async_trait::async_trait;
use meshtalk_core::error::ToolError;
use meshtalk_core::tool::{ToolCategory, ToolContext, ToolHandler, ToolSpec};
use serde::{Deserialize, Serialize};

use crate::parse_args;

/// A service advertised on the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshService {
    pub name: String,
    /// Peer that hosts the service
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// The gateway may answer with a bare array or a wrapper object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ServiceListing {
    Bare(Vec<MeshService>),
    Wrapped { services: Vec<MeshService> },
}

pub struct MeshListServicesTool {
    client: reqwest::Client,
    gateway: String,
}

impl MeshListServicesTool {
    pub const NAME: &'static str = "mesh_list_services";

    pub fn new(client: reqwest::Client, gateway: impl Into<String>) -> Self {
        Self {
            client,
            gateway: gateway.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "List the services available on the peer-to-peer mesh, with the node hosting each \
             and the methods it exposes.",
            ToolCategory::Mesh,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "filter": {
                        "type": "string",
                        "description": "Only list services whose name contains this text"
                    }
                }
            }),
        )
    }
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    filter: Option<String>,
}

#[async_trait]
impl ToolHandler for MeshListServicesTool {
    async fn call(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ListArgs = parse_args(arguments)?;

        let response = self
            .client
            .get(format!("{}/services", self.gateway))
            .send()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, format!("mesh gateway unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::failed(Self::NAME, format!("mesh gateway returned {status}")));
        }

        let listing: ServiceListing = response
            .json()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, format!("invalid service listing: {e}")))?;
        let mut services = match listing {
            ServiceListing::Bare(s) | ServiceListing::Wrapped { services: s } => s,
        };
        if let Some(filter) = args.filter.as_deref().filter(|f| !f.is_empty()) {
            services.retain(|s| s.name.contains(filter));
        }

        if services.is_empty() {
            return Ok("No services found on the mesh".into());
        }

        let lines: Vec<String> = services
            .iter()
            .map(|s| {
                let mut line = s.name.clone();
                if !s.node.is_empty() {
                    line.push_str(&format!(" @ {}", s.node));
                }
                if !s.methods.is_empty() {
                    line.push_str(&format!(" [{}]", s.methods.join(", ")));
                }
                if !s.description.is_empty() {
                    line.push_str(&format!(" - {}", s.description));
                }
                line
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

pub struct MeshCallTool {
    client: reqwest::Client,
    gateway: String,
}

#[derive(Serialize, Deserialize)]
struct CallArgs {
    service: String,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct CallReply {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl MeshCallTool {
    pub const NAME: &'static str = "mesh_call";

    pub fn new(client: reqwest::Client, gateway: impl Into<String>) -> Self {
        Self {
            client,
            gateway: gateway.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Invoke a method on a mesh service (remote procedure call). Use mesh_list_services \
             first to discover services and methods.",
            ToolCategory::Mesh,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "service": { "type": "string", "description": "Service name" },
                    "method": { "type": "string", "description": "Method to invoke" },
                    "params": { "type": "object", "description": "Method parameters" }
                },
                "required": ["service", "method"]
            }),
        )
        .requiring_approval()
    }
}

#[async_trait]
impl ToolHandler for MeshCallTool {
    async fn call(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: CallArgs = parse_args(arguments)?;
        tracing::debug!(service = %args.service, method = %args.method, "Mesh call");

        let response = self
            .client
            .post(format!("{}/call", self.gateway))
            .json(&args)
            .send()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, format!("mesh gateway unreachable: {e}")))?;
        let status = response.status();
        let reply: CallReply = response.json().await.map_err(|e| {
            ToolError::failed(Self::NAME, format!("invalid reply ({status}): {e}"))
        })?;

        if let Some(error) = reply.error {
            return Err(ToolError::failed(
                Self::NAME,
                format!("{}.{}: {error}", args.service, args.method),
            ));
        }
        if !status.is_success() {
            return Err(ToolError::failed(Self::NAME, format!("mesh gateway returned {status}")));
        }

        match reply.result {
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(value) => serde_json::to_string_pretty(&value).map_err(|e| ToolError::failed(Self::NAME, e)),
            None => Ok("null".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::{get, post}};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn mock_gateway() -> String {
        let app = Router::new()
            .route(
                "/services",
                get(|| async {
                    Json(json!({"services": [
                        {"name": "weather", "node": "peer-a", "methods": ["forecast"], "description": "Local weather"},
                        {"name": "kv", "node": "peer-b", "methods": ["get", "put"]}
                    ]}))
                }),
            )
            .route(
                "/call",
                post(|Json(body): Json<serde_json::Value>| async move {
                    match (body["service"].as_str(), body["method"].as_str()) {
                        (Some("kv"), Some("get")) => Json(json!({"result": {"key": body["params"]["key"], "value": 42}})),
                        (Some("echo"), _) => Json(json!({"result": "pong"})),
                        _ => Json(json!({"error": "no such method"})),
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn lists_services() {
        let tool = MeshListServicesTool::new(reqwest::Client::new(), mock_gateway().await);
        let out = tool.call(&ToolContext::default(), json!({})).await.unwrap();
        assert!(out.contains("weather @ peer-a [forecast] - Local weather"));
        assert!(out.contains("kv @ peer-b [get, put]"));
    }

    #[tokio::test]
    async fn list_filter_applies() {
        let tool = MeshListServicesTool::new(reqwest::Client::new(), mock_gateway().await);
        let out = tool
            .call(&ToolContext::default(), json!({"filter": "kv"}))
            .await
            .unwrap();
        assert!(!out.contains("weather"));
        assert!(out.starts_with("kv"));
    }

    #[tokio::test]
    async fn call_returns_result() {
        let tool = MeshCallTool::new(reqwest::Client::new(), mock_gateway().await);
        let out = tool
            .call(
                &ToolContext::default(),
                json!({"service": "kv", "method": "get", "params": {"key": "answer"}}),
            )
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["value"], 42);
        assert_eq!(value["key"], "answer");

        let pong = tool
            .call(&ToolContext::default(), json!({"service": "echo", "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(pong, "pong");
    }

    #[tokio::test]
    async fn call_surfaces_remote_error() {
        let tool = MeshCallTool::new(reqwest::Client::new(), mock_gateway().await);
        let err = tool
            .call(&ToolContext::default(), json!({"service": "kv", "method": "drop"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kv.drop: no such method"));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_an_error() {
        let tool = MeshListServicesTool::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let err = tool.call(&ToolContext::default(), json!({})).await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }
}
