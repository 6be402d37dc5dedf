//! Web tools: search and fetch.
//!
//! `web_search` queries a DuckDuckGo-compatible instant-answer endpoint;
//! `fetch_url` performs a plain GET. Both only talk HTTP(S).

use async_trait::async_trait;
use meshtalk_core::error::ToolError;
use meshtalk_core::tool::{ToolCategory, ToolContext, ToolHandler, ToolSpec, truncate_output};
use serde::Deserialize;

use crate::parse_args;

pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_num_results")]
    num_results: usize,
}

fn default_num_results() -> usize {
    5
}

/// Subset of the instant-answer response we read.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

/// Either a direct topic or a named group of topics.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelatedTopic {
    Topic {
        #[serde(rename = "Text")]
        text: String,
        #[serde(rename = "FirstURL")]
        first_url: String,
    },
    Group {
        #[serde(rename = "Topics")]
        topics: Vec<RelatedTopic>,
    },
}

fn flatten_topics(topics: Vec<RelatedTopic>, out: &mut Vec<(String, String)>) {
    for topic in topics {
        match topic {
            RelatedTopic::Topic { text, first_url } => out.push((text, first_url)),
            RelatedTopic::Group { topics } => flatten_topics(topics, out),
        }
    }
}

impl WebSearchTool {
    pub const NAME: &'static str = "web_search";

    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Search the web for information. Returns a summary and a list of relevant results with URLs.",
            ToolCategory::Web,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    },
                    "num_results": {
                        "type": "integer",
                        "description": "Number of results to return (default 5, max 10)",
                        "default": 5
                    }
                },
                "required": ["query"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for WebSearchTool {
    async fn call(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: SearchArgs = parse_args(arguments)?;
        let limit = args.num_results.clamp(1, 10);

        let response = self
            .client
            .get(format!("{}/", self.endpoint))
            .query(&[
                ("q", args.query.as_str()),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::failed(Self::NAME, format!("search endpoint returned {status}")));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, format!("invalid search response: {e}")))?;

        let mut results = Vec::new();
        flatten_topics(answer.related_topics, &mut results);

        let mut out = String::new();
        if !answer.abstract_text.is_empty() {
            if !answer.heading.is_empty() {
                out.push_str(&format!("## {}\n", answer.heading));
            }
            out.push_str(&answer.abstract_text);
            if !answer.abstract_url.is_empty() {
                out.push_str(&format!("\nSource: {}", answer.abstract_url));
            }
            out.push_str("\n\n");
        }
        for (i, (text, url)) in results.iter().take(limit).enumerate() {
            out.push_str(&format!("{}. {text}\n   {url}\n", i + 1));
        }

        if out.is_empty() {
            return Ok(format!("No results for '{}'", args.query));
        }
        Ok(out.trim_end().to_string())
    }
}

/// GET a URL and return its body as text.
pub struct FetchUrlTool {
    client: reqwest::Client,
    max_bytes: usize,
}

#[derive(Deserialize)]
struct FetchArgs {
    url: String,
}

impl FetchUrlTool {
    pub const NAME: &'static str = "fetch_url";

    pub fn new(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Fetch a URL with HTTP GET and return the status line and response body as text.",
            ToolCategory::Web,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "An http:// or https:// URL"
                    }
                },
                "required": ["url"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for FetchUrlTool {
    async fn call(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: FetchArgs = parse_args(arguments)?;
        if !args.url.starts_with("http://") && !args.url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "URL must start with http:// or https://".into(),
            ));
        }

        let response = self
            .client
            .get(&args.url)
            .send()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, e))?;

        if status.is_client_error() || status.is_server_error() {
            return Err(ToolError::failed(
                Self::NAME,
                format!("HTTP {status}\n{}", truncate_output(&body, 1024)),
            ));
        }
        Ok(format!("HTTP {status}\n\n{}", truncate_output(&body, self.max_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, routing::get};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn search_formats_abstract_and_topics() {
        let app = Router::new().route(
            "/",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("format").map(String::as_str), Some("json"));
                Json(json!({
                    "Heading": q.get("q").cloned().unwrap_or_default(),
                    "AbstractText": "A systems programming language.",
                    "AbstractURL": "https://www.rust-lang.org",
                    "RelatedTopics": [
                        {"Text": "Cargo - package manager", "FirstURL": "https://doc.rust-lang.org/cargo"},
                        {"Name": "Tools", "Topics": [
                            {"Text": "rustup - toolchain installer", "FirstURL": "https://rustup.rs"}
                        ]}
                    ]
                }))
            }),
        );
        let base = serve(app).await;

        let tool = WebSearchTool::new(reqwest::Client::new(), base);
        let out = tool
            .call(&ToolContext::default(), json!({"query": "Rust"}))
            .await
            .unwrap();
        assert!(out.starts_with("## Rust"));
        assert!(out.contains("Source: https://www.rust-lang.org"));
        assert!(out.contains("1. Cargo - package manager"));
        assert!(out.contains("2. rustup - toolchain installer"));
    }

    #[tokio::test]
    async fn search_with_nothing_found() {
        let app = Router::new().route("/", get(|| async { Json(json!({})) }));
        let tool = WebSearchTool::new(reqwest::Client::new(), serve(app).await);
        let out = tool
            .call(&ToolContext::default(), json!({"query": "zzzz"}))
            .await
            .unwrap();
        assert_eq!(out, "No results for 'zzzz'");
    }

    #[tokio::test]
    async fn fetch_returns_status_and_body() {
        let app = Router::new().route("/data", get(|| async { "plain body" }));
        let base = serve(app).await;

        let tool = FetchUrlTool::new(reqwest::Client::new(), 1024);
        let out = tool
            .call(&ToolContext::default(), json!({"url": format!("{base}/data")}))
            .await
            .unwrap();
        assert!(out.starts_with("HTTP 200"));
        assert!(out.ends_with("plain body"));
    }

    #[tokio::test]
    async fn fetch_truncates_large_bodies() {
        let app = Router::new().route("/big", get(|| async { "x".repeat(5000) }));
        let base = serve(app).await;

        let tool = FetchUrlTool::new(reqwest::Client::new(), 100);
        let out = tool
            .call(&ToolContext::default(), json!({"url": format!("{base}/big")}))
            .await
            .unwrap();
        assert!(out.contains("output truncated"));
        assert!(out.len() < 300);
    }

    #[tokio::test]
    async fn fetch_error_status_is_an_error() {
        let base = serve(Router::new()).await;
        let tool = FetchUrlTool::new(reqwest::Client::new(), 1024);
        let err = tool
            .call(&ToolContext::default(), json!({"url": format!("{base}/missing")}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_urls() {
        let tool = FetchUrlTool::new(reqwest::Client::new(), 1024);
        let err = tool
            .call(&ToolContext::default(), json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
