use anyhow::{anyhow, bail, Context, Result};
use hyper::{Body, Client, Method, Request};
use serde_json::{json, Value};

/// A thin JSON-RPC 2.0 client for the feesim-node service.
pub struct ApiClient {
    http: Client<hyper::client::HttpConnector>,
    url: String,
    timeout: std::time::Duration,
}

impl ApiClient {
    pub fn new(host: &str, port: u16) -> ApiClient {
        ApiClient {
            http: Client::new(),
            url: format!("http://{host}:{port}/"),
            timeout: std::time::Duration::from_secs(15),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        }))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Body::from(body))?;

        let resp = tokio::time::timeout(self.timeout, self.http.request(req))
            .await
            .context("request timed out")?
            .with_context(|| format!("is feesim-node running at {}?", self.url))?;
        let bytes = hyper::body::to_bytes(resp.into_body()).await?;
        let mut reply: Value = serde_json::from_slice(&bytes)?;
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            bail!(
                "{}",
                err.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown RPC error")
            );
        }
        reply
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| anyhow!("malformed RPC response"))
    }
}
