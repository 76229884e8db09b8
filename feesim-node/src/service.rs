//! The application's JSON-RPC 2.0 service, exposing fee estimates and
//! controls over HTTP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bitcoin::Amount;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tracing::{error, info};

use sim::RateFnPoints;

use crate::config::Config;
use crate::feesim::FeeSim;

const DEFAULT_APPROX_POINTS: usize = 20;

#[derive(Debug, serde::Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

pub struct Service {
    pub feesim: Arc<FeeSim>,
    pub cfg: Config,
    /// Toggles debug-level logging at runtime.
    pub set_debug: Box<dyn Fn(bool) + Send + Sync>,
}

impl Service {
    /// Serve until the process shuts down.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        use std::net::ToSocketAddrs;
        let addr: SocketAddr = format!("{}:{}", self.cfg.app_rpc.host, self.cfg.app_rpc.port)
            .to_socket_addrs()
            .context("invalid RPC listen address")?
            .next()
            .context("RPC listen address resolved to nothing")?;

        let service = Arc::clone(&self);
        let make_svc = make_service_fn(move |_conn| {
            let service = Arc::clone(&service);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, Arc::clone(&service))
                }))
            }
        });

        info!("RPC server listening on {addr}");
        Server::bind(&addr)
            .serve(make_svc)
            .await
            .context("RPC server")?;
        Ok(())
    }

    fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, String> {
        match method {
            "stop" => {
                self.feesim.stop();
                Ok(Value::Null)
            }
            "status" => Ok(json!(self.feesim.status())),
            "estimatefee" => self.estimate_fee(params),
            "predictscores" => {
                let (attained, exceeded) =
                    self.feesim.predict_scores().map_err(|e| e.to_string())?;
                Ok(json!({"attained": attained, "exceeded": exceeded}))
            }
            "txrate" => {
                let n = approx_points(params)?;
                let src = self.feesim.tx_source().map_err(|e| e.to_string())?;
                Ok(json!(RateFnPoints::from(src.rate_fn().approx(n))))
            }
            "caprate" => {
                let n = approx_points(params)?;
                let src = self.feesim.block_source().map_err(|e| e.to_string())?;
                Ok(json!(RateFnPoints::from(src.rate_fn().approx(n))))
            }
            "mempoolsize" => {
                let n = approx_points(params)?;
                let state = self
                    .feesim
                    .state()
                    .ok_or_else(|| "mempool not available".to_string())?;
                Ok(json!(RateFnPoints::from(state.size_fn().approx(n))))
            }
            "mempoolstate" => {
                let state = self
                    .feesim
                    .state()
                    .ok_or_else(|| "mempool not available".to_string())?;
                Ok(serde_json::to_value(state).map_err(|e| e.to_string())?)
            }
            "txsource" => {
                let src = self.feesim.tx_source().map_err(|e| e.to_string())?;
                Ok(src.describe())
            }
            "blocksource" => {
                let src = self.feesim.block_source().map_err(|e| e.to_string())?;
                Ok(src.describe())
            }
            "pause" => {
                self.pause(true);
                Ok(Value::Null)
            }
            "unpause" => {
                self.pause(false);
                Ok(Value::Null)
            }
            "setdebug" => {
                let on = params
                    .as_ref()
                    .and_then(first_param)
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| "setdebug takes a boolean".to_string())?;
                (self.set_debug)(on);
                Ok(json!(on))
            }
            "config" => {
                let mut cfg = serde_json::to_value(&self.cfg).map_err(|e| e.to_string())?;
                // Never echo credentials.
                if let Some(rpc) = cfg.get_mut("bitcoin_rpc") {
                    rpc["password"] = json!("********");
                }
                Ok(cfg)
            }
            "metrics" => Ok(self.feesim.timers.snapshot()),
            _ => Err(format!("unknown method '{method}'")),
        }
    }

    /// The estimatefee result, converted to BTC/kB floats to match the
    /// Bitcoin Core API; -1 passes through as "no fee achieves this".
    fn estimate_fee(&self, params: Option<Value>) -> Result<Value, String> {
        let result = self.feesim.result().map_err(|e| e.to_string())?;
        let n = match params.as_ref().and_then(first_param) {
            Some(v) => v
                .as_i64()
                .ok_or_else(|| "argument must be an integer".to_string())?,
            None => 0,
        };
        if n < 0 {
            return Err("argument must be >= 0".to_string());
        }
        if n as usize > result.len() {
            return Err(format!("MaxBlockConfirms={} exceeded", result.len()));
        }

        let btc: Vec<f64> = result
            .iter()
            .map(|&sat_per_kb| {
                if sat_per_kb == -1 {
                    -1.0
                } else {
                    Amount::from_sat(sat_per_kb as u64).to_btc()
                }
            })
            .collect();
        if n == 0 {
            Ok(json!(btc))
        } else {
            Ok(json!(btc[n as usize - 1]))
        }
    }

    fn pause(&self, p: bool) {
        let feesim = Arc::clone(&self.feesim);
        tokio::spawn(async move { feesim.pause(p).await });
    }
}

fn first_param(params: &Value) -> Option<&Value> {
    match params {
        Value::Array(a) => a.first(),
        Value::Null => None,
        v => Some(v),
    }
}

fn approx_points(params: Option<Value>) -> Result<usize, String> {
    match params.as_ref().and_then(first_param) {
        None => Ok(DEFAULT_APPROX_POINTS),
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| "argument must be an integer".to_string())?;
            if n <= 0 {
                Ok(DEFAULT_APPROX_POINTS)
            } else {
                Ok(n as usize)
            }
        }
    }
}

async fn handle_request(
    req: Request<Body>,
    service: Arc<Service>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/") => handle_rpc(req, service).await,
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("OK"))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap(),
    };
    Ok(response)
}

async fn handle_rpc(req: Request<Body>, service: Arc<Service>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to read request body: {e}");
            return plain_error(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };
    let rpc_req: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to parse JSON-RPC request: {e}");
            return plain_error(StatusCode::BAD_REQUEST, "invalid JSON-RPC request");
        }
    };

    let (result, error) = match service.dispatch(&rpc_req.method, rpc_req.params) {
        Ok(value) => (Some(value), None),
        Err(message) => (
            None,
            Some(JsonRpcError {
                code: -32000,
                message,
            }),
        ),
    };
    let rpc_resp = JsonRpcResponse {
        jsonrpc: "2.0",
        result,
        error,
        id: rpc_req.id,
    };
    match serde_json::to_vec(&rpc_resp) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(e) => {
            error!("failed to encode response: {e}");
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "encoding failure")
        }
    }
}

fn plain_error(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap()
}
