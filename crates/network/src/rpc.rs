//! Control plane for a running node
//!
//! HTTP/1.1 with JSON bodies on `rpc_ip:rpc_port_base + seed`, separate
//! from the overlay transport:
//! - `POST /rpc` with `{"command": "addpeer", "ip": .., "seed": ..}`
//! - `GET /metrics` in the Prometheus text format

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::PeerAddress;
use crate::node::Node;
use crate::{NetworkError, NetworkResult};

/// Arguments of the `addpeer` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerRequest {
    /// IP the target node is reachable at
    pub ip: String,
    /// Seed of the target node; determines its peer id and port
    pub seed: i64,
}

/// Control plane commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum RpcRequest {
    AddPeer(AddPeerRequest),
}

/// Outcome of an `addpeer` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerResponse {
    pub success: bool,
    /// Peer id the seed resolved to, when it could be resolved
    pub peer_id: Option<String>,
    pub error: Option<String>,
}

impl AddPeerResponse {
    fn failure(peer_id: Option<String>, error: impl ToString) -> Self {
        Self {
            success: false,
            peer_id,
            error: Some(error.to_string()),
        }
    }
}

/// Resolve the target from its seed and add it to the node
///
/// Failures are logged here and reported in the response; they never
/// affect the running node.
pub async fn add_peer(node: &Node, request: &AddPeerRequest) -> AddPeerResponse {
    let target = request.ip.parse::<IpAddr>()
        .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", request.ip, e)))
        .and_then(|ip| PeerAddress::for_seed(ip, request.seed, node.config()));

    let target = match target {
        Ok(target) => target,
        Err(e) => {
            warn!("addpeer {} {} rejected: {}", request.ip, request.seed, e);
            return AddPeerResponse::failure(None, e);
        }
    };

    info!("addpeer {}", target);
    match node.add_peer(&target.to_string()).await {
        Ok(peer_id) => AddPeerResponse {
            success: true,
            peer_id: Some(peer_id.to_string()),
            error: None,
        },
        Err(e) => {
            warn!("addpeer {} failed: {}", target, e);
            AddPeerResponse::failure(Some(target.peer_id.to_string()), e)
        }
    }
}

/// Control plane server
pub struct RpcServer {
    node: Arc<Node>,
    addr: SocketAddr,
}

impl RpcServer {
    /// Server on the node's configured control plane address
    pub fn new(node: Arc<Node>) -> NetworkResult<Self> {
        let addr = node.config().rpc_addr()?;
        Ok(Self { node, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the listener and serve in a background task
    pub fn start(self) -> NetworkResult<JoinHandle<()>> {
        let node = self.node;
        let make_svc = make_service_fn(move |_| {
            let node = node.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let node = node.clone();
                    async move { Ok::<_, Infallible>(handle_request(node, req).await) }
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .map_err(|e| NetworkError::RpcError(format!("Failed to bind {}: {}", self.addr, e)))?
            .serve(make_svc);

        info!("Control plane listening on {}", self.addr);

        Ok(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("Control plane server error: {}", e);
            }
        }))
    }

    /// Bind and serve until the process exits
    pub async fn serve(self) -> NetworkResult<()> {
        self.start()?
            .await
            .map_err(|e| NetworkError::RpcError(format!("Control plane task failed: {}", e)))
    }
}

async fn handle_request(node: Arc<Node>, req: Request<Body>) -> Response<Body> {
    debug!("{} {}", req.method(), req.uri().path());

    match (req.method(), req.uri().path()) {
        (&Method::POST, "/rpc") => {
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(body) => body,
                Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
            };
            match serde_json::from_slice::<RpcRequest>(&body) {
                Ok(RpcRequest::AddPeer(request)) => {
                    let response = add_peer(&node, &request).await;
                    json_response(StatusCode::OK, &response)
                }
                Err(e) => json_response(StatusCode::BAD_REQUEST, &AddPeerResponse::failure(None, e)),
            }
        }
        (&Method::GET, "/metrics") => match node.metrics().encode_text() {
            Ok(buffer) => {
                let mut response = Response::new(Body::from(buffer));
                response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
                response
            }
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

/// One-shot control plane client
pub struct RpcClient {
    addr: SocketAddr,
    client: Client<hyper::client::HttpConnector>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            client: Client::new(),
        }
    }

    /// Ask the server to add the node with the given seed at `ip`
    pub async fn add_peer(&self, ip: &str, seed: i64) -> NetworkResult<AddPeerResponse> {
        let request = RpcRequest::AddPeer(AddPeerRequest { ip: ip.to_string(), seed });
        let body = serde_json::to_vec(&request)
            .map_err(|e| NetworkError::CodecError(e.to_string()))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/rpc", self.addr))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| NetworkError::RpcError(e.to_string()))?;

        let response = self.client.request(req).await
            .map_err(|e| NetworkError::RpcError(format!("{}: {}", self.addr, e)))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await
            .map_err(|e| NetworkError::RpcError(e.to_string()))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| NetworkError::RpcError(format!("unexpected {} response: {}", status, e)))
    }

    /// Fetch the server's metrics text
    pub async fn metrics(&self) -> NetworkResult<String> {
        let uri = format!("http://{}/metrics", self.addr)
            .parse()
            .map_err(|e| NetworkError::RpcError(format!("{}", e)))?;
        let response = self.client.get(uri).await
            .map_err(|e| NetworkError::RpcError(format!("{}: {}", self.addr, e)))?;
        let bytes = hyper::body::to_bytes(response.into_body()).await
            .map_err(|e| NetworkError::RpcError(e.to_string()))?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetworkError::RpcError(e.to_string()))
    }
}
