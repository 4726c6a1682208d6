/// HTTP API for the potato relay
///
/// Routes:
/// - `POST /api/locker/open`: verify a buyer's locker signature, then send `openLocker`
/// - `POST /api/permit`: forward a buyer-signed permit with the operator key
/// - `GET /api/permit/status?hash=`: receipt-based transaction status
/// - `GET /health`, `GET /metrics`
///
/// Errors always come back as `{"error": "..."}` with the status from
/// [`RelayError::status_code`].

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use ethers::types::{Address, TxHash, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::chain::VendorChain;
use crate::config::ApiConfig;
use crate::error::{RelayError, RelayResult};
use crate::metric;
use crate::queue::EventQueue;
use crate::signature::LockerAuthorizer;
use crate::types::{LockerOpenRequest, LockerSignature, PermitRequest, TxStatus};
use crate::version;

/// Request bodies larger than this are refused
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Shared state handed to every route
#[derive(Clone)]
pub struct ApiContext {
    pub chain: Arc<dyn VendorChain>,
    pub authorizer: Arc<LockerAuthorizer>,
    /// Present when the relay worker runs in the same process
    pub queue: Option<EventQueue>,
    pub service_name: String,
}

impl ApiContext {
    pub fn new(chain: Arc<dyn VendorChain>, queue: Option<EventQueue>, service_name: &str) -> Self {
        Self {
            authorizer: Arc::new(LockerAuthorizer::new(chain.clone())),
            chain,
            queue,
            service_name: service_name.to_string(),
        }
    }
}

/// A number sent either as JSON integer or as decimal / 0x-hex string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberField {
    Number(u64),
    Text(String),
}

impl NumberField {
    pub fn to_u256(&self, field: &str) -> RelayResult<U256> {
        match self {
            NumberField::Number(n) => Ok(U256::from(*n)),
            NumberField::Text(s) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) if !hex.is_empty() => U256::from_str_radix(hex, 16).ok(),
                    Some(_) => None,
                    None => U256::from_dec_str(s).ok(),
                };
                parsed.ok_or_else(|| RelayError::InvalidRequest(format!("{} is not a number: {}", field, s)))
            }
        }
    }

    pub fn to_u8(&self, field: &str) -> RelayResult<u8> {
        let value = self.to_u256(field)?;
        if value > U256::from(u8::MAX) {
            return Err(RelayError::InvalidRequest(format!("{} out of range: {}", field, value)));
        }
        Ok(value.low_u32() as u8)
    }
}

/// Body of `POST /api/locker/open`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockerOpenBody {
    pub locker_number: Option<NumberField>,
    pub v: Option<NumberField>,
    pub r: Option<String>,
    pub s: Option<String>,
    pub signer: Option<String>,
    pub message_hash: Option<String>,
}

impl LockerOpenBody {
    /// Validate and parse into a [`LockerOpenRequest`]
    pub fn into_request(self) -> RelayResult<LockerOpenRequest> {
        let (Some(locker), Some(v), Some(r), Some(s), Some(signer), Some(hash)) =
            (self.locker_number, self.v, self.r, self.s, self.signer, self.message_hash)
        else {
            return Err(missing_parameters());
        };

        Ok(LockerOpenRequest {
            locker_number: locker.to_u8("lockerNumber")?,
            signer: parse_address("signer", &signer)?,
            signature: LockerSignature {
                v: v.to_u8("v")?,
                r: parse_h256("r", &r)?,
                s: parse_h256("s", &s)?,
            },
            message_hash: parse_h256("messageHash", &hash)?,
        })
    }
}

/// Body of `POST /api/permit`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermitBody {
    pub owner: Option<String>,
    pub spender: Option<String>,
    pub value: Option<NumberField>,
    pub deadline: Option<NumberField>,
    pub v: Option<NumberField>,
    pub r: Option<String>,
    pub s: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl PermitBody {
    /// Validate and parse into a [`PermitRequest`]; a missing email is sent as empty
    pub fn into_request(self) -> RelayResult<PermitRequest> {
        let (Some(owner), Some(spender), Some(value), Some(deadline), Some(v), Some(r), Some(s)) = (
            self.owner,
            self.spender,
            self.value,
            self.deadline,
            self.v,
            self.r,
            self.s,
        ) else {
            return Err(missing_parameters());
        };

        let value = value.to_u256("value")?;
        if value.is_zero() {
            return Err(missing_parameters());
        }

        Ok(PermitRequest {
            owner: parse_address("owner", &owner)?,
            spender: parse_address("spender", &spender)?,
            value,
            deadline: deadline.to_u256("deadline")?,
            signature: LockerSignature {
                v: v.to_u8("v")?,
                r: parse_h256("r", &r)?,
                s: parse_h256("s", &s)?,
            },
            email: self.email.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: &'static str,
    queue_depth: usize,
}

fn missing_parameters() -> RelayError {
    RelayError::InvalidRequest("Missing required parameters".to_string())
}

fn parse_address(field: &str, value: &str) -> RelayResult<Address> {
    Address::from_str(value.trim())
        .map_err(|_| RelayError::InvalidRequest(format!("{} is not an address: {}", field, value)))
}

fn parse_h256(field: &str, value: &str) -> RelayResult<H256> {
    H256::from_str(value.trim())
        .map_err(|_| RelayError::InvalidRequest(format!("{} is not a 32-byte hex value: {}", field, value)))
}

fn json_reply<T: Serialize>(status: StatusCode, body: &T) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_reply(err: &RelayError) -> Response {
    json_reply(err.status_code(), &json!({ "error": err.to_string() }))
}

fn with_context(ctx: ApiContext) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// All routes, with rejections turned into JSON errors
pub fn routes(ctx: ApiContext) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let open_locker = warp::path!("api" / "locker" / "open")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(handle_open_locker);

    let permit = warp::path!("api" / "permit")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_context(ctx.clone()))
        .and_then(handle_permit);

    let permit_status = warp::path!("api" / "permit" / "status")
        .and(warp::get())
        .and(warp::query::<StatusQuery>())
        .and(with_context(ctx.clone()))
        .and_then(handle_permit_status);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_context(ctx))
        .and_then(handle_health);

    let metrics = warp::path!("metrics").and(warp::get()).and_then(handle_metrics);

    open_locker
        .or(permit)
        .unify()
        .or(permit_status)
        .unify()
        .or(health)
        .unify()
        .or(metrics)
        .unify()
        .recover(handle_rejection)
        .unify()
}

async fn handle_open_locker(body: LockerOpenBody, ctx: ApiContext) -> Result<Response, Rejection> {
    let request = match body.into_request() {
        Ok(request) => request,
        Err(e) => return Ok(error_reply(&e)),
    };

    match ctx.authorizer.authorize_and_open(&request).await {
        Ok(tx_hash) => Ok(json_reply(
            StatusCode::OK,
            &json!({
                "success": true,
                "transactionHash": tx_hash,
                "lockerNumber": request.locker_number,
            }),
        )),
        Err(e) => {
            if !matches!(e, RelayError::Verification(_)) {
                error!("Locker {} open failed: {}", request.locker_number, e);
            }
            Ok(error_reply(&e))
        }
    }
}

async fn handle_permit(body: PermitBody, ctx: ApiContext) -> Result<Response, Rejection> {
    let permit = match body.into_request() {
        Ok(permit) => permit,
        Err(e) => return Ok(error_reply(&e)),
    };

    info!("Permit from {:?} for {} tokens", permit.owner, permit.value);
    match ctx.chain.submit_permit(&permit).await {
        Ok(tx_hash) => Ok(json_reply(
            StatusCode::OK,
            &json!({ "success": true, "transactionHash": tx_hash }),
        )),
        Err(e) => {
            error!("Permit for {:?} failed: {}", permit.owner, e);
            Ok(error_reply(&e))
        }
    }
}

async fn handle_permit_status(query: StatusQuery, ctx: ApiContext) -> Result<Response, Rejection> {
    let hash = match query.hash.as_deref() {
        Some(hash) if !hash.trim().is_empty() => hash,
        _ => {
            return Ok(error_reply(&RelayError::InvalidRequest(
                "Transaction hash is required".to_string(),
            )))
        }
    };
    let tx_hash: TxHash = match parse_h256("hash", hash) {
        Ok(h) => h,
        Err(e) => return Ok(error_reply(&e)),
    };

    match ctx.chain.transaction_status(tx_hash).await {
        Ok(status) => Ok(json_reply(StatusCode::OK, &json!({ "status": status }))),
        Err(e) => {
            warn!("Status lookup for {:?} failed: {}", tx_hash, e);
            Ok(error_reply(&e))
        }
    }
}

async fn handle_health(ctx: ApiContext) -> Result<Response, Rejection> {
    let health = HealthResponse {
        status: "ok",
        service: ctx.service_name.clone(),
        version: version::VERSION,
        queue_depth: ctx.queue.as_ref().map(|q| q.depth()).unwrap_or(0),
    };
    Ok(json_reply(StatusCode::OK, &health))
}

async fn handle_metrics() -> Result<Response, Rejection> {
    Ok(match metric::render() {
        Some(text) => warp::reply::with_header(text, "content-type", "text/plain; version=0.0.4").into_response(),
        None => json_reply(StatusCode::NOT_FOUND, &json!({ "error": "Metrics are disabled" })),
    })
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Expected application/json".to_string())
    } else if let Some(e) = err.find::<RelayError>() {
        (e.status_code(), e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
    };
    Ok(json_reply(status, &json!({ "error": message })))
}

/// Bind the API port and return the server future
///
/// The future serves until `shutdown` turns true. Binding happens here so a
/// busy port fails the caller instead of the spawned task.
pub fn bind(
    ctx: ApiContext,
    config: &ApiConfig,
    mut shutdown: watch::Receiver<bool>,
) -> RelayResult<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
    let cors = if config.cors_origins.iter().any(|o| o == "*") {
        warp::cors().allow_any_origin()
    } else {
        warp::cors().allow_origins(config.cors_origins.iter().map(String::as_str))
    }
    .allow_methods(vec!["GET", "POST", "OPTIONS"])
    .allow_headers(vec!["content-type"]);

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let (bound, server) = warp::serve(routes(ctx).with(cors))
        .try_bind_with_graceful_shutdown(address, async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .map_err(|e| RelayError::Config(format!("Failed to bind API server on {}: {}", address, e)))?;

    info!("API server listening on {}", bound);
    Ok((bound, async move {
        server.await;
        info!("API server stopped");
    }))
}
