//! HTTP surface of the remote node.
//!
//! [`KristClient`] owns one shared `reqwest::Client` and exposes a typed
//! wrapper per consumed endpoint. Response bodies always carry an `ok`
//! envelope; `ok:false` becomes [`ApiError::Api`], an unreadable envelope
//! becomes [`ApiError::Decode`] (the stream treats that as fatal), and
//! transport failures become [`ApiError::Transport`] (retryable).
//!
//! [`retry_idempotent`] is the retry layer for idempotent requests: it
//! retries transport failures with exponential backoff until an optional
//! deadline. Non-idempotent requests (the transaction POST) must never go
//! through it; their retry story is the outbox resolver.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::filter::TransactionFilter;
use crate::types::{ApiTransaction, SendRequest, Transaction};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Errors produced by the node's HTTP surface.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// Network-level failure: no response, timeout, connection refused.
    /// Retryable.
    Transport(String),
    /// The node answered with a structured `{ok:false, error, message?}`
    /// body. Not retried automatically.
    Api(SendError),
    /// The node answered with something that is neither a success body nor
    /// a well-formed error envelope. The caller must treat this as fatal.
    Decode(String),
    /// A retry deadline expired before any attempt succeeded.
    Deadline,
}

impl ApiError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport(msg) => write!(f, "transport error: {msg}"),
            ApiError::Api(err) => write!(f, "api error: {err}"),
            ApiError::Decode(msg) => write!(f, "malformed node response: {msg}"),
            ApiError::Deadline => write!(f, "deadline expired"),
        }
    }
}

impl std::error::Error for ApiError {}

/// A structured remote error, as surfaced to the send-failure hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    /// Machine-readable error code, e.g. `"insufficient_funds"`.
    pub error: String,
    /// Optional human-readable elaboration.
    pub message: Option<String>,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} ({msg})", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for SendError {}

// ---------------------------------------------------------------------------
// Retry layer
// ---------------------------------------------------------------------------

const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Retry an idempotent request until it succeeds, fails non-transiently, or
/// the deadline expires. `deadline: None` retries transport failures
/// indefinitely.
pub async fn retry_idempotent<T, F, Fut>(
    deadline: Option<Instant>,
    mut attempt: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let mut backoff = BACKOFF_INITIAL;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transport() => {
                debug!(%err, "retrying after transport failure");
                if let Some(deadline) = deadline {
                    if Instant::now() + backoff >= deadline {
                        return Err(ApiError::Deadline);
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint payloads
// ---------------------------------------------------------------------------

/// Listing order of the lookup endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// One page of the (filtered) transaction listing.
#[derive(Debug, Clone)]
pub struct TransactionPage {
    /// Entries in this page.
    pub transactions: Vec<Transaction>,
    /// Size of the whole filtered listing at query time.
    pub total: u64,
}

/// Decoded `GET /addresses/{addr}` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    pub address: String,
    pub balance: i64,
    #[serde(default)]
    pub totalin: i64,
    #[serde(default)]
    pub totalout: i64,
}

#[derive(Deserialize)]
struct AddressBody {
    address: Address,
}

#[derive(Deserialize)]
struct LookupBody {
    total: u64,
    transactions: Vec<ApiTransaction>,
}

#[derive(Deserialize)]
struct SearchBody {
    matches: SearchMatches,
}

#[derive(Deserialize)]
struct SearchMatches {
    transactions: SearchTransactionMatches,
}

#[derive(Deserialize)]
struct SearchTransactionMatches {
    #[serde(default)]
    metadata: u64,
}

#[derive(Deserialize)]
struct WsStartBody {
    url: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Typed client over the node endpoints the stream consumes.
#[derive(Debug, Clone)]
pub struct KristClient {
    http: reqwest::Client,
    base_url: String,
}

impl KristClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    /// `GET /addresses/{addr}`.
    pub async fn get_address(&self, addr: &str) -> Result<Address, ApiError> {
        let url = format!("{}/addresses/{}", self.base_url, addr);
        let resp = self.http.get(&url).send().await.map_err(transport)?;
        let body: AddressBody = decode_envelope(resp).await?;
        Ok(body.address)
    }

    /// `GET /lookup/transactions/{addr?}` with paging.
    pub async fn lookup_transactions(
        &self,
        filter: &TransactionFilter,
        order: Order,
        offset: u64,
        limit: u64,
    ) -> Result<TransactionPage, ApiError> {
        let url = format!(
            "{}/lookup/transactions/{}",
            self.base_url,
            filter.lookup_path_segment(),
        );
        let mut query = filter.lookup_query();
        query.push(("order", order.as_str().to_string()));
        query.push(("offset", offset.to_string()));
        query.push(("limit", limit.to_string()));
        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        let body: LookupBody = decode_envelope(resp).await?;
        let transactions = body
            .transactions
            .into_iter()
            .map(Transaction::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransactionPage {
            transactions,
            total: body.total,
        })
    }

    /// `GET /search/extended?q={ref}`: how many transactions on the node
    /// carry this dedup ref in their metadata.
    pub async fn search_ref_matches(&self, dedup_ref: Uuid) -> Result<u64, ApiError> {
        let url = format!("{}/search/extended", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("q", dedup_ref.to_string())])
            .send()
            .await
            .map_err(transport)?;
        let body: SearchBody = decode_envelope(resp).await?;
        Ok(body.matches.transactions.metadata)
    }

    /// `POST /transactions/`. Not idempotent: callers must run this inside
    /// the outbox's UNKNOWN-resolver discipline, never a blind retry.
    pub async fn post_transaction(
        &self,
        request: &SendRequest,
        metadata: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{}/transactions/", self.base_url);
        let body = serde_json::json!({
            "privatekey": request.private_key,
            "to": request.to,
            "amount": request.amount,
            "metadata": metadata,
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        decode_envelope::<Value>(resp).await?;
        Ok(())
    }

    /// `POST /ws/start`: obtain a fresh websocket URL.
    pub async fn ws_start(&self) -> Result<String, ApiError> {
        let url = format!("{}/ws/start", self.base_url);
        let resp = self.http.post(&url).send().await.map_err(transport)?;
        let body: WsStartBody = decode_envelope(resp).await?;
        Ok(body.url)
    }
}

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Transport(err.to_string())
}

/// Read a response body through the `ok` envelope.
///
/// `ok:true` decodes the rest of the body as `T`; `ok:false` yields the
/// structured error; anything else is a schema violation. A server-side
/// (5xx) status with an unreadable body counts as transport so outages do
/// not masquerade as corruption.
async fn decode_envelope<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ApiError> {
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(transport)?;
    let body: Value = match serde_json::from_slice(&bytes) {
        Ok(body) => body,
        Err(err) if status.is_server_error() => {
            return Err(ApiError::Transport(format!("http {status}: {err}")));
        }
        Err(err) => return Err(ApiError::Decode(format!("http {status}: {err}"))),
    };
    match body.get("ok").and_then(Value::as_bool) {
        Some(true) => serde_json::from_value(body)
            .map_err(|e| ApiError::Decode(format!("success body: {e}"))),
        Some(false) => Err(ApiError::Api(SendError {
            error: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .map(String::from),
        })),
        None => Err(ApiError::Decode("response body lacks an ok field".into())),
    }
}
