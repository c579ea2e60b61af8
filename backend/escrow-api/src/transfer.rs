//! Asset transfer client. It moves funds once the ledger has accounted for a
//! payout.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the transfer service is unreachable,
//!   rate-limits, or answers with a server error, up to [`MAX_BACKOFF_MS`].
//! * Every request carries the payout reference as an idempotency key, so a
//!   retried request never moves funds twice.
//! * Client errors (4xx other than 429) are final and not retried.

use std::time::Duration;

use async_trait::async_trait;
use milestone_escrow::{Payout, ProjectResidual};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Idempotency key; stable per payout.
    pub reference: String,
    pub payer: String,
    pub payee: String,
    pub asset: String,
    /// Decimal string, since amounts exceed the JSON safe-integer range.
    pub amount: String,
}

impl TransferRequest {
    pub fn for_payout(payout: &Payout, payer: &str) -> Self {
        Self {
            reference: payout.reference(),
            payer: payer.to_string(),
            payee: payout.payee.to_string(),
            asset: payout.asset.to_string(),
            amount: payout.amount.to_string(),
        }
    }

    /// Return of a finished project's unspent budget to its treasury.
    pub fn for_residual(residual: &ProjectResidual, payer: &str) -> Self {
        Self {
            reference: format!("{}-residual", residual.project_id),
            payer: payer.to_string(),
            payee: residual.treasury.to_string(),
            asset: residual.asset.to_string(),
            amount: residual.amount.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Identifier assigned by the transfer service, when it reports one.
    #[serde(default)]
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (after {attempts} attempt(s))")]
pub struct TransferError {
    pub message: String,
    pub attempts: u32,
}

// ─────────────────────────────────────────────────────────
// Transfer collaborator
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait AssetTransfer: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError>;
}

pub struct HttpTransfer {
    client: Client,
    url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpTransfer {
    pub fn new(client: Client, url: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            client,
            url: url.into(),
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    #[cfg(test)]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }
}

#[async_trait]
impl AssetTransfer for HttpTransfer {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            let response = self
                .client
                .post(&self.url)
                .header(IDEMPOTENCY_HEADER, &request.reference)
                .json(request)
                .send()
                .await;

            let failure = match response {
                Err(e) => format!("transfer request failed: {e}"),
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        let receipt = parse_receipt(&request.reference, &body);
                        debug!(
                            reference = %request.reference,
                            attempt,
                            "Transfer accepted"
                        );
                        return Ok(receipt);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if !is_retryable(status) {
                        return Err(TransferError {
                            message: format!("transfer rejected with {status}: {body}"),
                            attempts: attempt,
                        });
                    }
                    format!("transfer service returned {status}: {body}")
                }
            };

            if attempt >= self.max_attempts {
                return Err(TransferError {
                    message: failure,
                    attempts: attempt,
                });
            }
            warn!(
                reference = %request.reference,
                "{failure} (will retry in {}ms)",
                backoff.as_millis()
            );
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
            attempt += 1;
        }
    }
}

/// Funds already moved on a 2xx, so an unreadable body only costs the
/// transfer id.
fn parse_receipt(reference: &str, body: &str) -> TransferReceipt {
    if body.trim().is_empty() {
        return TransferReceipt::default();
    }
    match serde_json::from_str(body) {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!(%reference, "Transfer accepted with an unreadable receipt: {e}");
            TransferReceipt::default()
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_millis(MAX_BACKOFF_MS))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use milestone_escrow::PayoutKind;

    use super::*;

    fn payout() -> Payout {
        Payout {
            project_id: 3,
            package_id: 1,
            payee: "alice".into(),
            asset: "USDC".into(),
            amount: 150,
            kind: PayoutKind::Mgp,
        }
    }

    #[derive(Default)]
    struct Stub {
        hits: AtomicU32,
        keys: Mutex<Vec<String>>,
    }

    /// Serve `respond(hit_number)` on an ephemeral port and return its URL.
    async fn serve(stub: Arc<Stub>, respond: fn(u32) -> Response) -> String {
        let app = Router::new()
            .route(
                "/transfers",
                post(
                    move |State(stub): State<Arc<Stub>>,
                          headers: HeaderMap,
                          Json(_req): Json<TransferRequest>| async move {
                        let hit = stub.hits.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(key) = headers.get(IDEMPOTENCY_HEADER) {
                            stub.keys
                                .lock()
                                .unwrap()
                                .push(key.to_str().unwrap().to_string());
                        }
                        respond(hit)
                    },
                ),
            )
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/transfers")
    }

    fn client(url: String, attempts: u32) -> HttpTransfer {
        HttpTransfer::new(Client::new(), url, attempts).with_initial_backoff(Duration::from_millis(1))
    }

    #[test]
    fn payout_request_shape() {
        let request = TransferRequest::for_payout(&payout(), "escrow-main");
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "reference": "3-1-mgp-alice",
                "payer": "escrow-main",
                "payee": "alice",
                "asset": "USDC",
                "amount": "150",
            })
        );
    }

    #[test]
    fn residual_request_targets_treasury() {
        let residual = ProjectResidual {
            project_id: 9,
            asset: "USDC".into(),
            treasury: "treasury".into(),
            amount: 997,
        };
        let request = TransferRequest::for_residual(&residual, "escrow-main");
        assert_eq!(request.reference, "9-residual");
        assert_eq!(request.payee, "treasury");
        assert_eq!(request.amount, "997");
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(Duration::from_millis(500)), Duration::from_secs(1));
        assert_eq!(
            next_backoff(Duration::from_millis(MAX_BACKOFF_MS)),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn retries_rate_limits_with_the_same_key() {
        let stub = Arc::new(Stub::default());
        let url = serve(Arc::clone(&stub), |hit| {
            if hit < 3 {
                StatusCode::TOO_MANY_REQUESTS.into_response()
            } else {
                Json(serde_json::json!({ "transfer_id": "tx-1" })).into_response()
            }
        })
        .await;

        let request = TransferRequest::for_payout(&payout(), "escrow-main");
        let receipt = client(url, 5).transfer(&request).await.unwrap();
        assert_eq!(receipt.transfer_id.as_deref(), Some("tx-1"));
        assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
        assert_eq!(*stub.keys.lock().unwrap(), vec!["3-1-mgp-alice"; 3]);
    }

    #[tokio::test]
    async fn client_errors_are_final() {
        let stub = Arc::new(Stub::default());
        let url = serve(Arc::clone(&stub), |_| {
            (StatusCode::BAD_REQUEST, "unknown payee").into_response()
        })
        .await;

        let request = TransferRequest::for_payout(&payout(), "escrow-main");
        let err = client(url, 5).transfer(&request).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(err.message.contains("unknown payee"));
        assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let stub = Arc::new(Stub::default());
        let url = serve(Arc::clone(&stub), |_| {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        })
        .await;

        let request = TransferRequest::for_payout(&payout(), "escrow-main");
        let err = client(url, 3).transfer(&request).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_success_body_yields_empty_receipt() {
        let stub = Arc::new(Stub::default());
        let url = serve(Arc::clone(&stub), |_| StatusCode::NO_CONTENT.into_response()).await;

        let request = TransferRequest::for_payout(&payout(), "escrow-main");
        let receipt = client(url, 1).transfer(&request).await.unwrap();
        assert_eq!(receipt, TransferReceipt::default());
    }

    #[test]
    fn receipt_parsing_tolerates_odd_bodies() {
        assert_eq!(
            parse_receipt("r", r#"{"transfer_id":"tx-9"}"#).transfer_id.as_deref(),
            Some("tx-9")
        );
        assert_eq!(parse_receipt("r", "{}"), TransferReceipt::default());
        assert_eq!(parse_receipt("r", "  "), TransferReceipt::default());
        assert_eq!(parse_receipt("r", "<html>ok</html>"), TransferReceipt::default());
    }

    #[tokio::test]
    async fn malformed_success_body_still_counts_as_sent() {
        let stub = Arc::new(Stub::default());
        let url = serve(Arc::clone(&stub), |_| (StatusCode::OK, "accepted").into_response()).await;

        let request = TransferRequest::for_payout(&payout(), "escrow-main");
        let receipt = client(url, 3).transfer(&request).await.unwrap();
        assert_eq!(receipt, TransferReceipt::default());
        assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
    }
}
