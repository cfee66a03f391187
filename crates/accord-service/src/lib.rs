#![deny(unsafe_code)]

pub mod webhooks;

use accord_adapters::{
    InMemoryBlobStore, LocalBlobStore, MockCardCheckout, MockCryptoCheckout,
    MockSignatureProvider, MockVerificationProvider, TracingNotifier,
};
use accord_core::{
    Account, AccountId, AccordError, AgreementEngine, AgreementId, AgreementPatch,
    AgreementSnapshot, AuditReport, BlobStore, Collaborators, EngineConfig, FeedbackSummary,
    FeedbackView, InviteContext, InviteIssued, NewAgreement, NewFeedback, PartySpec, PaymentMethod, PaymentProviderRegistry,
    PaymentSession, PendingInvite, VerificationProviderRegistry, VerificationStarted,
};
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use webhooks::{
    parse_payment_event, parse_signature_event, parse_verification_event, SignatureError,
    WebhookSecrets, SIGNATURE_HEADER, SIGNATURE_SOURCE,
};

/// Header carrying the caller's account id, resolved by the upstream identity provider.
pub const ACCOUNT_HEADER: &str = "x-account-id";

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    /// Directory for archived agreement documents; in-memory when unset.
    pub blob_dir: Option<PathBuf>,
    pub webhooks: WebhookSecrets,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<AgreementEngine>,
    pub webhooks: Arc<WebhookSecrets>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            engine,
            blob_dir,
            webhooks,
        } = config;
        if webhooks.allow_unsigned {
            warn!("unsigned webhooks are accepted from sources without a secret");
        }

        let mut payments = PaymentProviderRegistry::new();
        payments.register(Arc::new(MockCardCheckout));
        payments.register(Arc::new(MockCryptoCheckout));

        let mut verifications = VerificationProviderRegistry::new();
        for provider in MockVerificationProvider::all() {
            verifications.register(Arc::new(provider));
        }

        let blobs: Arc<dyn BlobStore> = match blob_dir {
            Some(dir) => Arc::new(LocalBlobStore::new(dir)),
            None => Arc::new(InMemoryBlobStore::new()),
        };

        let engine = AgreementEngine::bootstrap(
            engine,
            Collaborators {
                payments,
                signatures: Arc::new(MockSignatureProvider::new()),
                verifications,
                notifier: Arc::new(TracingNotifier),
                blobs,
            },
        )
        .await?;

        Ok(Self {
            engine: Arc::new(engine),
            webhooks: Arc::new(webhooks),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/accounts", post(register_account))
        .route("/v1/accounts/me", get(current_account))
        .route("/v1/accounts/:id/feedback", get(account_feedback))
        .route("/v1/agreements", get(list_agreements).post(create_agreement))
        .route(
            "/v1/agreements/:id",
            get(get_agreement).patch(update_agreement),
        )
        .route("/v1/agreements/:id/finalize", post(finalize_agreement))
        .route("/v1/agreements/:id/pay", post(pay_agreement))
        .route("/v1/agreements/:id/invite", post(invite_party))
        .route("/v1/agreements/:id/envelope", post(create_envelope))
        .route("/v1/agreements/:id/sign", post(sign_agreement))
        .route("/v1/agreements/:id/complete", post(complete_agreement))
        .route("/v1/agreements/:id/audit", get(agreement_audit))
        .route("/v1/agreements/:id/document", get(agreement_document))
        .route(
            "/v1/agreements/:id/feedback",
            get(list_feedback).post(leave_feedback),
        )
        .route("/v1/invites/mine", get(my_invites))
        .route("/v1/invites/:token", get(resolve_invite).delete(revoke_invite))
        .route("/v1/invites/:token/accept", post(accept_invite))
        .route("/v1/verifications", post(start_verification))
        .route("/v1/webhooks/payments/:provider", post(payment_webhook))
        .route("/v1/webhooks/signatures", post(signature_webhook))
        .route("/v1/webhooks/kyc/:provider", post(kyc_webhook))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] AccordError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] AccordError),
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Malformed => Self::bad_request(err.to_string()),
            _ => Self::unauthorized(err.to_string()),
        }
    }
}

fn status_for(err: &AccordError) -> StatusCode {
    match err {
        AccordError::Validation(_)
        | AccordError::EmailMismatch
        | AccordError::TokenAlreadyUsed
        | AccordError::TokenExpired => StatusCode::BAD_REQUEST,
        AccordError::PermissionDenied(_) | AccordError::VerificationRequired(_) => {
            StatusCode::FORBIDDEN
        }
        AccordError::AgreementNotFound(_)
        | AccordError::AccountNotFound(_)
        | AccordError::TokenNotFound => StatusCode::NOT_FOUND,
        AccordError::InvalidTransition { .. }
        | AccordError::DuplicateParty { .. }
        | AccordError::PartiesNotJoined { .. }
        | AccordError::PartiesNotSigned { .. }
        | AccordError::EnvelopeAlreadyActive
        | AccordError::FeedbackAlreadyGiven
        | AccordError::Conflict(_) => StatusCode::CONFLICT,
        AccordError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AccordError::Storage(_) | AccordError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

/// The authenticated caller. Unknown or missing accounts are rejected with 401; accounts
/// are never created here.
pub struct Caller(pub Account);

#[async_trait]
impl FromRequestParts<ServiceState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACCOUNT_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized(format!("missing {ACCOUNT_HEADER} header")))?;
        let id = AccountId::parse(raw)
            .map_err(|_| ApiError::unauthorized(format!("malformed {ACCOUNT_HEADER} header")))?;
        match state.engine.account(id).await {
            Ok(account) => Ok(Caller(account)),
            Err(AccordError::AccountNotFound(_)) => {
                Err(ApiError::unauthorized(format!("unknown account '{id}'")))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn agreement_id(raw: &str) -> Result<AgreementId, ApiError> {
    Ok(AgreementId::parse(raw)?)
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store: &'static str,
    demo_mode: bool,
    payment_methods: Vec<PaymentMethod>,
    verification_providers: Vec<String>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "accord-service",
        store: state.engine.store_label(),
        demo_mode: state.engine.config().demo_mode,
        payment_methods: state.engine.payment_methods(),
        verification_providers: state.engine.verification_providers(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterAccountRequest {
    id: Option<AccountId>,
    email: String,
    phone: Option<String>,
    display_name: Option<String>,
}

async fn register_account(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterAccountRequest>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let account = state
        .engine
        .register_account(
            request.id.unwrap_or_else(AccountId::generate),
            &request.email,
            request.phone,
            request.display_name,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn current_account(Caller(account): Caller) -> Json<Account> {
    Json(account)
}

async fn create_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Json(request): Json<NewAgreement>,
) -> Result<(StatusCode, Json<AgreementSnapshot>), ApiError> {
    let snapshot = state.engine.create_agreement(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn list_agreements(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
) -> Result<Json<Vec<AgreementSnapshot>>, ApiError> {
    Ok(Json(state.engine.list(&caller).await?))
}

async fn get_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    Ok(Json(state.engine.get(&caller, agreement_id(&id)?).await?))
}

async fn update_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(patch): Json<AgreementPatch>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    let id = agreement_id(&id)?;
    Ok(Json(state.engine.update_agreement(&caller, id, patch).await?))
}

async fn finalize_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    Ok(Json(state.engine.finalize(&caller, agreement_id(&id)?).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PayRequest {
    methods: Vec<String>,
}

async fn pay_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    request: Option<Json<PayRequest>>,
) -> Result<Json<PaymentSession>, ApiError> {
    let id = agreement_id(&id)?;
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let methods = request
        .methods
        .iter()
        .map(|method| PaymentMethod::parse(method))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(state.engine.pay(&caller, id, &methods).await?))
}

async fn invite_party(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(spec): Json<PartySpec>,
) -> Result<(StatusCode, Json<InviteIssued>), ApiError> {
    let id = agreement_id(&id)?;
    let issued = state.engine.invite(&caller, id, spec).await?;
    let status = if issued.refreshed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(issued)))
}

async fn create_envelope(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    let id = agreement_id(&id)?;
    Ok(Json(state.engine.create_envelope(&caller, id).await?))
}

async fn sign_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    Ok(Json(state.engine.sign(&caller, agreement_id(&id)?).await?))
}

async fn complete_agreement(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    Ok(Json(state.engine.complete(&caller, agreement_id(&id)?).await?))
}

async fn agreement_audit(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<AuditReport>, ApiError> {
    Ok(Json(state.engine.audit(&caller, agreement_id(&id)?).await?))
}

async fn agreement_document(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state.engine.document(&caller, agreement_id(&id)?).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        bytes,
    )
        .into_response())
}

async fn leave_feedback(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(request): Json<NewFeedback>,
) -> Result<(StatusCode, Json<FeedbackView>), ApiError> {
    let id = agreement_id(&id)?;
    let view = state.engine.leave_feedback(&caller, id, request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_feedback(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<FeedbackView>>, ApiError> {
    Ok(Json(state.engine.feedback(&caller, agreement_id(&id)?).await?))
}

async fn account_feedback(
    State(state): State<ServiceState>,
    Caller(_): Caller,
    Path(id): Path<String>,
) -> Result<Json<FeedbackSummary>, ApiError> {
    let account = AccountId::parse(&id)?;
    Ok(Json(state.engine.feedback_summary(account).await?))
}

async fn my_invites(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
) -> Result<Json<Vec<PendingInvite>>, ApiError> {
    Ok(Json(state.engine.pending_invites(&caller).await?))
}

async fn resolve_invite(
    State(state): State<ServiceState>,
    Path(token): Path<String>,
) -> Result<Json<InviteContext>, ApiError> {
    Ok(Json(state.engine.resolve_invite(&token).await?))
}

async fn accept_invite(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(token): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    Ok(Json(state.engine.accept_invite(&caller, &token).await?))
}

async fn revoke_invite(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(token): Path<String>,
) -> Result<Json<AgreementSnapshot>, ApiError> {
    Ok(Json(state.engine.revoke_invite(&caller, &token).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct StartVerificationRequest {
    provider: String,
}

async fn start_verification(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Json(request): Json<StartVerificationRequest>,
) -> Result<(StatusCode, Json<VerificationStarted>), ApiError> {
    let started = state
        .engine
        .start_verification(&caller, &request.provider)
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub applied: bool,
}

impl WebhookAck {
    fn ignored() -> Json<Self> {
        Json(Self {
            received: true,
            applied: false,
        })
    }

    fn applied(applied: bool) -> Json<Self> {
        Json(Self {
            received: true,
            applied,
        })
    }
}

/// Verify the delivery signature before the body is even parsed.
fn signed_payload(
    state: &ServiceState,
    source: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Value, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = state.webhooks.verify(source, signature, body) {
        warn!(source, error = %err, "webhook delivery rejected");
        return Err(err.into());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid webhook payload: {err}")))
}

async fn payment_webhook(
    State(state): State<ServiceState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let payload = signed_payload(&state, &provider, &headers, &body)?;
    let Some(event) = parse_payment_event(&provider, &payload) else {
        debug!(provider = %provider, "untracked payment event acknowledged");
        return Ok(WebhookAck::ignored());
    };
    let outcome = state
        .engine
        .settle_payment(&event.provider_ref, event.outcome)
        .await?;
    Ok(WebhookAck::applied(outcome.is_applied()))
}

async fn signature_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let payload = signed_payload(&state, SIGNATURE_SOURCE, &headers, &body)?;
    let Some(event) = parse_signature_event(&payload) else {
        debug!("untracked signature event acknowledged");
        return Ok(WebhookAck::ignored());
    };
    let outcome = state
        .engine
        .apply_envelope_status(&event.envelope_id, event.status)
        .await?;
    Ok(WebhookAck::applied(outcome.is_applied()))
}

async fn kyc_webhook(
    State(state): State<ServiceState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let payload = signed_payload(&state, &provider, &headers, &body)?;
    let Some(event) = parse_verification_event(&payload) else {
        debug!(provider = %provider, "untracked verification event acknowledged");
        return Ok(WebhookAck::ignored());
    };
    let outcome = state
        .engine
        .apply_verification_result(&provider, &event.external_ref, event.status)
        .await?;
    Ok(WebhookAck::applied(outcome.is_applied()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use webhooks::sign_payload;

    fn secret_for(source: &str) -> String {
        format!("{source}-whsec")
    }

    async fn app() -> Router {
        let mut secrets = WebhookSecrets::new();
        for source in ["stripe", "coinbase", SIGNATURE_SOURCE, "idme"] {
            secrets.insert(source, secret_for(source));
        }
        let state = ServiceState::bootstrap(ServiceConfig {
            webhooks: secrets,
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        build_router(state)
    }

    /// POST a webhook body, signed for `source` when `signature` is `None`.
    async fn deliver(
        app: &Router,
        uri: &str,
        source: &str,
        body: &Value,
        signature: Option<&str>,
    ) -> (StatusCode, Value) {
        let raw = body.to_string();
        let signature = signature
            .map(str::to_string)
            .unwrap_or_else(|| sign_payload(&secret_for(source), raw.as_bytes()));
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(raw))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        caller: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            request = request.header(ACCOUNT_HEADER, caller);
        }
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    async fn register(app: &Router, email: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/v1/accounts",
            None,
            Some(serde_json::json!({ "email": email })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    async fn verify(app: &Router, caller: &str) {
        let (status, started) = call(
            app,
            "POST",
            "/v1/verifications",
            Some(caller),
            Some(serde_json::json!({ "provider": "idme" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, ack) = deliver(
            app,
            "/v1/webhooks/kyc/idme",
            "idme",
            &serde_json::json!({
                "verification_id": started["external_ref"],
                "status": "approved"
            }),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["applied"], true);
    }

    #[tokio::test]
    async fn health_reports_store_and_providers() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["payment_methods"], serde_json::json!(["card", "crypto"]));
    }

    #[tokio::test]
    async fn unknown_callers_are_rejected() {
        let app = app().await;
        let (status, _) = call(&app, "GET", "/v1/agreements", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let stranger = AccountId::generate().to_string();
        let (status, body) = call(&app, "GET", "/v1/agreements", Some(&stranger), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("unknown account"));
    }

    #[tokio::test]
    async fn finalize_without_verification_is_forbidden() {
        let app = app().await;
        let lead = register(&app, "lead@example.com").await;
        let (status, draft) = call(
            &app,
            "POST",
            "/v1/agreements",
            Some(&lead),
            Some(serde_json::json!({ "rent_total_cents": 150000 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(draft["agreement"]["status"], "draft");

        let id = draft["agreement"]["id"].as_str().unwrap();
        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/agreements/{id}/finalize"),
            Some(&lead),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "GET", "/v1/agreements/not-a-uuid", Some(&lead), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhooks_acknowledge_unknown_references() {
        let app = app().await;
        let stripe = serde_json::json!({
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_unknown" } }
        });
        let (status, ack) = deliver(&app, "/v1/webhooks/payments/stripe", "stripe", &stripe, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack, serde_json::json!({ "received": true, "applied": false }));

        let (status, ack) = deliver(
            &app,
            "/v1/webhooks/signatures",
            SIGNATURE_SOURCE,
            &serde_json::json!({ "envelopeId": "env-missing", "status": "completed" }),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["received"], true);
    }

    /// Draft, verify, finalize and open a card checkout; returns (lead, id, provider_ref).
    async fn awaiting_payment(app: &Router) -> (String, String, String) {
        let lead = register(app, "lead@example.com").await;
        verify(app, &lead).await;
        let (_, draft) = call(
            app,
            "POST",
            "/v1/agreements",
            Some(&lead),
            Some(serde_json::json!({ "rent_total_cents": 150000 })),
        )
        .await;
        let id = draft["agreement"]["id"].as_str().unwrap().to_string();
        call(app, "POST", &format!("/v1/agreements/{id}/finalize"), Some(&lead), None).await;
        let (_, session) = call(
            app,
            "POST",
            &format!("/v1/agreements/{id}/pay"),
            Some(&lead),
            Some(serde_json::json!({ "methods": ["card"] })),
        )
        .await;
        let provider_ref = session["checkouts"][0]["provider_ref"].as_str().unwrap().to_string();
        (lead, id, provider_ref)
    }

    #[tokio::test]
    async fn unsigned_payment_webhook_cannot_settle() {
        let app = app().await;
        let (lead, id, provider_ref) = awaiting_payment(&app).await;
        let forged = serde_json::json!({ "provider_ref": provider_ref, "outcome": "succeeded" });

        let (status, _) = call(
            &app,
            "POST",
            "/v1/webhooks/payments/stripe",
            None,
            Some(forged.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = sign_payload("not-the-secret", forged.to_string().as_bytes());
        let (status, body) =
            deliver(&app, "/v1/webhooks/payments/stripe", "stripe", &forged, Some(&wrong)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "webhook signature mismatch");

        let (status, _) =
            deliver(&app, "/v1/webhooks/payments/stripe", "stripe", &forged, Some("not-hex")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // A source with no configured secret is refused outright.
        let (status, _) = deliver(&app, "/v1/webhooks/payments/acme", "acme", &forged, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, snapshot) = call(&app, "GET", &format!("/v1/agreements/{id}"), Some(&lead), None).await;
        assert_eq!(snapshot["agreement"]["status"], "awaiting_payment");
        assert_eq!(snapshot["payments"][0]["status"], "pending");

        let (_, ack) = deliver(&app, "/v1/webhooks/payments/stripe", "stripe", &forged, None).await;
        assert_eq!(ack["applied"], true);
    }

    #[tokio::test]
    async fn unsigned_signature_and_kyc_webhooks_are_rejected() {
        let app = app().await;
        let (status, _) = call(
            &app,
            "POST",
            "/v1/webhooks/signatures",
            None,
            Some(serde_json::json!({ "envelopeId": "env-1", "status": "completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let approval = serde_json::json!({ "verification_id": "idme_1", "status": "approved" });
        let stolen = sign_payload(&secret_for("stripe"), approval.to_string().as_bytes());
        let (status, _) =
            deliver(&app, "/v1/webhooks/kyc/idme", "idme", &approval, Some(&stolen)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn agreement_lifecycle_over_http() {
        let app = app().await;
        let lead = register(&app, "lead@example.com").await;
        let mate = register(&app, "mate@example.com").await;
        verify(&app, &lead).await;

        let (_, draft) = call(
            &app,
            "POST",
            "/v1/agreements",
            Some(&lead),
            Some(serde_json::json!({
                "title": "Maple Street",
                "rent_total_cents": 150000,
                "location": { "city": "Austin", "state": "TX" }
            })),
        )
        .await;
        let id = draft["agreement"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "POST", &format!("/v1/agreements/{id}/finalize"), Some(&lead), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, session) = call(
            &app,
            "POST",
            &format!("/v1/agreements/{id}/pay"),
            Some(&lead),
            Some(serde_json::json!({ "methods": ["card"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let provider_ref = session["checkouts"][0]["provider_ref"].as_str().unwrap().to_string();

        let settle = serde_json::json!({
            "type": "checkout.session.completed",
            "data": { "object": { "id": provider_ref } }
        });
        let (_, ack) = deliver(&app, "/v1/webhooks/payments/stripe", "stripe", &settle, None).await;
        assert_eq!(ack["applied"], true);
        let (_, replay) = deliver(&app, "/v1/webhooks/payments/stripe", "stripe", &settle, None).await;
        assert_eq!(replay["applied"], false);

        let (status, issued) = call(
            &app,
            "POST",
            &format!("/v1/agreements/{id}/invite"),
            Some(&lead),
            Some(serde_json::json!({ "email": "mate@example.com", "rent_share_cents": 75000 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(issued["status"], "inviting");
        let token = issued["token"].as_str().unwrap().to_string();

        let (status, context) = call(&app, "GET", &format!("/v1/invites/{token}"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(context["city"], "Austin");
        assert_eq!(context["next_step"], "login");

        let (_, mine) = call(&app, "GET", "/v1/invites/mine", Some(&mate), None).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);

        let (status, joined) = call(&app, "POST", &format!("/v1/invites/{token}/accept"), Some(&mate), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(joined["unjoined"], 0);

        let (status, _) = call(&app, "POST", &format!("/v1/invites/{token}/accept"), Some(&mate), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, signing) = call(&app, "POST", &format!("/v1/agreements/{id}/envelope"), Some(&lead), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(signing["agreement"]["status"], "signing");
        let envelope_id = signing["envelopes"][0]["external_id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "POST", &format!("/v1/agreements/{id}/envelope"), Some(&lead), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, ack) = deliver(
            &app,
            "/v1/webhooks/signatures",
            SIGNATURE_SOURCE,
            &serde_json::json!({ "envelopeId": envelope_id, "status": "completed" }),
            None,
        )
        .await;
        assert_eq!(ack["applied"], true);

        let (_, done) = call(&app, "GET", &format!("/v1/agreements/{id}"), Some(&mate), None).await;
        assert_eq!(done["agreement"]["status"], "completed");
        assert_eq!(done["unsigned"], 0);

        let (status, document) = call(&app, "GET", &format!("/v1/agreements/{id}/document"), Some(&mate), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(document.as_str().unwrap().contains("MAPLE STREET"));

        let (_, audit) = call(&app, "GET", &format!("/v1/agreements/{id}/audit"), Some(&lead), None).await;
        assert_eq!(audit["verified"], true);

        let rating = serde_json::json!({
            "to_account": mate,
            "rating": 4,
            "categories": { "cleanliness": 5, "noise_level": 3 },
            "is_anonymous": true
        });
        let uri = format!("/v1/agreements/{id}/feedback");
        let (status, left) = call(&app, "POST", &uri, Some(&lead), Some(rating.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(left["from_account"], Value::Null);
        let (status, _) = call(&app, "POST", &uri, Some(&lead), Some(rating)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = call(
            &app,
            "POST",
            &uri,
            Some(&mate),
            Some(serde_json::json!({ "to_account": mate, "rating": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, listed) = call(&app, "GET", &uri, Some(&mate), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        let (_, summary) = call(&app, "GET", &format!("/v1/accounts/{mate}/feedback"), Some(&lead), None).await;
        assert_eq!(summary["total_ratings"], 1);
        assert_eq!(summary["average_rating"], 4.0);
        assert_eq!(summary["category_averages"]["noise_level"], 3.0);
    }
}
