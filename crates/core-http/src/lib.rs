//! Synchronous caller-facing HTTP surface for the settlement core. Actor
//! identity arrives on `x-provider-id` / `x-client-id` headers (the auth
//! middleware upstream of this core owns authentication; this layer only
//! checks that the actor is a party of the appointment).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use marketplace_domain::{
    AppointmentId, ClientClosureAction, ClientId, ClosureNotes, ClosureState, PaymentMethod,
    ProviderClosureAction, ProviderId, ReleaseStatus, TraceId,
};
use platform_core::{ErrorCode, ResponseEnvelope};
use serde::{Deserialize, Serialize};
use settlement::{
    CashActor, CashSettlement, EarningsSummary, SettlementEngine, SettlementError, SettlementStore,
};
use settlement_store::{CommissionDebtRecord, PaymentRecord};
use tracing::warn;
use uuid::Uuid;

pub struct CoreHttpState<S> {
    pub engine: Arc<SettlementEngine<S>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: ErrorCode::Forbidden,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::RequestInvalid,
            message: message.into(),
        }
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        let (status, code) = match &err {
            SettlementError::InvalidAmount(_) | SettlementError::Validation(_) => {
                (StatusCode::BAD_REQUEST, ErrorCode::RequestInvalid)
            }
            SettlementError::CashCapExceeded { .. } => {
                (StatusCode::BAD_REQUEST, ErrorCode::CashCapExceeded)
            }
            SettlementError::CodeMismatch { .. } => {
                (StatusCode::BAD_REQUEST, ErrorCode::CodeMismatch)
            }
            SettlementError::NotFound { .. } => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
            SettlementError::Unauthorized(_) => (StatusCode::FORBIDDEN, ErrorCode::Forbidden),
            SettlementError::Conflict(_) => (StatusCode::CONFLICT, ErrorCode::Conflict),
            SettlementError::AttemptsExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, ErrorCode::AttemptsExceeded)
            }
            SettlementError::OverdueClosure(_) => (StatusCode::CONFLICT, ErrorCode::OverdueClosure),
            SettlementError::Gateway(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::GatewayError)
            }
            SettlementError::Settings(_)
            | SettlementError::Store(_)
            | SettlementError::Money(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError)
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %err, "internal error surfaced to caller");
        }
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope: ResponseEnvelope<()> = ResponseEnvelope::err(self.code, self.message);
        (self.status, Json(envelope)).into_response()
    }
}

fn ok_envelope<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ResponseEnvelope::ok(data))).into_response()
}

fn header_uuid(headers: &HeaderMap, name: &'static str) -> Result<Option<Uuid>, ApiError> {
    let Some(raw) = headers.get(name) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("{name} header is not valid text")))?;
    let uuid = raw
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{name} header is not a valid id")))?;
    Ok(Some(uuid))
}

fn require_provider(headers: &HeaderMap) -> Result<ProviderId, ApiError> {
    header_uuid(headers, "x-provider-id")?
        .map(ProviderId)
        .ok_or_else(|| ApiError::forbidden("x-provider-id header required"))
}

fn require_client(headers: &HeaderMap) -> Result<ClientId, ApiError> {
    header_uuid(headers, "x-client-id")?
        .map(ClientId)
        .ok_or_else(|| ApiError::forbidden("x-client-id header required"))
}

fn require_actor(headers: &HeaderMap) -> Result<CashActor, ApiError> {
    if let Some(provider) = header_uuid(headers, "x-provider-id")? {
        return Ok(CashActor::Provider(ProviderId(provider)));
    }
    if let Some(client) = header_uuid(headers, "x-client-id")? {
        return Ok(CashActor::Client(ClientId(client)));
    }
    Err(ApiError::forbidden(
        "x-provider-id or x-client-id header required",
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    pub payment_id: marketplace_domain::PaymentId,
    pub appointment_id: AppointmentId,
    pub amount: marketplace_domain::Amount,
    pub tax_amount: marketplace_domain::Amount,
    pub commission_amount: marketplace_domain::Amount,
    pub provider_amount: marketplace_domain::Amount,
    pub payment_method: PaymentMethod,
    pub release_status: ReleaseStatus,
    pub paid_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl From<&PaymentRecord> for PaymentView {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            payment_id: record.payment_id,
            appointment_id: record.appointment_id,
            amount: record.amount,
            tax_amount: record.tax_amount,
            commission_amount: record.commission_amount,
            provider_amount: record.provider_amount,
            payment_method: record.payment_method,
            release_status: record.release_status,
            paid_at: record.paid_at,
            released_at: record.released_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebtView {
    pub debt_id: marketplace_domain::DebtId,
    pub commission_amount: marketplace_domain::Amount,
    pub due_date: DateTime<Utc>,
    pub status: marketplace_domain::DebtStatus,
}

impl From<&CommissionDebtRecord> for DebtView {
    fn from(record: &CommissionDebtRecord) -> Self {
        Self {
            debt_id: record.debt_id,
            commission_amount: record.commission_amount,
            due_date: record.due_date,
            status: record.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CashSettlementResponse {
    pub payment: PaymentView,
    pub commission_debt: Option<DebtView>,
}

impl From<&CashSettlement> for CashSettlementResponse {
    fn from(settlement: &CashSettlement) -> Self {
        Self {
            payment: PaymentView::from(&settlement.payment),
            commission_debt: settlement.debt.as_ref().map(DebtView::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CashSelectionResponse {
    pub appointment_id: AppointmentId,
    pub code_issued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosureStatusResponse {
    pub appointment_id: AppointmentId,
    pub state: ClosureState,
    pub provider_action: ProviderClosureAction,
    pub client_action: ClientClosureAction,
    pub due_at: Option<DateTime<Utc>>,
    pub notes: ClosureNotes,
}

impl From<&settlement::ClosureStatus> for ClosureStatusResponse {
    fn from(status: &settlement::ClosureStatus) -> Self {
        Self {
            appointment_id: status.appointment_id,
            state: status.state,
            provider_action: status.provider_action,
            client_action: status.client_action,
            due_at: status.due_at,
            notes: status.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyServiceResponse {
    pub verified_at: DateTime<Utc>,
    pub release_status: Option<ReleaseStatus>,
    pub funds_moved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationCodeResponse {
    pub appointment_id: AppointmentId,
    pub verification_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyCodeRequest {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderClosureRequest {
    pub action: ProviderClosureAction,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientClosureRequest {
    pub action: ClientClosureAction,
    #[serde(default)]
    pub note: Option<String>,
}

pub fn core_router<S>(state: Arc<CoreHttpState<S>>) -> Router
where
    S: SettlementStore + Send + Sync + 'static,
{
    Router::new()
        .route(
            "/appointments/{id}/cash/select",
            post(select_cash_payment::<S>),
        )
        .route("/appointments/{id}/cash/collect", post(collect_cash::<S>))
        .route("/appointments/{id}/cash/verify", post(verify_cash_code::<S>))
        .route(
            "/appointments/{id}/closure/provider",
            post(report_provider_closure::<S>),
        )
        .route(
            "/appointments/{id}/closure/client",
            post(report_client_closure::<S>),
        )
        .route("/appointments/{id}/closure", get(get_closure_status::<S>))
        .route("/appointments/{id}/verify", post(verify_service_code::<S>))
        .route(
            "/appointments/{id}/verification-code",
            get(get_verification_code::<S>),
        )
        .route(
            "/providers/{id}/earnings/{month}",
            get(get_earnings_summary::<S>),
        )
        .with_state(state)
}

async fn select_cash_payment<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = require_actor(&headers)?;
    let selection = state
        .engine
        .select_cash_payment(AppointmentId(id), actor)
        .await?;
    Ok(ok_envelope(CashSelectionResponse {
        appointment_id: selection.appointment_id,
        code_issued: selection.code_issued,
    }))
}

async fn collect_cash<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let provider_id = require_provider(&headers)?;
    let settlement = state
        .engine
        .collect_cash(AppointmentId(id), provider_id, TraceId::new())
        .await?;
    Ok(ok_envelope(CashSettlementResponse::from(&settlement)))
}

async fn verify_cash_code<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<VerifyCodeRequest>,
) -> Result<Response, ApiError> {
    let provider_id = require_provider(&headers)?;
    let settlement = state
        .engine
        .verify_cash_code(AppointmentId(id), provider_id, &request.code, TraceId::new())
        .await?;
    Ok(ok_envelope(CashSettlementResponse::from(&settlement)))
}

async fn report_provider_closure<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ProviderClosureRequest>,
) -> Result<Response, ApiError> {
    let provider_id = require_provider(&headers)?;
    let status = state
        .engine
        .report_provider_closure_action(
            AppointmentId(id),
            provider_id,
            request.action,
            request.note,
            TraceId::new(),
        )
        .await?;
    Ok(ok_envelope(ClosureStatusResponse::from(&status)))
}

async fn report_client_closure<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ClientClosureRequest>,
) -> Result<Response, ApiError> {
    let client_id = require_client(&headers)?;
    let status = state
        .engine
        .report_client_closure_action(
            AppointmentId(id),
            client_id,
            request.action,
            request.note,
            TraceId::new(),
        )
        .await?;
    Ok(ok_envelope(ClosureStatusResponse::from(&status)))
}

async fn get_closure_status<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let status = state.engine.get_closure_status(AppointmentId(id)).await?;
    Ok(ok_envelope(ClosureStatusResponse::from(&status)))
}

async fn verify_service_code<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<VerifyCodeRequest>,
) -> Result<Response, ApiError> {
    let provider_id = require_provider(&headers)?;
    let outcome = state
        .engine
        .verify_service_code(AppointmentId(id), provider_id, &request.code, TraceId::new())
        .await?;
    Ok(ok_envelope(VerifyServiceResponse {
        verified_at: outcome.verified_at,
        release_status: outcome.release.map(|r| r.release_status),
        funds_moved: outcome.release.map(|r| r.funds_moved).unwrap_or(false),
    }))
}

async fn get_verification_code<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let client_id = require_client(&headers)?;
    let code = state
        .engine
        .get_verification_code(AppointmentId(id), client_id)
        .await?;
    Ok(ok_envelope(VerificationCodeResponse {
        appointment_id: AppointmentId(id),
        verification_code: code,
    }))
}

async fn get_earnings_summary<S: SettlementStore + Send + Sync>(
    State(state): State<Arc<CoreHttpState<S>>>,
    Path((id, month)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let caller = require_provider(&headers)?;
    if caller != ProviderId(id) {
        return Err(ApiError::forbidden(
            "providers may only read their own earnings",
        ));
    }
    let summary: EarningsSummary = state.engine.earnings_summary(ProviderId(id), &month).await?;
    Ok(ok_envelope(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use marketplace_domain::Amount;
    use platform_settings::{InMemorySettingsProvider, PlatformSettings};
    use settlement_store::{AppointmentRecord, AppointmentRepository, InMemorySettlementStore};
    use tower::ServiceExt;

    struct Fixture {
        router: Router,
        appointment_id: AppointmentId,
        client_id: ClientId,
        provider_id: ProviderId,
    }

    async fn fixture() -> Fixture {
        let store = InMemorySettlementStore::new();
        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            Arc::new(InMemorySettingsProvider::new(PlatformSettings::default())),
        ));
        let appointment_id = AppointmentId::new();
        let client_id = ClientId::new();
        let provider_id = ProviderId::new();
        store
            .upsert(&AppointmentRecord::confirmed(
                appointment_id,
                client_id,
                provider_id,
                Amount(50_000),
            ))
            .await
            .expect("seed");
        Fixture {
            router: core_router(Arc::new(CoreHttpState { engine })),
            appointment_id,
            client_id,
            provider_id,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn cash_collection_round_trips_through_http() {
        let f = fixture().await;
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/appointments/{}/cash/collect", f.appointment_id))
                    .header("x-provider-id", f.provider_id.to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], serde_json::json!(true));
        assert_eq!(
            body["data"]["payment"]["commission_amount"],
            serde_json::json!(7_500)
        );
        assert_eq!(
            body["data"]["commission_debt"]["status"],
            serde_json::json!("pending")
        );
    }

    #[tokio::test]
    async fn code_endpoints_enforce_party_roles() {
        let f = fixture().await;

        // Selecting cash as the client issues the code.
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/appointments/{}/cash/select", f.appointment_id))
                    .header("x-client-id", f.client_id.to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // Only the appointment's client may read it back.
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/appointments/{}/verification-code",
                        f.appointment_id
                    ))
                    .header("x-client-id", ClientId::new().to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/appointments/{}/verification-code",
                        f.appointment_id
                    ))
                    .header("x-client-id", f.client_id.to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let code = body["data"]["verification_code"]
            .as_str()
            .expect("code")
            .to_string();
        assert_eq!(code.len(), 4);

        // Wrong code surfaces the mismatch taxonomy.
        let wrong = if code == "1111" { "2222" } else { "1111" };
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/appointments/{}/cash/verify", f.appointment_id))
                    .header("x-provider-id", f.provider_id.to_string())
                    .header("content-type", "application/json")
                    .body(Body::from(format!("{{\"code\":\"{wrong}\"}}")))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], serde_json::json!("CODE_MISMATCH"));
    }

    #[tokio::test]
    async fn unknown_appointment_maps_to_not_found() {
        let f = fixture().await;
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/appointments/{}/cash/collect", AppointmentId::new()))
                    .header("x-provider-id", f.provider_id.to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], serde_json::json!("NOT_FOUND"));
    }

    #[tokio::test]
    async fn earnings_are_private_to_the_provider() {
        let f = fixture().await;
        let month = Utc::now().format("%Y-%m").to_string();
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/providers/{}/earnings/{month}", f.provider_id))
                    .header("x-provider-id", ProviderId::new().to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/providers/{}/earnings/{month}", f.provider_id))
                    .header("x-provider-id", f.provider_id.to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["payments_count"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn missing_actor_header_is_forbidden() {
        let f = fixture().await;
        let response = f
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/appointments/{}/cash/select", f.appointment_id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
