use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use teller_config::Config;
use teller_contracts::{
    contracts_manifest_v1, slots, ActionCall, ActionDescriptor, ActionNotFound, ActionResponse,
    BotResponse, ContractsMetadata, ErrorBody, ErrorResponse, ProtectedAction, RegisteredAction,
    SlotEvent, API_VERSION,
};
use teller_kernel::{
    answer_faq, fallback, jcs_sha256_hex, locate_branch, lost_card_flow, mark_verified,
    request_protected_action, submit_credential, ConversationState, Directive, GateConfig,
    GateOutcome, GateStep, LostCardRoute,
};
use thiserror::Error;
use tokio::sync::Mutex;

pub mod smoke;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "action server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/actions", get(actions))
        .route("/webhook", post(webhook))
        .with_state(state))
}

pub fn gate_config(cfg: &Config) -> GateConfig {
    GateConfig {
        max_attempts: cfg.gate.max_attempts,
        min_credential_digits: cfg.gate.min_credential_digits,
        clear_deferred_on_lockout: cfg.gate.clear_deferred_on_lockout,
        default_account_type: cfg.gate.default_account_type.clone(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {name} must be {expected} or null")]
    WrongType {
        name: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
enum CallError {
    #[error("No registered action found for name '{0}'.")]
    NotFound(String),
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Reads the gate's slots from the tracker. Missing and null slots take their initial values.
pub fn decode_state(values: &BTreeMap<String, Value>) -> Result<ConversationState, SlotError> {
    let identity_verified = match values.get(slots::IDENTITY_VERIFIED) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(v)) => *v,
        Some(_) => {
            return Err(SlotError::WrongType {
                name: slots::IDENTITY_VERIFIED,
                expected: "a bool",
            })
        }
    };

    let verification_attempts = match values.get(slots::VERIFICATION_ATTEMPTS) {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => {
            let raw = n.as_f64().unwrap_or(0.0);
            if raw.is_finite() && raw > 0.0 {
                raw.min(f64::from(u32::MAX)) as u32
            } else {
                0
            }
        }
        Some(_) => {
            return Err(SlotError::WrongType {
                name: slots::VERIFICATION_ATTEMPTS,
                expected: "a number",
            })
        }
    };

    let requested_action =
        str_slot(values, slots::REQUESTED_ACTION)?.and_then(|v| ProtectedAction::from_slot(&v));

    Ok(ConversationState {
        identity_verified,
        verification_attempts,
        requested_action,
        account_type: str_slot(values, slots::ACCOUNT_TYPE)?,
    })
}

fn str_slot(
    values: &BTreeMap<String, Value>,
    name: &'static str,
) -> Result<Option<String>, SlotError> {
    match values.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(SlotError::WrongType {
            name,
            expected: "a string",
        }),
    }
}

pub fn render(directive: Directive) -> ActionResponse {
    ActionResponse {
        events: directive
            .slots
            .into_iter()
            .map(|update| SlotEvent::set(update.name, update.value))
            .collect(),
        responses: directive
            .texts
            .into_iter()
            .map(|text| BotResponse { text })
            .collect(),
    }
}

#[derive(Clone)]
struct AppState {
    gate: Arc<GateConfig>,
    audit: Arc<AuditJsonl>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        Ok(Self {
            gate: Arc::new(gate_config(&cfg)),
            audit: Arc::new(
                AuditJsonl::new(
                    &cfg.audit.jsonl_path,
                    cfg.audit.sqlite_path.as_deref(),
                    cfg.audit.immutable_mirror_path.as_deref(),
                )
                .await?,
            ),
        })
    }

    async fn run_action(&self, call: ActionCall) -> Result<ActionResponse, CallError> {
        let action = RegisteredAction::from_name(&call.next_action)
            .ok_or_else(|| CallError::NotFound(call.next_action.clone()))?;
        let state = decode_state(&call.tracker.slots)?;
        let message = &call.tracker.latest_message;
        let gate = self.gate.as_ref();
        let now = Utc::now();

        let (directive, outcome) = match action {
            RegisteredAction::CheckBalance => gated(request_protected_action(
                &state,
                ProtectedAction::CheckBalance,
                gate,
                now,
            )),
            RegisteredAction::ViewTransactions => gated(request_protected_action(
                &state,
                ProtectedAction::ViewTransactions,
                gate,
                now,
            )),
            RegisteredAction::VerifyIdentity => {
                gated(submit_credential(&state, message, gate, now))
            }
            RegisteredAction::SetIdentityVerified => gated(mark_verified(&state)),
            RegisteredAction::LostCardFlow => {
                let card_type = str_slot(&call.tracker.slots, slots::CARD_TYPE)?;
                match lost_card_flow(&state, message, card_type.as_deref(), gate, now) {
                    LostCardRoute::Credential(step) => gated(step),
                    LostCardRoute::Report(directive) => (directive, None),
                }
            }
            RegisteredAction::BranchLocator => {
                let location = str_slot(&call.tracker.slots, slots::BRANCH_LOCATION)?;
                (locate_branch(message, location.as_deref()), None)
            }
            RegisteredAction::GeneralFaq => (answer_faq(message), None),
            RegisteredAction::FallbackHandler => (fallback(), None),
        };

        let sender = call.sender().to_string();
        let mut record = AuditRecord::new(&sender, action.name(), "ok", "responded");
        if let Some(outcome) = outcome {
            record = record.with_outcome(outcome);
            if outcome.is_denial() {
                tracing::warn!(
                    sender = %sender,
                    action = action.name(),
                    reason_code = outcome.reason_code(),
                    "verification denied"
                );
            } else {
                tracing::info!(
                    sender = %sender,
                    action = action.name(),
                    reason_code = outcome.reason_code(),
                    "gate decision"
                );
            }
        } else {
            tracing::debug!(sender = %sender, action = action.name(), "action handled");
        }
        self.audit.append(record).await;

        Ok(render(directive))
    }
}

fn gated(step: GateStep) -> (Directive, Option<GateOutcome>) {
    (step.directive, Some(step.outcome))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<ContractsMetadata> {
    let manifest = contracts_manifest_v1();
    Json(ContractsMetadata {
        api_version: API_VERSION.to_string(),
        contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
        generated_at: manifest.generated_at.to_string(),
        schemas: manifest
            .schemas
            .iter()
            .map(|s| (s.path.to_string(), s.sha256.to_string()))
            .collect(),
        actions: RegisteredAction::ALL
            .iter()
            .map(|a| a.name().to_string())
            .collect(),
    })
}

async fn actions() -> Json<Vec<ActionDescriptor>> {
    Json(
        RegisteredAction::ALL
            .iter()
            .map(|a| ActionDescriptor {
                name: a.name().to_string(),
            })
            .collect(),
    )
}

async fn webhook(
    State(state): State<AppState>,
    Json(call): Json<ActionCall>,
) -> Result<Json<ActionResponse>, Response> {
    state.run_action(call).await.map(Json).map_err(|e| match e {
        CallError::NotFound(ref name) => {
            tracing::warn!(action = %name, "unknown action requested");
            (
                StatusCode::NOT_FOUND,
                Json(ActionNotFound {
                    error: e.to_string(),
                    action_name: name.clone(),
                }),
            )
                .into_response()
        }
        CallError::Slot(err) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: "validation_error".to_string(),
                    message: err.to_string(),
                    details: None,
                },
            }),
        )
            .into_response(),
    })
}

struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    immutable_mirror: Option<Arc<Mutex<tokio::fs::File>>>,
    sqlite: Option<Arc<Mutex<Connection>>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Serialize, Deserialize, Clone)]
struct AuditRecord {
    audit_id: String,
    sender_id: String,
    action: String,
    result: String,
    reason_code: String,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_digits: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    replayed_action: Option<ProtectedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

impl AuditRecord {
    fn new(sender_id: &str, action: &str, result: &str, reason_code: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            sender_id: sender_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            attempts: None,
            credential_digits: None,
            replayed_action: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn with_outcome(mut self, outcome: GateOutcome) -> Self {
        self.result = if outcome.is_denial() { "deny" } else { "allow" }.to_string();
        self.reason_code = outcome.reason_code().to_string();
        match outcome {
            GateOutcome::Accepted {
                replayed,
                credential_digits,
            } => {
                self.credential_digits = Some(credential_digits);
                self.replayed_action = replayed;
            }
            GateOutcome::Rejected { attempts } => self.attempts = Some(attempts),
            _ => {}
        }
        self
    }

    /// Hash over the JCS form of the record with `record_hash` blanked.
    fn seal_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

impl AuditJsonl {
    async fn new(
        path: &str,
        sqlite_path: Option<&str>,
        immutable_mirror_path: Option<&str>,
    ) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(Arc::new(Mutex::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| e.to_string())?,
            ))),
            _ => None,
        };

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        sender_id TEXT NOT NULL,
                        action TEXT NOT NULL,
                        result TEXT NOT NULL,
                        reason_code TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Arc::new(Mutex::new(conn)))
            }
            None => None,
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            immutable_mirror,
            sqlite,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    async fn append(&self, mut rec: AuditRecord) {
        use tokio::io::AsyncWriteExt;

        // Held across the write so concurrent appends keep the chain linear.
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash = match rec.seal_hash() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "audit record hash failed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "audit record serialize failed");
                return;
            }
        };

        {
            let mut file = self.file.lock().await;
            if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                tracing::error!(error = %e, "audit append failed");
                return;
            }
        }
        *last_hash = Some(rec.record_hash.clone());

        if let Some(mirror) = &self.immutable_mirror {
            let mut mirror_file = mirror.lock().await;
            if let Err(e) = mirror_file.write_all(format!("{line}\n").as_bytes()).await {
                tracing::warn!(error = %e, "audit mirror append failed");
            }
        }

        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite.lock().await;
            if let Err(e) = conn.execute(
                "
                INSERT OR REPLACE INTO audit_records
                (audit_id, sender_id, action, result, reason_code, ts, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    rec.audit_id,
                    rec.sender_id,
                    rec.action,
                    rec.result,
                    rec.reason_code,
                    rec.ts,
                    line
                ],
            ) {
                tracing::warn!(error = %e, "audit sqlite mirror failed");
            }
        }
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let count = verify_chain_text(&text)?;
    Ok(format!("audit chain verified: {count} records"))
}

pub fn verify_audit_chain_with_mirror(path: &str, mirror: Option<&str>) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    let Some(mirror) = mirror else {
        return Ok(summary);
    };
    let primary = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let copy = std::fs::read_to_string(mirror).map_err(|e| e.to_string())?;
    if primary != copy {
        return Err(format!("audit mirror {mirror} diverges from {path}"));
    }
    Ok(format!("{summary}; mirror identical"))
}

fn verify_chain_text(text: &str) -> Result<usize, String> {
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .seal_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(count)
}
