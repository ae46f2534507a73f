use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "0.0.1";

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub path: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(path, sha256, body)| ContractSchemaManifest { path, sha256, body })
            .collect(),
    }
}

pub fn schema_body(file_name: &str) -> Option<&'static str> {
    GENERATED_CONTRACT_SCHEMAS
        .iter()
        .find(|(path, _, _)| path.ends_with(file_name))
        .map(|(_, _, body)| *body)
}

/// Slot names shared with the dialogue framework's domain.
pub mod slots {
    pub const IDENTITY_VERIFIED: &str = "identity_verified";
    pub const VERIFICATION_ATTEMPTS: &str = "verification_attempts";
    pub const REQUESTED_ACTION: &str = "requested_action";
    pub const ACCOUNT_TYPE: &str = "account_type";
    pub const BRANCH_LOCATION: &str = "branch_location";
    pub const CARD_TYPE: &str = "card_type";
}

/// Entity kinds read from the latest message.
pub mod entities {
    pub const ACCOUNT_NUMBER: &str = "account_number";
    pub const BRANCH_LOCATION: &str = "branch_location";
    pub const CARD_TYPE: &str = "card_type";
}

/// Account-scoped operations that require a verified identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedAction {
    CheckBalance,
    ViewTransactions,
}

impl ProtectedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtectedAction::CheckBalance => "check_balance",
            ProtectedAction::ViewTransactions => "view_transactions",
        }
    }

    pub fn from_slot(value: &str) -> Option<Self> {
        match value {
            "check_balance" => Some(ProtectedAction::CheckBalance),
            "view_transactions" => Some(ProtectedAction::ViewTransactions),
            _ => None,
        }
    }
}

/// Every action name this server answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisteredAction {
    CheckBalance,
    ViewTransactions,
    VerifyIdentity,
    SetIdentityVerified,
    LostCardFlow,
    BranchLocator,
    GeneralFaq,
    FallbackHandler,
}

impl RegisteredAction {
    pub const ALL: [RegisteredAction; 8] = [
        RegisteredAction::CheckBalance,
        RegisteredAction::ViewTransactions,
        RegisteredAction::VerifyIdentity,
        RegisteredAction::SetIdentityVerified,
        RegisteredAction::LostCardFlow,
        RegisteredAction::BranchLocator,
        RegisteredAction::GeneralFaq,
        RegisteredAction::FallbackHandler,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RegisteredAction::CheckBalance => "action_check_balance",
            RegisteredAction::ViewTransactions => "action_view_transactions",
            RegisteredAction::VerifyIdentity => "action_verify_identity",
            RegisteredAction::SetIdentityVerified => "action_set_identity_verified",
            RegisteredAction::LostCardFlow => "action_lost_card_flow",
            RegisteredAction::BranchLocator => "action_branch_locator",
            RegisteredAction::GeneralFaq => "action_general_faq",
            RegisteredAction::FallbackHandler => "action_fallback_handler",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    pub entity: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl LatestMessage {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// First entity of `kind`, rendered as a string. Null values count as absent.
    pub fn entity(&self, kind: &str) -> Option<String> {
        self.entities
            .iter()
            .find(|e| e.entity == kind)
            .and_then(|e| match &e.value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tracker {
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub slots: BTreeMap<String, Value>,
    #[serde(default)]
    pub latest_message: LatestMessage,
}

/// One webhook request from the dialogue framework. Unknown fields are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCall {
    pub next_action: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub tracker: Tracker,
    #[serde(default)]
    pub domain: Option<Value>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ActionCall {
    pub fn sender(&self) -> &str {
        self.sender_id
            .as_deref()
            .or(self.tracker.sender_id.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotEvent {
    pub event: String,
    pub name: String,
    pub value: Value,
    pub timestamp: Option<f64>,
}

impl SlotEvent {
    pub fn set(name: impl Into<String>, value: Value) -> Self {
        Self {
            event: "slot".to_string(),
            name: name.into(),
            value,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotResponse {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionResponse {
    pub events: Vec<SlotEvent>,
    pub responses: Vec<BotResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionNotFound {
    pub error: String,
    pub action_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDescriptor {
    pub name: String,
}

/// Message posted to the chatbot's REST channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestMessage {
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestReply {
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub api_version: String,
    pub contracts_set_sha256: String,
    pub generated_at: String,
    pub schemas: BTreeMap<String, String>,
    pub actions: Vec<String>,
}
