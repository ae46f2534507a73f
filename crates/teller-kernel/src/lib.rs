use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use teller_contracts::{entities, slots, LatestMessage, ProtectedAction};

pub const DEFAULT_ACCOUNT_TYPE: &str = "checking";

const CREDENTIAL_PROMPT: &str = "For security purposes, I need to verify your identity before accessing account information. Please provide your account number or customer ID.";
const CREDENTIAL_REPROMPT: &str = "I need a valid account number (6+ digits) to verify your identity. Please provide your account number.";
const LOCKOUT_MESSAGE: &str = "I'm sorry, I couldn't verify your identity after multiple attempts. For your security, I can only provide general information. Would you like to speak with a human agent?";
const VERIFIED_ACK: &str = "Identity verified.";
const VERIFIED_GENERIC: &str = "Identity verified successfully. How can I assist you?";
const ALREADY_VERIFIED: &str = "Your identity is already verified. How can I assist you?";

/// The subset of conversation slots the gate reads and rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub identity_verified: bool,
    pub verification_attempts: u32,
    pub requested_action: Option<ProtectedAction>,
    pub account_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub max_attempts: u32,
    pub min_credential_digits: usize,
    pub clear_deferred_on_lockout: bool,
    pub default_account_type: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_credential_digits: 6,
            clear_deferred_on_lockout: true,
            default_account_type: DEFAULT_ACCOUNT_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotUpdate {
    pub name: &'static str,
    pub value: Value,
}

/// Slot updates plus outgoing texts, in the order the framework should apply them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    pub slots: Vec<SlotUpdate>,
    pub texts: Vec<String>,
}

impl Directive {
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            slots: Vec::new(),
            texts: vec![text.into()],
        }
    }

    pub fn text(&self) -> String {
        self.texts.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Prompted(ProtectedAction),
    Performed(ProtectedAction),
    Accepted {
        replayed: Option<ProtectedAction>,
        credential_digits: usize,
    },
    Rejected {
        attempts: u32,
    },
    LockedOut,
    AlreadyVerified,
    MarkedVerified,
}

impl GateOutcome {
    pub fn reason_code(self) -> &'static str {
        match self {
            GateOutcome::Prompted(_) => "verification_required",
            GateOutcome::Performed(_) => "verified_session",
            GateOutcome::Accepted { replayed: Some(_), .. } => "credential_accepted_replayed",
            GateOutcome::Accepted { replayed: None, .. } => "credential_accepted",
            GateOutcome::Rejected { .. } => "invalid_credential",
            GateOutcome::LockedOut => "locked_out",
            GateOutcome::AlreadyVerified => "already_verified",
            GateOutcome::MarkedVerified => "marked_verified",
        }
    }

    pub fn is_denial(self) -> bool {
        matches!(self, GateOutcome::Rejected { .. } | GateOutcome::LockedOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateStep {
    pub state: ConversationState,
    pub directive: Directive,
    pub outcome: GateOutcome,
}

impl GateStep {
    fn new(
        before: &ConversationState,
        after: ConversationState,
        texts: Vec<String>,
        outcome: GateOutcome,
    ) -> Self {
        Self {
            directive: Directive {
                slots: slot_updates(before, &after),
                texts,
            },
            state: after,
            outcome,
        }
    }
}

/// A candidate credential with everything but its digits stripped.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    digits: String,
}

impl Credential {
    pub fn digit_count(&self) -> usize {
        self.digits.len()
    }
}

// Never print the digits themselves.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({} digits)", self.digits.len())
    }
}

pub fn resolve_account_type<'a>(state: &'a ConversationState, cfg: &'a GateConfig) -> &'a str {
    state
        .account_type
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(cfg.default_account_type.as_str())
}

pub fn request_protected_action(
    state: &ConversationState,
    action: ProtectedAction,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> GateStep {
    if state.identity_verified {
        let text = perform_protected_action(state, action, cfg, now);
        return GateStep::new(state, state.clone(), vec![text], GateOutcome::Performed(action));
    }

    let mut next = state.clone();
    next.requested_action = Some(action);
    GateStep::new(
        state,
        next,
        vec![CREDENTIAL_PROMPT.to_string()],
        GateOutcome::Prompted(action),
    )
}

pub fn submit_credential(
    state: &ConversationState,
    message: &LatestMessage,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> GateStep {
    if state.identity_verified {
        return GateStep::new(
            state,
            state.clone(),
            vec![ALREADY_VERIFIED.to_string()],
            GateOutcome::AlreadyVerified,
        );
    }

    match extract_credential(message, cfg.min_credential_digits) {
        Some(credential) if credential_is_valid(&credential, cfg) => {
            accept(state, &credential, cfg, now)
        }
        _ => reject(state, cfg),
    }
}

/// Marks the session verified without a credential or replay.
pub fn mark_verified(state: &ConversationState) -> GateStep {
    let next = ConversationState {
        identity_verified: true,
        verification_attempts: 0,
        requested_action: None,
        account_type: state.account_type.clone(),
    };
    GateStep::new(state, next, Vec::new(), GateOutcome::MarkedVerified)
}

fn accept(
    state: &ConversationState,
    credential: &Credential,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> GateStep {
    let replayed = state.requested_action;
    let text = match replayed {
        Some(action) => format!(
            "{VERIFIED_ACK} {}",
            perform_protected_action(state, action, cfg, now)
        ),
        None => VERIFIED_GENERIC.to_string(),
    };
    let next = ConversationState {
        identity_verified: true,
        verification_attempts: 0,
        requested_action: None,
        account_type: state.account_type.clone(),
    };
    GateStep::new(
        state,
        next,
        vec![text],
        GateOutcome::Accepted {
            replayed,
            credential_digits: credential.digit_count(),
        },
    )
}

fn reject(state: &ConversationState, cfg: &GateConfig) -> GateStep {
    let attempts = state.verification_attempts.saturating_add(1);
    let mut next = state.clone();
    next.identity_verified = false;

    if attempts >= cfg.max_attempts {
        next.verification_attempts = 0;
        if cfg.clear_deferred_on_lockout {
            next.requested_action = None;
        }
        return GateStep::new(
            state,
            next,
            vec![LOCKOUT_MESSAGE.to_string()],
            GateOutcome::LockedOut,
        );
    }

    next.verification_attempts = attempts;
    GateStep::new(
        state,
        next,
        vec![CREDENTIAL_REPROMPT.to_string()],
        GateOutcome::Rejected { attempts },
    )
}

/// Prefers an `account_number` entity; otherwise the first all-digit token
/// of at least `min_digits` characters in the utterance. An entity without
/// digits counts as absent.
pub fn extract_credential(message: &LatestMessage, min_digits: usize) -> Option<Credential> {
    let entity_digits = message
        .entity(entities::ACCOUNT_NUMBER)
        .map(|value| value.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
        .filter(|digits| !digits.is_empty());
    if let Some(digits) = entity_digits {
        return Some(Credential { digits });
    }
    message
        .text()
        .split_whitespace()
        .find(|word| is_digit_token(word) && word.len() >= min_digits)
        .map(|word| Credential {
            digits: word.to_string(),
        })
}

/// Mocked acceptance rule: enough digits, no registry lookup.
pub fn credential_is_valid(credential: &Credential, cfg: &GateConfig) -> bool {
    credential.digit_count() >= cfg.min_credential_digits
}

/// True when the whole utterance is a bare credential rather than free text.
pub fn is_bare_credential(text: &str, min_digits: usize) -> bool {
    let text = text.trim();
    is_digit_token(text) && text.len() >= min_digits
}

fn is_digit_token(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_ascii_digit())
}

pub fn perform_protected_action(
    state: &ConversationState,
    action: ProtectedAction,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> String {
    match action {
        ProtectedAction::CheckBalance => {
            let account_type = resolve_account_type(state, cfg);
            format!(
                "Your {account_type} account balance is {}. Is there anything else I can help with?",
                balance_for(account_type)
            )
        }
        ProtectedAction::ViewTransactions => format!(
            "Here are your recent transactions:\n\n{}\n\nIs there anything else you need?",
            recent_transactions(now)
                .iter()
                .map(|tx| format!("{}: {} {}", tx.date, tx.description, tx.amount))
                .collect::<Vec<_>>()
                .join("\n")
        ),
    }
}

const BALANCES: &[(&str, &str)] = &[("checking", "$5,432.10"), ("savings", "$12,345.67")];
const DEFAULT_BALANCE: &str = "$5,432.10";

pub fn balance_for(account_type: &str) -> &'static str {
    let key = account_type.to_lowercase();
    BALANCES
        .iter()
        .find(|(kind, _)| *kind == key)
        .map(|(_, balance)| *balance)
        .unwrap_or(DEFAULT_BALANCE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub date: String,
    pub description: &'static str,
    pub amount: &'static str,
}

const TRANSACTIONS: &[(i64, &str, &str)] = &[
    (1, "DEBIT CARD PURCHASE - COFFEE SHOP", "-$4.50"),
    (1, "DIRECT DEPOSIT - SALARY", "+$3,500.00"),
    (2, "ONLINE BILL PAY - UTILITIES", "-$125.00"),
    (3, "ATM WITHDRAWAL", "-$100.00"),
    (4, "TRANSFER FROM SAVINGS", "+$500.00"),
];

/// Most recent first; dates are relative to `now`.
pub fn recent_transactions(now: DateTime<Utc>) -> Vec<Transaction> {
    TRANSACTIONS
        .iter()
        .map(|&(days_ago, description, amount)| Transaction {
            date: (now - Duration::days(days_ago))
                .format("%Y-%m-%d")
                .to_string(),
            description,
            amount,
        })
        .collect()
}

pub struct Branch {
    pub name: &'static str,
    pub address: &'static str,
    pub phone: &'static str,
    pub hours: &'static str,
}

const WEEKDAY_HOURS: &str = "Mon-Fri: 9:00 AM - 5:00 PM, Sat: 9:00 AM - 2:00 PM";

const BRANCHES: &[(&str, Branch)] = &[
    (
        "new york",
        Branch {
            name: "Main Street Branch",
            address: "123 Main Street, New York, NY 10001",
            phone: "(212) 555-0100",
            hours: WEEKDAY_HOURS,
        },
    ),
    (
        "downtown",
        Branch {
            name: "Downtown Branch",
            address: "456 Market Street, New York, NY 10002",
            phone: "(212) 555-0200",
            hours: "Mon-Fri: 8:30 AM - 6:00 PM, Sat: 10:00 AM - 3:00 PM",
        },
    ),
];

static CENTRAL_BRANCH: Branch = Branch {
    name: "Central Branch",
    address: "789 Bank Avenue, New York, NY 10003",
    phone: "(212) 555-0300",
    hours: WEEKDAY_HOURS,
};

pub fn find_branch(location: Option<&str>) -> &'static Branch {
    let key = location.map(|v| v.trim().to_lowercase());
    BRANCHES
        .iter()
        .find(|(name, _)| key.as_deref() == Some(*name))
        .map(|(_, branch)| branch)
        .unwrap_or(&CENTRAL_BRANCH)
}

/// Entity first, slot second.
pub fn locate_branch(message: &LatestMessage, slot_location: Option<&str>) -> Directive {
    let entity_location = message.entity(entities::BRANCH_LOCATION);
    let location = entity_location
        .as_deref()
        .filter(|v| !v.is_empty())
        .or(slot_location);
    let branch = find_branch(location);
    Directive::say(format!(
        "The nearest branch is:\n\n{}\nAddress: {}\nPhone: {}\nHours: {}",
        branch.name, branch.address, branch.phone, branch.hours
    ))
}

const LOST_CARD_STEPS: &str = "Here are the steps to secure your account:\n\
1. Freeze your card immediately to prevent unauthorized use\n\
2. Report the incident through our online portal or mobile app\n\
3. Request a replacement card\n\
4. Monitor your account for any suspicious activity\n\n\
For security reasons, I cannot freeze your card directly through this chat. \
Would you like me to connect you with a human agent who can process these actions immediately?";

#[derive(Debug, Clone, PartialEq)]
pub enum LostCardRoute {
    /// A pending verification absorbed the utterance as a credential.
    Credential(GateStep),
    Report(Directive),
}

pub fn lost_card_flow(
    state: &ConversationState,
    message: &LatestMessage,
    card_type_slot: Option<&str>,
    cfg: &GateConfig,
    now: DateTime<Utc>,
) -> LostCardRoute {
    if state.requested_action.is_some()
        && is_bare_credential(message.text(), cfg.min_credential_digits)
    {
        return LostCardRoute::Credential(submit_credential(state, message, cfg, now));
    }

    let entity_card = message.entity(entities::CARD_TYPE);
    let card_type = card_type_slot
        .filter(|v| !v.is_empty())
        .or(entity_card.as_deref())
        .filter(|v| !v.is_empty() && *v != "None")
        .unwrap_or("card");

    LostCardRoute::Report(Directive {
        slots: Vec::new(),
        texts: vec![
            format!(
                "I'm sorry to hear that your {card_type} has been lost or stolen. This must be stressful. I can help guide you through the steps to protect your account."
            ),
            LOST_CARD_STEPS.to_string(),
        ],
    })
}

/// One FAQ entry: matches when the lower-cased utterance contains `keyword`.
pub struct FaqRule {
    pub keyword: &'static str,
    pub answer: &'static str,
}

impl FaqRule {
    pub fn matches(&self, lowered: &str) -> bool {
        lowered.contains(self.keyword)
    }
}

pub const FAQ_RULES: &[FaqRule] = &[
    FaqRule {
        keyword: "hours",
        answer: "Our branch hours are Monday-Friday: 9:00 AM - 5:00 PM, Saturday: 9:00 AM - 2:00 PM. Online and mobile banking are available 24/7.",
    },
    FaqRule {
        keyword: "open",
        answer: "Our branches are open Monday-Friday: 9:00 AM - 5:00 PM, Saturday: 9:00 AM - 2:00 PM.",
    },
    FaqRule {
        keyword: "services",
        answer: "We offer checking accounts, savings accounts, credit cards, loans, mortgages, investment services, and online/mobile banking.",
    },
    FaqRule {
        keyword: "minimum balance",
        answer: "Our checking account requires a minimum balance of $100. Savings accounts have no minimum balance requirement.",
    },
    FaqRule {
        keyword: "interest rates",
        answer: "Current interest rates vary by account type. Please visit our website or contact a branch for current rates.",
    },
    FaqRule {
        keyword: "fees",
        answer: "Our fee schedule depends on the account type. Most basic accounts have no monthly fees. Please check our website or speak with an agent for details.",
    },
    FaqRule {
        keyword: "transfer money",
        answer: "You can transfer money using online banking, mobile app, or by visiting a branch. Online and mobile transfers are instant.",
    },
    FaqRule {
        keyword: "pay bills",
        answer: "You can pay bills through online banking or our mobile app. Simply add a payee and schedule payments.",
    },
    FaqRule {
        keyword: "password",
        answer: "To change your password, log in to online banking, go to Settings > Security > Change Password. For password reset, click 'Forgot Password' on the login page.",
    },
    FaqRule {
        keyword: "address",
        answer: "To update your address, log in to online banking and go to Profile > Personal Information, or visit a branch with valid ID.",
    },
    FaqRule {
        keyword: "mobile banking",
        answer: "Our mobile banking app is available for iOS and Android. Download it from the App Store or Google Play Store.",
    },
    FaqRule {
        keyword: "online banking",
        answer: "Online banking is available 24/7. Register at our website using your account number and personal information.",
    },
];

const FAQ_DEFAULT: &str = "I can help you with information about our banking services, account features, branch locations, and general inquiries. For specific account information, I'll need to verify your identity first. Is there something specific you'd like to know?";

pub fn answer_faq(message: &LatestMessage) -> Directive {
    let lowered = message.text().to_lowercase();
    let answer = FAQ_RULES
        .iter()
        .find(|rule| rule.matches(&lowered))
        .map(|rule| rule.answer)
        .unwrap_or(FAQ_DEFAULT);
    Directive::say(answer)
}

const FALLBACK_TEXT: &str = "I'm not entirely sure how to help with that. I can assist with:\n\
- Checking account balance\n\
- Viewing recent transactions\n\
- Finding branch locations\n\
- Lost or stolen card assistance\n\
- General banking questions\n\n\
If you need help with something else, I can connect you with a human agent. Would you like to speak with someone?";

pub fn fallback() -> Directive {
    Directive::say(FALLBACK_TEXT)
}

/// Slot updates that turn `before` into `after`; unchanged slots are omitted.
pub fn slot_updates(before: &ConversationState, after: &ConversationState) -> Vec<SlotUpdate> {
    let mut out = Vec::new();
    if before.identity_verified != after.identity_verified {
        out.push(SlotUpdate {
            name: slots::IDENTITY_VERIFIED,
            value: Value::Bool(after.identity_verified),
        });
    }
    if before.verification_attempts != after.verification_attempts {
        // The framework keeps this slot as a float.
        out.push(SlotUpdate {
            name: slots::VERIFICATION_ATTEMPTS,
            value: json!(f64::from(after.verification_attempts)),
        });
    }
    if before.requested_action != after.requested_action {
        out.push(SlotUpdate {
            name: slots::REQUESTED_ACTION,
            value: after
                .requested_action
                .map(|a| Value::String(a.as_str().to_string()))
                .unwrap_or(Value::Null),
        });
    }
    out
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
