use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use teller_config::{Audit, Config, Gate, Server, Smoke};
use teller_contracts::{schema_body, ActionNotFound, API_VERSION};
use teller_server::{build_app, verify_audit_chain, verify_audit_chain_with_mirror};
use tower::util::ServiceExt;

fn test_config() -> Config {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        gate: Gate {
            max_attempts: 3,
            min_credential_digits: 6,
            clear_deferred_on_lockout: true,
            default_account_type: "checking".to_string(),
        },
        audit: Audit {
            sink: "jsonl".to_string(),
            jsonl_path: std::env::temp_dir()
                .join(format!("teller-audit-{nanos}.jsonl"))
                .to_string_lossy()
                .to_string(),
            immutable_mirror_path: None,
            sqlite_path: None,
        },
        smoke: Smoke::default(),
    }
}

fn action_call(next_action: &str, slots: Value, text: &str, entities: Value) -> Value {
    json!({
        "next_action": next_action,
        "sender_id": "test_user",
        "tracker": {
            "sender_id": "test_user",
            "slots": slots,
            "latest_message": {
                "text": text,
                "intent": {"name": "irrelevant", "confidence": 0.9},
                "entities": entities
            },
            "events": [],
            "latest_action_name": "action_listen"
        },
        "domain": {},
        "version": "3.6.0"
    })
}

async fn post_webhook(app: &Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn slot_value<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    payload["events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == name)
        .map(|e| &e["value"])
}

fn texts(payload: &Value) -> Vec<String> {
    payload["responses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["text"].as_str().unwrap().to_string())
        .collect()
}

fn assert_matches_contract(payload: &Value) {
    let schema: Value =
        serde_json::from_str(schema_body("action_response.schema.json").unwrap()).unwrap();
    let validator = jsonschema::validator_for(&schema).unwrap();
    assert!(validator.is_valid(payload), "response violates contract: {payload}");
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn contracts_endpoint_lists_schemas_and_actions() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/contracts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["api_version"], API_VERSION);
    assert!(payload["contracts_set_sha256"].as_str().unwrap().len() == 64);
    assert!(payload["schemas"]["../contracts/v1/action_response.schema.json"].is_string());
    assert_eq!(payload["actions"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn actions_endpoint_lists_registered_names() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .oneshot(Request::builder().uri("/actions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert!(payload
        .as_array()
        .unwrap()
        .contains(&json!({"name": "action_verify_identity"})));
}

#[tokio::test]
async fn balance_request_defers_until_verified() {
    let app = build_app(test_config()).await.unwrap();

    let (status, first) = post_webhook(
        &app,
        action_call("action_check_balance", json!({}), "What's my balance?", json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_matches_contract(&first);
    assert_eq!(slot_value(&first, "requested_action"), Some(&json!("check_balance")));
    assert!(texts(&first)[0].starts_with("For security purposes"));

    let (_, second) = post_webhook(
        &app,
        action_call(
            "action_verify_identity",
            json!({"requested_action": "check_balance", "verification_attempts": 0.0}),
            "My account number is 123456789",
            json!([{"entity": "account_number", "value": "123456789"}]),
        ),
    )
    .await;
    assert_matches_contract(&second);
    assert_eq!(slot_value(&second, "identity_verified"), Some(&json!(true)));
    assert_eq!(slot_value(&second, "requested_action"), Some(&Value::Null));
    assert_eq!(
        texts(&second),
        vec!["Identity verified. Your checking account balance is $5,432.10. Is there anything else I can help with?"]
    );
}

#[tokio::test]
async fn repeated_balance_requests_do_not_consume_attempts() {
    let app = build_app(test_config()).await.unwrap();
    let slots = json!({"verification_attempts": 1.0, "requested_action": "check_balance"});
    let (_, a) = post_webhook(
        &app,
        action_call("action_check_balance", slots.clone(), "balance", json!([])),
    )
    .await;
    let (_, b) = post_webhook(
        &app,
        action_call("action_check_balance", slots, "balance again", json!([])),
    )
    .await;
    assert_eq!(texts(&a), texts(&b));
    assert_eq!(slot_value(&b, "verification_attempts"), None);
}

#[tokio::test]
async fn short_credential_is_reprompted_with_counter() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_webhook(
        &app,
        action_call("action_verify_identity", json!({}), "12345", json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_matches_contract(&payload);
    assert_eq!(slot_value(&payload, "verification_attempts"), Some(&json!(1.0)));
    assert!(texts(&payload)[0].contains("6+ digits"));
}

#[tokio::test]
async fn third_rejection_offers_human_handoff() {
    let app = build_app(test_config()).await.unwrap();
    let (_, payload) = post_webhook(
        &app,
        action_call(
            "action_verify_identity",
            json!({"verification_attempts": 2.0, "requested_action": "view_transactions"}),
            "1",
            json!([]),
        ),
    )
    .await;
    assert_matches_contract(&payload);
    assert_eq!(slot_value(&payload, "verification_attempts"), Some(&json!(0.0)));
    assert_eq!(slot_value(&payload, "requested_action"), Some(&Value::Null));
    assert!(texts(&payload)[0].contains("speak with a human agent"));
}

#[tokio::test]
async fn verified_session_sees_transactions_directly() {
    let app = build_app(test_config()).await.unwrap();
    let (_, payload) = post_webhook(
        &app,
        action_call(
            "action_view_transactions",
            json!({"identity_verified": true}),
            "show my transactions",
            json!([]),
        ),
    )
    .await;
    assert!(payload["events"].as_array().unwrap().is_empty());
    let text = &texts(&payload)[0];
    assert_eq!(text.matches("\n20").count(), 5);
    assert!(text.contains("DIRECT DEPOSIT - SALARY +$3,500.00"));
}

#[tokio::test]
async fn lost_card_flow_reports_two_messages() {
    let app = build_app(test_config()).await.unwrap();
    let (_, payload) = post_webhook(
        &app,
        action_call(
            "action_lost_card_flow",
            json!({"card_type": null}),
            "I lost my credit card",
            json!([{"entity": "card_type", "value": "credit card"}]),
        ),
    )
    .await;
    assert_matches_contract(&payload);
    let texts = texts(&payload);
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("your credit card has been lost or stolen"));
}

#[tokio::test]
async fn branch_and_faq_and_fallback_answer_without_slots() {
    let app = build_app(test_config()).await.unwrap();
    let (_, branch) = post_webhook(
        &app,
        action_call(
            "action_branch_locator",
            json!({"branch_location": "downtown"}),
            "Where is the nearest branch?",
            json!([]),
        ),
    )
    .await;
    assert!(texts(&branch)[0].contains("456 Market Street"));

    let (_, faq) = post_webhook(
        &app,
        action_call("action_general_faq", json!({}), "Do you charge fees?", json!([])),
    )
    .await;
    assert!(texts(&faq)[0].starts_with("Our fee schedule"));

    let (_, fallback) = post_webhook(
        &app,
        action_call("action_fallback_handler", json!({}), "sing", json!([])),
    )
    .await;
    assert!(texts(&fallback)[0].contains("Checking account balance"));
}

#[tokio::test]
async fn unknown_action_returns_404() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_webhook(
        &app,
        action_call("action_wire_money", json!({}), "send $5", json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: ActionNotFound = serde_json::from_value(payload).unwrap();
    assert_eq!(body.action_name, "action_wire_money");
    assert!(body.error.contains("action_wire_money"));
}

#[tokio::test]
async fn mistyped_slot_returns_validation_error() {
    let app = build_app(test_config()).await.unwrap();
    let (status, payload) = post_webhook(
        &app,
        action_call(
            "action_check_balance",
            json!({"identity_verified": "yes"}),
            "balance",
            json!([]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "validation_error");
    let schema: Value =
        serde_json::from_str(schema_body("error_response.schema.json").unwrap()).unwrap();
    assert!(jsonschema::validator_for(&schema).unwrap().is_valid(&payload));
}

#[tokio::test]
async fn audit_chain_verification_detects_tampering() {
    let cfg = test_config();
    let audit_path = cfg.audit.jsonl_path.clone();
    let app = build_app(cfg).await.unwrap();

    for text in ["12345", "123456"] {
        let _ = post_webhook(
            &app,
            action_call("action_verify_identity", json!({}), text, json!([])),
        )
        .await;
    }

    assert!(verify_audit_chain(&audit_path).is_ok());

    let mut lines: Vec<String> = std::fs::read_to_string(&audit_path)
        .unwrap()
        .lines()
        .map(|line| line.to_string())
        .collect();
    assert_eq!(lines.len(), 2);
    let first: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["reason_code"], "invalid_credential");
    assert_eq!(first["result"], "deny");
    assert!(!lines.join("\n").contains("123456\""));

    let mut tampered: Value = serde_json::from_str(&lines[1]).unwrap();
    tampered["result"] = Value::String("deny".to_string());
    lines[1] = serde_json::to_string(&tampered).unwrap();
    std::fs::write(&audit_path, format!("{}\n", lines.join("\n"))).unwrap();

    assert!(verify_audit_chain(&audit_path).is_err());
}

#[tokio::test]
async fn audit_chain_verification_with_mirror_succeeds_when_equal() {
    let mut cfg = test_config();
    let mirror_path = cfg.audit.jsonl_path.clone() + ".mirror";
    cfg.audit.immutable_mirror_path = Some(mirror_path.clone());
    let audit_path = cfg.audit.jsonl_path.clone();

    let app = build_app(cfg).await.unwrap();
    let _ = post_webhook(
        &app,
        action_call("action_set_identity_verified", json!({}), "", json!([])),
    )
    .await;

    assert!(verify_audit_chain_with_mirror(&audit_path, Some(&mirror_path)).is_ok());
}

#[tokio::test]
async fn audit_chain_continues_across_restarts_with_sqlite_mirror() {
    let mut cfg = test_config();
    let db_path = cfg.audit.jsonl_path.clone() + ".db";
    cfg.audit.sqlite_path = Some(db_path);
    let audit_path = cfg.audit.jsonl_path.clone();

    let app1 = build_app(cfg.clone()).await.unwrap();
    let _ = post_webhook(
        &app1,
        action_call("action_general_faq", json!({}), "hours?", json!([])),
    )
    .await;
    drop(app1);

    let app2 = build_app(cfg).await.unwrap();
    let _ = post_webhook(
        &app2,
        action_call("action_general_faq", json!({}), "fees?", json!([])),
    )
    .await;

    let summary = verify_audit_chain(&audit_path).unwrap();
    assert_eq!(summary, "audit chain verified: 2 records");
}
