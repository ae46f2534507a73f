//! Manual smoke run against a live chatbot REST channel.

use std::time::Duration;

use reqwest::Client;
use teller_contracts::{RestMessage, RestReply};

/// The canned conversation, in order: (title, user message).
pub const SMOKE_SCRIPT: &[(&str, &str)] = &[
    ("Greeting", "Hello"),
    ("Branch Locator", "Where is the nearest branch?"),
    ("Lost Card Report", "I lost my credit card"),
    ("Balance Check (without verification)", "What's my balance?"),
    ("Balance Check (with verification)", "My account number is 123456789"),
    (
        "Human Handoff Request",
        "This isn't helping, I need to talk to someone",
    ),
    ("Goodbye", "Bye"),
];

#[derive(Debug, Clone)]
pub struct SmokeTurn {
    pub title: &'static str,
    pub message: &'static str,
    pub replies: Result<Vec<String>, String>,
}

pub async fn send_message(
    client: &Client,
    url: &str,
    sender: &str,
    message: &str,
) -> Result<Vec<RestReply>, String> {
    let body = RestMessage {
        sender: sender.to_string(),
        message: message.to_string(),
    };
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("error connecting to chatbot server: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("chatbot server returned {}", response.status()));
    }
    response
        .json::<Vec<RestReply>>()
        .await
        .map_err(|e| format!("unreadable chatbot reply: {e}"))
}

/// Plays every turn of [`SMOKE_SCRIPT`] as one sender. A failed turn does not stop the run.
pub async fn run_smoke(url: &str, sender: &str) -> Result<Vec<SmokeTurn>, String> {
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| e.to_string())?;

    let mut turns = Vec::with_capacity(SMOKE_SCRIPT.len());
    for &(title, message) in SMOKE_SCRIPT {
        let replies = send_message(&client, url, sender, message)
            .await
            .map(|replies| replies.into_iter().filter_map(|r| r.text).collect());
        if let Err(e) = &replies {
            tracing::warn!(turn = title, error = %e, "smoke turn failed");
        }
        turns.push(SmokeTurn {
            title,
            message,
            replies,
        });
    }
    Ok(turns)
}

pub fn print_report(turns: &[SmokeTurn]) {
    let rule = "=".repeat(60);
    let thin = "-".repeat(60);
    println!("{rule}");
    println!("Bank Customer Service Chatbot - Test Conversation");
    println!("{rule}");
    println!();
    for (idx, turn) in turns.iter().enumerate() {
        println!("Test {}: {}", idx + 1, turn.title);
        println!("{thin}");
        println!("You: {}", turn.message);
        match &turn.replies {
            Ok(replies) => {
                for text in replies {
                    println!("Bot: {text}");
                }
            }
            Err(e) => println!("Error: {e}"),
        }
        println!();
    }
    println!("{rule}");
    println!("Test conversation complete!");
    println!("{rule}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn spawn_echo_channel() -> String {
        let app = Router::new().route(
            "/webhooks/rest/webhook",
            post(|Json(body): Json<RestMessage>| async move {
                Json(json!([
                    {"recipient_id": body.sender, "text": format!("echo: {}", body.message)},
                    {"recipient_id": body.sender, "image": "https://example.invalid/x.png"}
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/webhooks/rest/webhook")
    }

    #[tokio::test]
    async fn smoke_run_collects_text_replies_per_turn() {
        let url = spawn_echo_channel().await;
        let turns = run_smoke(&url, "smoke_user").await.unwrap();
        assert_eq!(turns.len(), SMOKE_SCRIPT.len());
        let balance = &turns[4];
        assert_eq!(
            balance.replies.as_ref().unwrap(),
            &vec!["echo: My account number is 123456789".to_string()]
        );
    }

    #[tokio::test]
    async fn unreachable_channel_is_reported_per_turn() {
        let turns = run_smoke("http://127.0.0.1:9/webhooks/rest/webhook", "smoke_user")
            .await
            .unwrap();
        assert!(turns.iter().all(|t| t.replies.is_err()));
    }

    #[test]
    fn rest_message_matches_published_schema() {
        let schema: Value =
            serde_json::from_str(teller_contracts::schema_body("rest_message.schema.json").unwrap())
                .unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let body = serde_json::to_value(RestMessage {
            sender: "test_user".to_string(),
            message: "Hello".to_string(),
        })
        .unwrap();
        assert!(validator.is_valid(&body));
    }
}
