use std::env;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage:
  teller serve --config <path>
  teller smoke [--config <path>] [--url <webhook>] [--sender <id>]
  teller verify-audit --path <jsonl> [--mirror <jsonl>]";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teller=info,teller_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    let flags = parse_flags(args);

    let code = match cmd.as_str() {
        "serve" => serve(&flags).await,
        "smoke" => smoke(&flags).await,
        "verify-audit" => verify_audit(&flags),
        _ => {
            eprintln!("{USAGE}");
            2
        }
    };
    std::process::exit(code);
}

fn parse_flags(mut args: impl Iterator<Item = String>) -> Vec<(String, String)> {
    let mut flags = Vec::new();
    while let Some(arg) = args.next() {
        if let Some(name) = arg.strip_prefix("--") {
            if let Some(v) = args.next() {
                flags.push((name.to_string(), v));
            }
        }
    }
    flags
}

fn flag<'a>(flags: &'a [(String, String)], name: &str) -> Option<&'a str> {
    flags
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

async fn serve(flags: &[(String, String)]) -> i32 {
    let config_path = flag(flags, "config").unwrap_or("./config/example-config.yaml");
    let cfg = match teller_config::load_and_validate(config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return 1;
        }
    };

    if let Err(e) = teller_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        return 1;
    }
    0
}

async fn smoke(flags: &[(String, String)]) -> i32 {
    let defaults = match flag(flags, "config") {
        Some(path) => match teller_config::load_and_validate(path) {
            Ok(cfg) => cfg.smoke,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                return 1;
            }
        },
        None => teller_config::Smoke::default(),
    };
    let url = flag(flags, "url").unwrap_or(&defaults.webhook_url);
    let sender = flag(flags, "sender").unwrap_or(&defaults.sender);

    match teller_server::smoke::run_smoke(url, sender).await {
        Ok(turns) => {
            teller_server::smoke::print_report(&turns);
            if turns.iter().any(|t| t.replies.is_err()) {
                eprintln!("Make sure the chatbot server is running at {url}");
            }
            0
        }
        Err(e) => {
            eprintln!("smoke run failed: {e}");
            1
        }
    }
}

fn verify_audit(flags: &[(String, String)]) -> i32 {
    let Some(path) = flag(flags, "path") else {
        eprintln!("{USAGE}");
        return 2;
    };
    match teller_server::verify_audit_chain_with_mirror(path, flag(flags, "mirror")) {
        Ok(summary) => {
            println!("{summary}");
            0
        }
        Err(e) => {
            eprintln!("audit verification failed: {e}");
            1
        }
    }
}
