use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::info;

use crguard::config::Config;
use crguard::crypto::{CryptoCore, EncryptedPayload, MaskCategory};
use crguard::http::{admin_router, guard, ClientId, GuardState};
use crguard::models::{RequestView, SecurityStats};
use crguard::monitor::{Decision, SecurityMonitor};
use crguard::sweeper::Sweeper;

#[derive(Parser)]
#[command(name = "crguard")]
#[command(author, version, about = "Request-level API guard and crypto toolkit")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate a synthetic request against the security pipeline
    Check {
        /// Request path, optionally with a query string
        path: String,

        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// JSON (or plain text) request body
        #[arg(short, long)]
        body: Option<String>,

        /// User-Agent header
        #[arg(short = 'a', long)]
        user_agent: Option<String>,

        /// Client identifier
        #[arg(long, default_value = "127.0.0.1")]
        client: String,

        /// Send the same request this many times
        #[arg(short, long, default_value = "1")]
        repeat: u32,
    },

    /// Hash a password (PBKDF2-SHA256)
    HashPassword { password: String },

    /// Verify a password against a stored hash
    VerifyPassword { password: String, hash: String },

    /// Generate a 256-bit random token
    Token,

    /// Generate a session identifier
    SessionId,

    /// HMAC-SHA256 signature of the given data
    Sign { data: String },

    /// Verify an HMAC-SHA256 signature
    Verify { data: String, signature: String },

    /// Mask personal data (phone, email, idcard, name)
    Mask { category: MaskCategory, value: String },

    /// Encrypt text, printing the JSON payload
    Encrypt { plaintext: String },

    /// Decrypt a JSON payload produced by `encrypt`
    Decrypt { payload: String },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a demo API behind the guard
    Serve {
        /// Override the listen address from the config
        #[arg(short, long)]
        listen: Option<String>,
    },
}

/// Table row for the attacker ranking
#[derive(Tabled)]
struct AttackerRow {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Identifier")]
    identifier: String,
    #[tabled(rename = "Attacks")]
    attacks: u64,
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Check {
            path,
            method,
            body,
            user_agent,
            client,
            repeat,
        } => cmd_check(config, path, method, body, user_agent, client, repeat),
        Commands::HashPassword { password } => {
            println!("{}", crypto(&config)?.hash_password(&password)?);
            Ok(())
        }
        Commands::VerifyPassword { password, hash } => {
            print_verdict(
                crypto(&config)?.verify_password(&password, &hash),
                "Password matches",
                "Password does not match",
            );
            Ok(())
        }
        Commands::Token => {
            println!("{}", crypto(&config)?.generate_secure_token());
            Ok(())
        }
        Commands::SessionId => {
            println!("{}", crypto(&config)?.generate_session_id());
            Ok(())
        }
        Commands::Sign { data } => {
            println!("{}", crypto(&config)?.create_signature(data.as_bytes())?);
            Ok(())
        }
        Commands::Verify { data, signature } => {
            print_verdict(
                crypto(&config)?.verify_signature(data.as_bytes(), &signature),
                "Signature valid",
                "Signature invalid",
            );
            Ok(())
        }
        Commands::Mask { category, value } => {
            println!("{}", crypto(&config)?.mask_sensitive_data(&value, category));
            Ok(())
        }
        Commands::Encrypt { plaintext } => {
            let payload = crypto(&config)?.encrypt_str(&plaintext)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Commands::Decrypt { payload } => {
            let payload: EncryptedPayload =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            println!("{}", crypto(&config)?.decrypt_str(&payload)?);
            Ok(())
        }
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Serve { listen } => cmd_serve(config, listen).await,
    }
}

fn crypto(config: &Config) -> Result<CryptoCore> {
    CryptoCore::from_config(&config.crypto).context("Failed to initialize crypto core")
}

fn print_verdict(ok: bool, pass: &str, fail: &str) {
    if ok {
        println!("{} {}", "OK:".green().bold(), pass);
    } else {
        println!("{} {}", "FAIL:".red().bold(), fail);
        std::process::exit(2);
    }
}

fn cmd_check(
    config: Config,
    target: String,
    method: String,
    body: Option<String>,
    user_agent: Option<String>,
    client: String,
    repeat: u32,
) -> Result<()> {
    let monitor = SecurityMonitor::new(&config);

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target, String::new()),
    };
    let mut request = RequestView::new(client, method, path).with_query(query);
    if let Some(ua) = user_agent {
        request = request.with_header("user-agent", ua);
    }
    if let Some(body) = body {
        let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
        request = request.with_body(value);
    }

    println!(
        "{} {} {} (tier {})",
        "Checking".bold(),
        request.method,
        request.url(),
        monitor.classify_tier(&request.path)
    );

    for n in 1..=repeat.max(1) {
        let decision = monitor.check(&request);
        println!("  #{:<4} {}", n, describe(&decision));
    }

    print_stats(&monitor.get_stats());
    Ok(())
}

fn describe(decision: &Decision) -> String {
    match decision {
        Decision::Allowed { tier, remaining } => {
            format!("{} tier={} remaining={}", "ALLOWED".green(), tier, remaining)
        }
        Decision::Blocked { remaining_ms } => {
            format!("{} for another {}s", "BLOCKED".red(), remaining_ms / 1000)
        }
        Decision::Detected {
            event_type,
            event_id,
            block_ms,
        } => format!(
            "{} {} (event {}), blocked {}s",
            "DETECTED".red().bold(),
            event_type,
            event_id,
            block_ms / 1000
        ),
        Decision::RateLimited {
            tier,
            retry_after_ms,
            limit,
        } => format!(
            "{} tier={} limit={} retry in {}ms",
            "RATE LIMITED".yellow(),
            tier,
            limit,
            retry_after_ms
        ),
    }
}

fn print_stats(stats: &SecurityStats) {
    println!();
    println!("{}", "=== Security Statistics ===".bold());
    println!("Total attacks:          {}", stats.total_attacks);
    println!(
        "Blocked identifiers:    {}",
        stats.blocked_identifier_count.to_string().yellow()
    );
    println!("Suspicious identifiers: {}", stats.suspicious_identifier_count);

    if !stats.top_attackers.is_empty() {
        let rows: Vec<AttackerRow> = stats
            .top_attackers
            .iter()
            .enumerate()
            .map(|(i, a)| AttackerRow {
                rank: i + 1,
                identifier: a.identifier.clone(),
                attacks: a.attack_count,
            })
            .collect();
        println!("\n{}", Table::new(rows));
    }
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

async fn cmd_serve(config: Config, listen: Option<String>) -> Result<()> {
    let addr: SocketAddr = listen
        .as_deref()
        .unwrap_or(&config.general.listen_addr)
        .parse()
        .context("Invalid listen address")?;

    let monitor = Arc::new(SecurityMonitor::new(&config));
    let state = GuardState::new(monitor.clone(), &config.general);
    let mut sweeper = Sweeper::start(
        monitor.clone(),
        Duration::from_secs(config.blocking.sweep_interval_secs.max(1)),
    );

    let app = Router::new()
        .route("/api/items", get(list_items))
        .route("/api/auth/login", post(login))
        .route("/api/echo", post(echo))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .nest("/admin", admin_router(state))
        .route("/health", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    println!("{} on http://{}", "crguard demo listening".green().bold(), addr);
    info!(%addr, "Serving demo API");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nShutting down...");
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    sweeper.stop().await;
    print_stats(&monitor.get_stats());
    Ok(())
}

async fn list_items(Extension(ClientId(client)): Extension<ClientId>) -> Json<Value> {
    Json(json!({"success": true, "client": client, "items": ["alpha", "beta"]}))
}

async fn login(Json(body): Json<Value>) -> Json<Value> {
    let user = body.get("username").and_then(Value::as_str).unwrap_or("");
    Json(json!({"success": false, "message": format!("Invalid credentials for {}", user)}))
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({"success": true, "received": body}))
}
