use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tachyon", about = "Tachyon: self-destructing notes", version)]
struct Cli {
    /// Tachyon server URL (default: http://localhost:1323 or $TACHYON_SERVER)
    #[arg(long, env = "TACHYON_SERVER", default_value = "http://localhost:1323")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Tachyon HTTP server
    Serve {
        /// Port to listen on (default: $TACHYON_PORT, $PORT or 1323)
        #[arg(long)]
        port: Option<u16>,
        /// Host to bind (default: $TACHYON_HOST or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,
    },
    /// Create a note and print its sign
    Create {
        /// Display name of the note
        name: String,
        /// Note body; use `-` to read it from stdin
        text: String,
        /// Reads before the note self-destructs (0 = unlimited)
        #[arg(long, default_value = "1")]
        max_visits: u32,
        /// Encrypt the body with this password
        #[arg(long)]
        password: Option<String>,
    },
    /// Read a note by its sign
    Read {
        sign: String,
        /// Password for an encrypted note
        #[arg(long)]
        password: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TACHYON_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create {
            name,
            text,
            max_visits,
            password,
        } => cmd_create(&cli.server, &name, &text, max_visits, password.as_deref()).await,

        Commands::Read { sign, password } => {
            cmd_read(&cli.server, &sign, password.as_deref()).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    tachyon_server::run(serve_config(host, port)).await
}

/// Flags override the environment-derived config only when given.
fn serve_config(host: Option<String>, port: Option<u16>) -> tachyon_server::ServerConfig {
    let mut cfg = tachyon_server::ServerConfig::default();
    if let Some(host) = host {
        cfg.host = host;
    }
    if let Some(port) = port {
        cfg.port = port;
    }
    cfg
}

async fn cmd_create(
    server: &str,
    name: &str,
    text: &str,
    max_visits: u32,
    password: Option<&str>,
) -> Result<()> {
    let text = if text == "-" {
        std::io::read_to_string(std::io::stdin()).context("read note text from stdin")?
    } else {
        text.to_owned()
    };

    let body = serde_json::json!({
        "name": name,
        "text": text,
        "max_number_visits": max_visits,
        "is_encrypted": password.is_some(),
        "encrypt_password": password,
    });

    let resp = Client::new()
        .post(format!("{}/api/note/", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let json = parse_body(resp).await?;
    let sign = json["sign"]
        .as_str()
        .context("server response carries no sign")?;
    println!("{sign}");
    Ok(())
}

async fn cmd_read(server: &str, sign: &str, password: Option<&str>) -> Result<()> {
    let mut req = Client::new().get(format!(
        "{}/api/note/{}/",
        server.trim_end_matches('/'),
        sign
    ));
    if let Some(p) = password {
        req = req.query(&[("password", p)]);
    }

    let resp = req.send().await.context("HTTP request failed")?;
    let json = parse_body(resp).await?;

    let name = json["name"].as_str().unwrap_or("");
    let message = json["message"].as_str().unwrap_or("");
    if !name.is_empty() {
        eprintln!("── {name} ──");
    }
    println!("{message}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Decode a JSON body, turning non-2xx replies into the server's error text.
async fn parse_body(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();

    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }
    Ok(json)
}
