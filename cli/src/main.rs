use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use courier::{ClientConfig, ConnectionState, Courier, Envelope, RequestOptions, TopicPayload};
use envelopes::WILDCARD_TOPIC;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("not signed in; run `courier-cli login` first")]
    NotSignedIn,
    #[error("invalid configuration: {0}")]
    Config(#[from] courier::ConfigError),
    #[error(transparent)]
    Courier(#[from] courier::CourierError),
    #[error(transparent)]
    Gateway(#[from] courier::GatewayError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid HTTP method `{0}`")]
    InvalidMethod(String),
    #[error("server returned {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("realtime connection failed after all reconnect attempts")]
    ReconnectExhausted,
    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "courier-cli", about = "Courier realtime client CLI")]
struct Cli {
    #[arg(long, env = "COURIER_API_BASE_URL")]
    api_base_url: Option<String>,

    #[arg(long, env = "COURIER_WS_BASE_URL")]
    ws_base_url: Option<String>,

    #[arg(long, env = "COURIER_CREDENTIALS_PATH", default_value = ".courier/credentials.json")]
    credentials: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with a JSON body and store the returned tokens.
    Login {
        #[arg(long)]
        body: String,
    },
    Logout,
    /// Show the stored credential's expiry and user.
    Whoami,
    /// Authenticated HTTP request through the gateway.
    Request {
        method: String,
        path: String,
        #[arg(long)]
        data: Option<String>,
    },
    /// Connect, optionally join a room, and print envelopes.
    Watch {
        #[arg(long)]
        room: Option<String>,
        #[arg(long = "topic")]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let courier = Courier::from_config(config)?;

    match cli.command {
        Command::Login { body } => run_login(&courier, &body).await,
        Command::Logout => {
            courier.logout();
            println!("logged out");
            Ok(())
        }
        Command::Whoami => run_whoami(&courier),
        Command::Request { method, path, data } => run_request(&courier, &method, &path, data.as_deref()).await,
        Command::Watch { room, topics } => run_watch(&courier, room.as_deref(), &topics).await,
    }
}

/// CLI flags win over the environment; everything else comes from env.
fn load_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let api_base_url = cli.api_base_url.clone();
    let ws_base_url = cli.ws_base_url.clone();
    let credentials = cli.credentials.to_string_lossy().into_owned();
    let config = ClientConfig::from_lookup(|key| match key {
        "COURIER_API_BASE_URL" if api_base_url.is_some() => api_base_url.clone(),
        "COURIER_WS_BASE_URL" if ws_base_url.is_some() => ws_base_url.clone(),
        "COURIER_CREDENTIALS_PATH" => Some(credentials.clone()),
        _ => match std::env::var(key) {
            Ok(value) => Some(value),
            Err(_) => None,
        },
    })?;
    Ok(config)
}

async fn run_login(courier: &Courier, body: &str) -> Result<(), CliError> {
    let body = serde_json::from_str::<Value>(body)?;
    let credential = courier.login(body).await?;
    print_json(&serde_json::json!({
        "expires_at": credential.expires_at,
        "user": credential.user,
    }))
}

fn run_whoami(courier: &Courier) -> Result<(), CliError> {
    let credential = courier.store().get().ok_or(CliError::NotSignedIn)?;
    print_json(&serde_json::json!({
        "expires_at": credential.expires_at,
        "expired": credential.is_expired(0),
        "user": credential.user,
    }))
}

async fn run_request(courier: &Courier, method: &str, path: &str, data: Option<&str>) -> Result<(), CliError> {
    let method = parse_method(method)?;
    let body = data.map(serde_json::from_str::<Value>).transpose()?;
    let response = courier
        .gateway()
        .request(path, &RequestOptions::with_method(method, body))
        .await?;

    let status = response.status();
    let text = response.text().await.map_err(courier::GatewayError::from)?;
    if !status.is_success() {
        return Err(CliError::ServerError {
            status: status.as_u16(),
            body: text,
        });
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => print_json(&json),
        Err(_) => {
            println!("{text}");
            Ok(())
        }
    }
}

async fn run_watch(courier: &Courier, room: Option<&str>, topics: &[String]) -> Result<(), CliError> {
    let (envelope_tx, mut envelopes) = mpsc::unbounded_channel::<Envelope>();
    let subscribed = if topics.is_empty() {
        vec![WILDCARD_TOPIC.to_owned()]
    } else {
        topics.to_vec()
    };
    for topic in subscribed {
        let tx = envelope_tx.clone();
        courier.dispatcher().subscribe_fn(topic, move |envelope: &Envelope| {
            if tx.send(envelope.clone()).is_err() {
                tracing::debug!("watch output closed");
            }
        });
    }

    let (state_tx, mut states) = mpsc::unbounded_channel::<ConnectionState>();
    courier.connection().on_state_change(Arc::new(move |state: ConnectionState| {
        if state_tx.send(state).is_err() {
            tracing::debug!("watch state output closed");
        }
    }));

    let state = courier.start().await?;
    eprintln!("connection: {state}");
    if let Some(room) = room {
        let outcome = courier.join_room(room)?;
        eprintln!("join {room}: {outcome:?}");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            Some(envelope) = envelopes.recv() => println!("{}", render(&envelope)),
            Some(state) = states.recv() => {
                eprintln!("connection: {state}");
                if state == ConnectionState::Failed {
                    courier.stop();
                    return Err(CliError::ReconnectExhausted);
                }
            }
            signal = &mut ctrl_c => {
                signal?;
                courier.stop();
                return Ok(());
            }
        }
    }
}

fn parse_method(raw: &str) -> Result<reqwest::Method, CliError> {
    reqwest::Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(|_| CliError::InvalidMethod(raw.to_owned()))
}

/// One human-readable line per envelope; raw JSON when the payload does not
/// match its topic schema.
fn render(envelope: &Envelope) -> String {
    let thread = envelope.thread_id().unwrap_or("-");
    match TopicPayload::decode(envelope) {
        Ok(TopicPayload::Message(message)) => format!("[{thread}] {}: {}", message.role, message.text),
        Ok(TopicPayload::Status(status)) => match status.detail {
            Some(detail) => format!("[{thread}] status {} ({detail})", status.status),
            None => format!("[{thread}] status {}", status.status),
        },
        Ok(TopicPayload::Typing(typing)) => {
            format!("[{thread}] typing {}", if typing.is_typing { "on" } else { "off" })
        }
        Ok(TopicPayload::Error(error)) => format!("[{thread}] error: {}", error.message),
        Ok(TopicPayload::Join { .. }) => format!("[{thread}] join"),
        Ok(TopicPayload::Unknown(content)) => format!("[{thread}] {} {content}", envelope.topic()),
        Err(_) => envelopes::encode_line(envelope).trim_end().to_owned(),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
