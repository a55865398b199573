//! igorctl - order-creator / debug CLI client for igord (spec.md Section
//! 2: "Order creator — any short-lived client that opens a connection,
//! sends one `OrderCreate`, and disconnects.").

mod client;

use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use client::{as_error, Client, ClientError};
use igor_core::{NewOrder, Order};
use tracing_subscriber::{fmt, EnvFilter};

/// CLI client for the igord coordination server.
#[derive(Parser)]
#[command(name = "igorctl")]
#[command(about = "Create build orders and observe igord's event stream")]
#[command(version)]
struct Cli {
    /// igord hostname.
    #[arg(long, global = true, default_value = "127.0.0.1", env = "IGORCTL_HOST")]
    host: String,

    /// igord TCP port.
    #[arg(long, global = true, default_value_t = igor_core::DEFAULT_PORT, env = "IGORCTL_PORT")]
    port: u16,

    /// Log level (falls back to WARN on an unrecognised value).
    #[arg(long, global = true, env = "IGORCTL_LOGGING")]
    logging: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a build order and disconnect.
    Create {
        /// Human description of the order.
        #[arg(long, default_value = "")]
        desc: String,

        /// URI of the repository holding the build spec.
        #[arg(long)]
        spec_uri: String,

        /// Ref within the spec repository naming the spec commit.
        #[arg(long)]
        spec_ref: String,

        /// URI of the repository to check out and build.
        #[arg(long)]
        source_uri: String,

        /// Implementation-specific source arguments (for git: a tree-ish).
        #[arg(long = "source-arg")]
        source_args: Vec<String>,

        /// Extra environment bindings as KEY=VALUE, may be repeated.
        #[arg(long = "env")]
        env: Vec<String>,
    },

    /// Subscribe to the server's event stream and print events as they arrive.
    Watch {
        /// Event names to filter on; empty means all events.
        #[arg(long = "event")]
        events: Vec<String>,
    },

    /// Register one unit of demand and print orders as they are assigned.
    Assign,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli
        .logging
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Command::Create {
            desc,
            spec_uri,
            spec_ref,
            source_uri,
            source_args,
            env,
        } => create_order(&cli.host, cli.port, desc, spec_uri, spec_ref, source_uri, source_args, env).await,
        Command::Watch { events } => watch(&cli.host, cli.port, events).await,
        Command::Assign => assign(&cli.host, cli.port).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn parse_env_bindings(raw: &[String]) -> Result<BTreeMap<String, String>, ClientError> {
    let mut env = BTreeMap::new();
    for binding in raw {
        let (key, value) = binding.split_once('=').ok_or_else(|| ClientError::Rejected {
            kind: "ClientError".to_string(),
            message: format!("invalid --env binding {binding:?}, expected KEY=VALUE"),
        })?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[allow(clippy::too_many_arguments)]
async fn create_order(
    host: &str,
    port: u16,
    desc: String,
    spec_uri: String,
    spec_ref: String,
    source_uri: String,
    source_args: Vec<String>,
    env: Vec<String>,
) -> Result<(), ClientError> {
    let order = Order::new(NewOrder {
        id: None,
        desc,
        spec_uri,
        spec_ref,
        source_uri,
        source_args,
        env: parse_env_bindings(&env)?,
    });

    let mut client = Client::connect(host, port).await?;
    client
        .send("OrderCreate", serde_json::json!({"order": order.to_obj()}))
        .await?;

    // A short window for an immediate ParamError; the order creator
    // otherwise disconnects without waiting for a reply (spec.md
    // Section 2).
    if let Some(frame) = client.try_read_frame(Duration::from_millis(200)).await {
        if let Some(err) = as_error(&frame) {
            return Err(err);
        }
    }

    println!("order created: {}", order.id);
    Ok(())
}

async fn watch(host: &str, port: u16, events: Vec<String>) -> Result<(), ClientError> {
    let mut client = Client::connect(host, port).await?;
    client
        .send("Subscribe", serde_json::json!({"events": events}))
        .await?;

    loop {
        let frame = client.read_frame().await?;
        if let Some(err) = as_error(&frame) {
            eprintln!("error: {err}");
            continue;
        }
        println!("{frame}");
    }
}

async fn assign(host: &str, port: u16) -> Result<(), ClientError> {
    let mut client = Client::connect(host, port).await?;
    client.send("OrderAssign", serde_json::json!({})).await?;

    loop {
        let frame = client.read_frame().await?;
        if let Some(err) = as_error(&frame) {
            eprintln!("error: {err}");
            continue;
        }
        if let Some(order) = frame.get("order") {
            match Order::from_obj(order.clone()) {
                Ok(order) => println!("assigned order {}: {}", order.id, order.desc),
                Err(e) => eprintln!("malformed order pushed from server: {e}"),
            }
            continue;
        }
        println!("{frame}");
    }
}
