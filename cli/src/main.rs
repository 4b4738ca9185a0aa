mod config;
mod error;
mod http_client;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use config::{default_config_path, resolve_token, Config};
use http_client::{segment, Client};

#[derive(Parser, Debug)]
#[command(name = "netmeshctl")]
#[command(about = "Operate a Netmesh control plane", long_about = None)]
struct Cli {
    /// Control plane URL (falls back to the stored config)
    #[arg(long, env = "NETMESH_URL")]
    base_url: Option<String>,

    /// Bearer token to send instead of the stored login
    #[arg(long, env = "NETMESH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "NETMESH_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Retries for GET/DELETE on server errors
    #[arg(long, default_value_t = 2)]
    retries: u32,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in as a user and store the issued token
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "NETMESH_PASSWORD", hide_env_values = true)]
        password: String,
    },
    #[command(subcommand)]
    Nodes(NodesCommand),
    #[command(subcommand)]
    Relay(RelayCommand),
    #[command(subcommand)]
    Egress(EgressCommand),
    #[command(subcommand)]
    Ingress(IngressCommand),
    /// Show a network's last-modified timestamp
    LastModified { network: String },
}

#[derive(Args, Debug, Clone)]
struct NodeRef {
    network: String,
    node_id: String,
}

#[derive(Subcommand, Debug)]
enum NodesCommand {
    List {
        #[arg(long)]
        network: Option<String>,
    },
    Get(NodeRef),
    Approve(NodeRef),
    Delete(NodeRef),
}

#[derive(Subcommand, Debug)]
enum RelayCommand {
    Create {
        #[command(flatten)]
        node: NodeRef,
        /// Node IDs to relay
        #[arg(long = "member", required = true)]
        members: Vec<String>,
    },
    Delete(NodeRef),
}

#[derive(Subcommand, Debug)]
enum EgressCommand {
    Create {
        #[command(flatten)]
        node: NodeRef,
        /// CIDR ranges reachable through the gateway
        #[arg(long = "range", required = true)]
        ranges: Vec<String>,
        #[arg(long)]
        interface: Option<String>,
    },
    Delete(NodeRef),
}

#[derive(Subcommand, Debug)]
enum IngressCommand {
    Create(NodeRef),
    Delete(NodeRef),
}

fn node_path(node: &NodeRef) -> String {
    format!("api/nodes/{}/{}", segment(&node.network), segment(&node.node_id))
}

/// Map a non-login command onto its HTTP call.
fn request_for(command: &Command) -> Option<(Method, String, Option<Value>)> {
    let call = match command {
        Command::Login { .. } => return None,
        Command::Nodes(cmd) => match cmd {
            NodesCommand::List { network: None } => (Method::GET, "api/nodes".to_string(), None),
            NodesCommand::List {
                network: Some(network),
            } => (Method::GET, format!("api/nodes/{}", segment(network)), None),
            NodesCommand::Get(node) => (Method::GET, node_path(node), None),
            NodesCommand::Approve(node) => {
                (Method::POST, format!("{}/approve", node_path(node)), None)
            }
            NodesCommand::Delete(node) => (Method::DELETE, node_path(node), None),
        },
        Command::Relay(cmd) => match cmd {
            RelayCommand::Create { node, members } => (
                Method::POST,
                format!("{}/createrelay", node_path(node)),
                Some(json!({ "relayed_nodes": members })),
            ),
            RelayCommand::Delete(node) => {
                (Method::DELETE, format!("{}/deleterelay", node_path(node)), None)
            }
        },
        Command::Egress(cmd) => match cmd {
            EgressCommand::Create {
                node,
                ranges,
                interface,
            } => (
                Method::POST,
                format!("{}/creategateway", node_path(node)),
                Some(json!({ "ranges": ranges, "interface": interface })),
            ),
            EgressCommand::Delete(node) => {
                (Method::DELETE, format!("{}/deletegateway", node_path(node)), None)
            }
        },
        Command::Ingress(cmd) => match cmd {
            IngressCommand::Create(node) => {
                (Method::POST, format!("{}/createingress", node_path(node)), None)
            }
            IngressCommand::Delete(node) => {
                (Method::DELETE, format!("{}/deleteingress", node_path(node)), None)
            }
        },
        Command::LastModified { network } => (
            Method::GET,
            format!("api/nodes/adm/{}/lastmodified", segment(network)),
            None,
        ),
    };
    Some(call)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut cfg = Config::load(&config_path)?;

    let base_url = cli
        .base_url
        .clone()
        .or_else(|| cfg.base_url.clone())
        .context("No control plane URL; pass --base-url or set NETMESH_URL")?;
    let timeout = Duration::from_secs(cli.timeout_secs);

    if let Command::Login { username, password } = &cli.command {
        let client = Client::new(&base_url, None, timeout, cli.retries)?;
        let login = client
            .send_for_payload(
                Method::POST,
                "api/users/adm/authenticate",
                Some(json!({ "username": username, "password": password })),
            )
            .await?;
        let token = login
            .get("auth_token")
            .and_then(Value::as_str)
            .context("Login reply carried no auth_token")?;

        cfg.base_url = Some(base_url);
        cfg.token = Some(token.to_string());
        cfg.save(&config_path)?;
        println!("Logged in as {} (config: {:?})", username, config_path);
        return Ok(());
    }

    let token = resolve_token(cli.token.clone(), cli.master_key.clone(), &cfg);
    if token.is_none() {
        debug!("No credential available, sending unauthenticated request");
    }
    let client = Client::new(&base_url, token, timeout, cli.retries)?;

    let (method, path, body) =
        request_for(&cli.command).context("Command does not map to an API call")?;
    client.send_json(method, &path, body).await
}
