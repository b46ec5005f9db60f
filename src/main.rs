use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use reconciler::api_key::ApiKeySpec;
use reconciler::config::Config;
use reconciler::import_id::{ApiKeyImport, SubuserImport};
use reconciler::secret::{self, write_secret, DEFAULT_SECRET_LENGTH};
use reconciler::subuser::{PasswordSpec, SubuserSpec, SubuserUpdate, DEFAULT_DOMAIN_ID};
use reconciler::Client;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "reconciler",
    version,
    about = "Manage subusers and API keys on an eventually consistent account API"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); falls back to LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random secret
    Secret {
        #[arg(long, default_value_t = DEFAULT_SECRET_LENGTH)]
        length: usize,
        /// Write the secret here instead of printing it
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Manage API keys
    #[command(subcommand)]
    ApiKey(ApiKeyCommand),
    /// Manage subusers
    #[command(subcommand)]
    Subuser(SubuserCommand),
    /// Decode composite import identifiers
    #[command(subcommand)]
    Import(ImportCommand),
}

#[derive(Args)]
struct ApiKeyArgs {
    #[arg(long)]
    name: String,
    /// Scope granted to the key (repeatable)
    #[arg(long = "scope", required = true)]
    scopes: Vec<String>,
    /// Subuser the key belongs to
    #[arg(long)]
    on_behalf_of: Option<String>,
}

#[derive(Subcommand)]
enum ApiKeyCommand {
    Create {
        #[command(flatten)]
        key: ApiKeyArgs,
        /// File the generated key is written to
        #[arg(long)]
        destination: PathBuf,
    },
    Show {
        id: String,
        #[arg(long)]
        on_behalf_of: Option<String>,
    },
    Update {
        id: String,
        #[command(flatten)]
        key: ApiKeyArgs,
    },
    Delete {
        id: String,
        #[arg(long)]
        on_behalf_of: Option<String>,
    },
}

#[derive(Subcommand)]
enum SubuserCommand {
    Create {
        username: String,
        #[arg(long)]
        email: String,
        /// IP assigned to the subuser (repeatable)
        #[arg(long = "ip", required = true)]
        ips: Vec<String>,
        #[arg(long)]
        disabled: bool,
        /// Authenticated domain id, 0 for none
        #[arg(long, default_value = DEFAULT_DOMAIN_ID)]
        domain: String,
        /// File the generated password is written to
        #[arg(long)]
        password_file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SECRET_LENGTH)]
        password_length: usize,
    },
    Show {
        username: String,
    },
    Update {
        username: String,
        #[arg(long)]
        disabled: Option<bool>,
        /// Replacement IP list (repeatable)
        #[arg(long = "ip")]
        ips: Vec<String>,
        #[arg(long)]
        domain: Option<String>,
    },
    Delete {
        username: String,
    },
}

#[derive(Subcommand)]
enum ImportCommand {
    /// id:api_key_destination:on_behalf_of
    ParseApiKey { id: String },
    /// username:password_destination:password_length
    ParseSubuser { id: String },
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("reconciler={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn client() -> Result<Client> {
    let config = Config::from_env()
        .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;
    tracing::debug!(base_url = %config.base_url, "configuration loaded");

    Client::from_config(&config).context("Failed to create client")
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn api_key(command: ApiKeyCommand) -> Result<()> {
    let client = client()?;

    match command {
        ApiKeyCommand::Create { key, destination } => {
            let spec = ApiKeySpec {
                name: key.name,
                scopes: key.scopes,
                on_behalf_of: key.on_behalf_of,
                destination,
            };
            print(&client.create_api_key(&spec).await?)
        }
        ApiKeyCommand::Show { id, on_behalf_of } => {
            let key = client
                .get_api_key(&id, on_behalf_of.as_deref())
                .await?
                .ok_or_else(|| anyhow!("API key {} not found", id))?;
            print(&key)
        }
        ApiKeyCommand::Update { id, key } => {
            let spec = ApiKeySpec {
                name: key.name,
                scopes: key.scopes,
                on_behalf_of: key.on_behalf_of,
                destination: PathBuf::new(),
            };
            print(&client.update_api_key(&id, &spec).await?)
        }
        ApiKeyCommand::Delete { id, on_behalf_of } => {
            client.delete_api_key(&id, on_behalf_of.as_deref()).await?;
            tracing::info!(%id, "API key deleted");
            Ok(())
        }
    }
}

async fn subuser(command: SubuserCommand) -> Result<()> {
    let client = client()?;

    match command {
        SubuserCommand::Create {
            username,
            email,
            ips,
            disabled,
            domain,
            password_file,
            password_length,
        } => {
            let spec = SubuserSpec {
                username,
                email,
                ips,
                disabled,
                domain,
                password: PasswordSpec {
                    destination: password_file,
                    length: password_length,
                },
            };
            print(&client.create_subuser(&spec).await?)
        }
        SubuserCommand::Show { username } => {
            let state = client
                .read_subuser(&username)
                .await?
                .ok_or_else(|| anyhow!("subuser {} not found", username))?;
            print(&state)
        }
        SubuserCommand::Update {
            username,
            disabled,
            ips,
            domain,
        } => {
            let update = SubuserUpdate {
                disabled,
                ips: (!ips.is_empty()).then_some(ips),
                domain,
            };
            print(&client.update_subuser(&username, &update).await?)
        }
        SubuserCommand::Delete { username } => {
            client.delete_subuser(&username).await?;
            tracing::info!(%username, "subuser deleted");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Secret { length, output } => {
            let secret = secret::generate(length)?;
            match output {
                Some(path) => write_secret(&path, secret.as_bytes())
                    .await
                    .with_context(|| format!("unable to save secret to {}", path.display()))?,
                None => println!("{}", secret.expose()),
            }
            Ok(())
        }
        Commands::ApiKey(command) => api_key(command).await,
        Commands::Subuser(command) => subuser(command).await,
        Commands::Import(ImportCommand::ParseApiKey { id }) => {
            print(&id.parse::<ApiKeyImport>()?)
        }
        Commands::Import(ImportCommand::ParseSubuser { id }) => {
            print(&id.parse::<SubuserImport>()?)
        }
    }
}
