use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

mod classifier;
mod clients;
mod config;
mod server;
mod session;
mod turn;
mod vault;

use clients::Endpoint;
use clients::chat::HttpChatBackend;
use clients::model::HttpModel;
use clients::phq9::HttpQuestionnaireBackend;
use clients::results::HttpClassifierStore;

#[derive(Debug, Parser)]
#[command(name = "calmchat")]
#[command(about = "Mental-health support chat session engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:7272")]
        listen: String,
        /// Chat backend base URL (persistence, history, session lifecycle).
        #[arg(long)]
        chat_api: Option<String>,
        /// NLP service base URL (next-turn replies, questionnaire scoring).
        #[arg(long)]
        model_api: Option<String>,
        /// Bearer token; persisted to the vault for later runs.
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        vault_key: Option<String>,
        #[arg(long)]
        vault_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, chat_api, model_api, token, vault_key, vault_path } => {
            let addr: SocketAddr = listen.parse()?;
            let overrides = config::Overrides { chat_api, model_api, token, vault_key, vault_path };
            let cfg = config::resolve(&overrides, &config::EnvValues::from_process())?;

            let path = match &cfg.vault_path {
                Some(p) => p.clone(),
                None => vault::Vault::default_path()?,
            };
            let mut vault = vault::Vault::open(path, &cfg.vault_passphrase)?;
            let token = match &cfg.token {
                Some(t) => {
                    vault.set("token", t)?;
                    Some(t.clone())
                }
                None => vault.get("token"),
            };

            let chat_ep = Endpoint::new(cfg.chat_api_base.clone(), token.clone());
            let model_ep = Endpoint::new(cfg.model_api_base.clone(), token);
            let chat = Arc::new(HttpChatBackend::new(chat_ep.clone()));
            let phq9 = Arc::new(HttpQuestionnaireBackend::new(chat_ep.clone()));
            let store = Arc::new(HttpClassifierStore::new(chat_ep));
            let model = Arc::new(HttpModel::new(model_ep));

            let turns = Arc::new(turn::TurnController::new(chat, phq9.clone(), model.clone()));
            let classifier = Arc::new(classifier::ClassifierInvoker::new(phq9, model, store));

            let state = server::AppState::new(turns, classifier);
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
