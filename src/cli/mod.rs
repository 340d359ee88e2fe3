//! Command-line interface parsing and handling
//!
//! This module parses arguments, sets up logging, and dispatches to the web
//! server or one of the terminal commands.

pub mod ask;
pub mod chat;
pub mod model_list;
pub mod persona_list;
pub mod table;


use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::data::Config;
use crate::core::credentials::{AuthStatus, CredentialSource};
use crate::core::language::Language;
use crate::core::session::{Services, SessionContext};

#[derive(Parser)]
#[command(name = "chatosophy")]
#[command(about = "Talk with famous philosophers, one at a time or as a panel")]
#[command(
    long_about = "Chatosophy lets you chat with philosopher personas backed by remote LLM APIs. \
In single mode you hold a conversation with one philosopher; in multi mode several philosophers \
answer the same question and an assistant writes a synthesis and a comparison table.\n\n\
Credentials:\n\
  Pass --api-key to use your own key, or set the provider's environment variable\n\
  (OPENAI_API_KEY or REPLICATE_API_TOKEN by default) to use the default key.\n\n\
Logging:\n\
  RUST_LOG          Log filter, e.g. RUST_LOG=chatosophy=debug"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Catalog file to load instead of the user config or the built-in catalog
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Model id from the catalog
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Language the philosophers answer in
    #[arg(short = 'L', long, global = true, value_name = "LANGUAGE")]
    pub language: Option<Language>,

    /// Use this key instead of the provider's default key
    #[arg(long, global = true, value_name = "KEY")]
    pub api_key: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the web interface
    Serve {
        /// Address to listen on (defaults to the catalog's [server] bind)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// List the philosophers in the catalog
    Personas,
    /// List the models in the catalog
    Models,
    /// Chat with one philosopher in the terminal
    Chat {
        /// Persona id, e.g. plato
        #[arg(short, long)]
        persona: String,
    },
    /// Ask several philosophers the same question and synthesize their answers
    Ask {
        /// The question to ask
        #[arg(required = true, trailing_var_arg = true)]
        question: Vec<String>,
        /// Persona ids; repeat the flag for each philosopher
        #[arg(short, long = "persona", required = true)]
        personas: Vec<String>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let default_filter = match args.command {
        Commands::Serve { .. } => "chatosophy=info",
        _ => "chatosophy=warn",
    };
    init_tracing(default_filter);

    let config = Config::load(args.config.as_deref())?;

    match &args.command {
        Commands::Personas => {
            persona_list::list_personas(&config);
            Ok(())
        }
        Commands::Models => {
            model_list::list_models(&config);
            Ok(())
        }
        Commands::Serve { bind } => {
            let bind = bind.clone().unwrap_or_else(|| config.server.bind.clone());
            let services = Arc::new(Services::new(config, reqwest::Client::new())?);
            info!(
                personas = services.personas.list_personas().len(),
                models = services.config.models.len(),
                "catalog loaded"
            );
            crate::web::serve(services, &bind).await
        }
        Commands::Chat { persona } => {
            let services = Arc::new(Services::new(config, reqwest::Client::new())?);
            let session = authenticated_session(services, &args).await?;
            chat::run_chat(session, persona).await
        }
        Commands::Ask { question, personas } => {
            let services = Arc::new(Services::new(config, reqwest::Client::new())?);
            let session = authenticated_session(services, &args).await?;
            ask::run_ask(session, &question.join(" "), personas).await
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Build the process's session from the global flags and validate its
/// credential. The terminal has no way to re-enter a key, so rejection ends
/// the command.
pub async fn authenticated_session(
    services: Arc<Services>,
    args: &Args,
) -> Result<SessionContext, Box<dyn Error>> {
    let mut session = SessionContext::new(services);
    configure_session(&mut session, args)?;

    session.validate().await?;
    ensure_authenticated(&session)?;
    Ok(session)
}

fn configure_session(session: &mut SessionContext, args: &Args) -> Result<(), Box<dyn Error>> {
    if let Some(model) = &args.model {
        session.select_model(model)?;
    }
    if let Some(language) = args.language {
        session.set_language(language);
    }
    match &args.api_key {
        Some(key) => session.set_credential(CredentialSource::UserSupplied, Some(key.clone())),
        None => session.set_credential(CredentialSource::Default, None),
    }
    Ok(())
}

fn ensure_authenticated(session: &SessionContext) -> Result<(), Box<dyn Error>> {
    match session.auth_status() {
        AuthStatus::Authenticated => Ok(()),
        AuthStatus::Rejected(reason) => {
            let provider = session.gate().provider();
            Err(format!(
                "❌ Authentication failed: {reason}\n\n💡 Get a {provider} key at {}",
                provider.key_help_url()
            )
            .into())
        }
        status => Err(format!("❌ Authentication did not complete ({status:?})").into()),
    }
}
