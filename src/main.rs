//! Parley - ask questions of a transactional database in plain language.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use db_parley::cli::{Cli, Command, ConversationCommand};
use db_parley::config::Config;
use db_parley::error::ParleyError;
use db_parley::llm::{create_client, LlmService};
use db_parley::logging::init_logging;
use db_parley::persistence::{ConversationStore, NewBranch, StateDb};
use db_parley::query::{QueryExecutor, QueryLimits, QueryPipeline};
use serde::Serialize;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<ParleyError>() {
                Some(parley) => error!("{}: {}", parley.category(), parley),
                None => error!("{e:#}"),
            }
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config_path();
    let mut config = Config::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let state_path = config.state.resolved_path();
    let store = Arc::new(StateDb::open(&state_path).await?);

    let result = if cli.needs_pipeline() {
        let pipeline = build_pipeline(&config, store.clone()).await?;
        run_pipeline_command(&pipeline, cli.command).await
    } else {
        run_conversation_command(store.as_ref(), cli.command).await
    };

    store.close().await;
    result
}

async fn build_pipeline(config: &Config, store: Arc<StateDb>) -> Result<QueryPipeline> {
    let url = config.database.url.as_deref().ok_or_else(|| {
        ParleyError::config("No database configured. Set database.url or DATABASE_URL.")
    })?;

    info!("Connecting to {}", config.database.display_string());
    let db = db_parley::db::connect(url).await?;
    let llm = create_client(&config.llm, config.query.timeout())?;
    let schema = config.schema.load_context()?;

    let executor = QueryExecutor::new(Arc::from(db), QueryLimits::from(&config.query));
    let service = LlmService::new(Arc::from(llm), schema);
    Ok(QueryPipeline::new(store, service, executor).with_analysis(config.analysis.enabled))
}

async fn run_pipeline_command(pipeline: &QueryPipeline, command: Command) -> Result<()> {
    match command {
        Command::Ask {
            question,
            user,
            conversation,
        } => {
            let message = pipeline
                .execute_query(user.id, &question, conversation)
                .await?;
            print_json(&message)
        }
        Command::Analyze { message_id, user } => {
            let analysis = pipeline.analyze_message(user.id, message_id).await?;
            println!("{analysis}");
            Ok(())
        }
        Command::Conversations(command) => {
            run_conversation_command(pipeline.store().as_ref(), Command::Conversations(command))
                .await
        }
    }
}

async fn run_conversation_command(store: &dyn ConversationStore, command: Command) -> Result<()> {
    let Command::Conversations(command) = command else {
        anyhow::bail!("command requires a database connection");
    };

    match command {
        ConversationCommand::List { user, page } => {
            print_json(&store.list_conversations(user.id, page.to_request()).await?)
        }
        ConversationCommand::Show { id, user } => {
            print_json(&store.get_conversation(user.id, id).await?)
        }
        ConversationCommand::Create { user, title } => {
            print_json(&store.create_conversation(user.id, title.as_deref()).await?)
        }
        ConversationCommand::Rename { id, title, user } => {
            print_json(&store.rename_conversation(user.id, id, &title).await?)
        }
        ConversationCommand::Delete { id, user } => {
            store.delete_conversation(user.id, id).await?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        ConversationCommand::Branch {
            parent_id,
            message_id,
            title,
            user,
        } => {
            let branch = NewBranch {
                parent_id,
                branch_point_message_id: message_id,
                title,
            };
            print_json(&store.create_branch(user.id, &branch).await?)
        }
        ConversationCommand::Search {
            keyword,
            user,
            page,
        } => print_json(
            &store
                .search_conversations(user.id, &keyword, page.to_request())
                .await?,
        ),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}
