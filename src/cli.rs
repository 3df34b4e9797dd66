//! Command-line argument parsing for Parley.
//!
//! Uses clap to parse the `ask`, `analyze` and `conversations` commands.

use crate::config::Config;
use crate::persistence::PageRequest;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Ask questions of a transactional database in plain language.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Connection URL of the queried database (postgres:// or sqlite:)
    #[arg(long, global = true, value_name = "URL")]
    pub database_url: Option<String>,

    /// Path of the conversation state database
    #[arg(long, global = true, value_name = "PATH")]
    pub state_db: Option<PathBuf>,

    /// LLM provider to use (gemini, openai, ollama, mock)
    #[arg(long, global = true, value_name = "PROVIDER")]
    pub llm: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Ask a question and print the recorded message
    Ask {
        /// The question, in plain language
        question: String,

        #[command(flatten)]
        user: UserArg,

        /// Continue an existing conversation instead of starting one
        #[arg(short, long, value_name = "ID")]
        conversation: Option<i64>,
    },

    /// Generate commentary for a stored message
    Analyze {
        /// Message to analyze
        message_id: i64,

        #[command(flatten)]
        user: UserArg,
    },

    /// Manage conversations
    #[command(subcommand)]
    #[command(alias = "conv")]
    Conversations(ConversationCommand),
}

/// Conversation management commands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConversationCommand {
    /// List conversations, most recently updated first
    List {
        #[command(flatten)]
        user: UserArg,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Show a conversation and its messages
    Show {
        id: i64,

        #[command(flatten)]
        user: UserArg,
    },

    /// Start an empty conversation
    Create {
        #[command(flatten)]
        user: UserArg,

        #[arg(short, long)]
        title: Option<String>,
    },

    /// Change a conversation's title
    Rename {
        id: i64,

        title: String,

        #[command(flatten)]
        user: UserArg,
    },

    /// Delete a conversation and its messages
    Delete {
        id: i64,

        #[command(flatten)]
        user: UserArg,
    },

    /// Fork a conversation at one of its messages
    Branch {
        /// Conversation to fork
        parent_id: i64,

        /// Message the branch diverges from
        #[arg(long = "at", value_name = "MESSAGE_ID")]
        message_id: i64,

        #[arg(short, long)]
        title: Option<String>,

        #[command(flatten)]
        user: UserArg,
    },

    /// Search conversation titles
    Search {
        keyword: String,

        #[command(flatten)]
        user: UserArg,

        #[command(flatten)]
        page: PageArgs,
    },
}

/// The acting user.
#[derive(Args, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserArg {
    /// Identifier of the acting user
    #[arg(short = 'u', long = "user", env = "PARLEY_USER_ID", value_name = "ID")]
    pub id: i64,
}

/// Paging for listings.
#[derive(Args, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageArgs {
    /// Maximum entries to return (at most 100)
    #[arg(long)]
    pub limit: Option<i64>,

    /// Entries to skip
    #[arg(long)]
    pub offset: Option<i64>,
}

impl PageArgs {
    pub fn to_request(self) -> PageRequest {
        PageRequest::new(self.limit, self.offset)
    }
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Applies command-line overrides on top of file and environment values.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.database_url {
            config.database.url = Some(url.clone());
        }
        if let Some(path) = &self.state_db {
            config.state.path = Some(path.clone());
        }
        if let Some(provider) = &self.llm {
            config.llm.provider = provider.clone();
        }
    }

    /// Returns true if the command runs the question pipeline.
    pub fn needs_pipeline(&self) -> bool {
        matches!(self.command, Command::Ask { .. } | Command::Analyze { .. })
    }
}
