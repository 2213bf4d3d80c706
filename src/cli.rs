//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::access_layer::GmailAccessLayer;
use crate::auth;
use crate::config::Config;
use crate::error::{GmailError, Result};
use crate::mailbox::Mailbox;
use crate::quota::{QuotaStats, QuotaTracker};
use crate::transport::GmailApiTransport;

#[derive(Parser, Debug)]
#[command(name = "gmail-access")]
#[command(version = "0.1.0")]
#[command(about = "Rate-limited, quota-aware Gmail API access", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the OAuth2 credentials file from the config
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Override the token cache file from the config
    #[arg(long)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// List messages matching a search query
    List {
        /// Gmail search query, e.g. "in:inbox newer_than:7d"
        #[arg(short, long, default_value = "in:inbox")]
        query: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one message
    Show {
        id: String,

        /// Include the plain-text body
        #[arg(long)]
        body: bool,
    },

    /// List a message's attachments, optionally saving them
    Attachments {
        id: String,

        /// Directory to write every attachment into
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Apply a label to every message matching a query
    Label {
        #[arg(short, long)]
        query: String,

        /// Label name; created if missing
        #[arg(short, long)]
        label: String,

        /// Also remove the messages from the inbox
        #[arg(long)]
        archive: bool,
    },

    /// Trash (or permanently delete) every message matching a query
    Trash {
        #[arg(short, long)]
        query: String,

        /// Delete permanently instead of moving to trash
        #[arg(long)]
        permanent: bool,

        /// Actually perform the change; otherwise only count matches
        #[arg(long)]
        yes: bool,
    },

    /// Show today's quota usage from the persisted window
    Quota,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

impl Cli {
    /// Config file merged with command-line overrides
    pub async fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config).await?;
        if let Some(credentials) = &self.credentials {
            config.auth.credentials_path = credentials.clone();
        }
        if let Some(token_cache) = &self.token_cache {
            config.auth.token_cache_path = token_cache.clone();
        }
        Ok(config)
    }
}

/// Authenticate and start an access layer over the production transport
pub async fn connect(config: Config) -> Result<Mailbox> {
    let hub = auth::authenticate(&config.auth).await?;
    let transport = Arc::new(GmailApiTransport::new(hub));
    let layer = GmailAccessLayer::new(transport, config).await?;
    Ok(Mailbox::new(Arc::new(layer)))
}

pub async fn run_auth(config: &Config, force: bool) -> Result<()> {
    let token_cache = &config.auth.token_cache_path;
    if force && token_cache.exists() {
        tokio::fs::remove_file(token_cache).await?;
        info!("Removed existing token cache");
    }

    let hub = auth::authenticate(&config.auth).await?;
    println!("Successfully authenticated with Gmail API");
    println!("Token cached at: {:?}", token_cache);

    // Must specify scope to avoid triggering another OAuth flow
    let (_, profile) = hub
        .users()
        .get_profile("me")
        .add_scope("https://www.googleapis.com/auth/gmail.modify")
        .doit()
        .await?;
    println!(
        "Connected to account: {}",
        profile.email_address.unwrap_or_default()
    );
    Ok(())
}

pub async fn run_list(mailbox: &Mailbox, query: &str, limit: usize) -> Result<()> {
    let ids = mailbox.list_message_ids(query, Some(limit)).await?;
    if ids.is_empty() {
        println!("No messages match {:?}", query);
        return Ok(());
    }

    for id in ids {
        let message = mailbox.get_metadata(&id).await?;
        println!(
            "{}  {}  {:<30}  {}",
            message.id,
            message.date_received.format("%Y-%m-%d %H:%M"),
            truncate_string(&message.sender_email, 30),
            truncate_string(&message.subject, 60)
        );
    }
    Ok(())
}

pub async fn run_show(mailbox: &Mailbox, id: &str, body: bool) -> Result<()> {
    let message = if body {
        mailbox.get_message(id).await?
    } else {
        mailbox.get_metadata(id).await?
    };

    println!("ID:       {}", message.id);
    println!("Thread:   {}", message.thread_id);
    println!("From:     {} <{}>", message.sender_name, message.sender_email);
    println!("To:       {}", message.recipients.join(", "));
    println!("Date:     {}", message.date_received.to_rfc2822());
    println!("Subject:  {}", message.subject);
    println!("Labels:   {}", message.labels.join(", "));
    if let Some(text) = message.body {
        println!("\n{}", text);
    } else if !message.snippet.is_empty() {
        println!("\n{}", message.snippet);
    }
    Ok(())
}

pub async fn run_attachments(mailbox: &Mailbox, id: &str, save: Option<&Path>) -> Result<()> {
    let attachments = mailbox.list_attachments(id).await?;
    if attachments.is_empty() {
        println!("Message {} has no attachments", id);
        return Ok(());
    }

    for attachment in &attachments {
        println!(
            "{:<40} {:<28} {:>10}",
            truncate_string(&attachment.filename, 40),
            attachment.mime_type,
            attachment.size
        );
    }

    if let Some(dir) = save {
        tokio::fs::create_dir_all(dir).await?;
        for attachment in &attachments {
            let bytes = mailbox
                .download_attachment(id, &attachment.attachment_id)
                .await?;
            // Provider filenames may carry path separators
            let name = Path::new(&attachment.filename)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| attachment.attachment_id.clone().into());
            let path = dir.join(name);
            tokio::fs::write(&path, &bytes).await?;
            info!("Saved {:?} ({} bytes)", path, bytes.len());
        }
        println!("Saved {} attachments to {:?}", attachments.len(), dir);
    }
    Ok(())
}

pub async fn run_label(mailbox: &Mailbox, query: &str, label: &str, archive: bool) -> Result<()> {
    let label = mailbox.ensure_label(label).await?;
    let ids = mailbox.list_message_ids(query, None).await?;
    let remove = if archive {
        vec!["INBOX".to_string()]
    } else {
        vec![]
    };

    let outcomes = mailbox.relabel(&ids, &[label.id.clone()], &remove).await?;
    println!("Labeled {} messages with {:?}", outcomes.len(), label.name);
    Ok(())
}

pub async fn run_trash(mailbox: &Mailbox, query: &str, permanent: bool, yes: bool) -> Result<()> {
    if !yes {
        let ids = mailbox.list_message_ids(query, None).await?;
        println!(
            "{} messages match {:?}; re-run with --yes to {} them",
            ids.len(),
            query,
            if permanent { "permanently delete" } else { "trash" }
        );
        return Ok(());
    }

    let count = if permanent {
        mailbox.delete_matching(query).await?
    } else {
        mailbox.trash_matching(query).await?
    };
    println!(
        "{} {} messages",
        if permanent { "Deleted" } else { "Trashed" },
        count
    );
    Ok(())
}

pub fn print_quota(stats: &QuotaStats) {
    println!("\n========================================");
    println!("Quota window {}", stats.date);
    println!("========================================");
    println!(
        "Consumed: {} / {} units ({:.1}%)",
        stats.consumed, stats.ceiling, stats.usage_percent
    );
    println!("Remaining: {}", stats.remaining);
    println!("Calls: {}  Errors: {}", stats.total_calls, stats.errors);
    for (method, usage) in &stats.top_methods {
        println!("  {:<24} {:>6} calls {:>8} units", method, usage.calls, usage.units);
    }
}

pub async fn run_quota(config: &Config) -> Result<()> {
    if config.quota.state_path.is_none() {
        return Err(GmailError::ConfigError(
            "quota.state_path is not set; no persisted window to show".to_string(),
        ));
    }
    let tracker = QuotaTracker::load(&config.quota).await?;
    print_quota(&tracker.stats().await);
    Ok(())
}

pub async fn run_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(GmailError::ConfigError(format!(
            "{:?} already exists (use --force to overwrite)",
            output
        )));
    }
    Config::create_example(output).await?;
    println!("Wrote example configuration to {:?}", output);
    Ok(())
}
