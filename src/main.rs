use anyhow::Result;
use clap::Parser;
use gmail_access::cli::{self, Cli, Commands};
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Exit with proper code on error
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: gmail-access --help");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("gmail_access=debug,info")
        } else {
            EnvFilter::new("gmail_access=info,warn")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> Result<()> {
    // Install default crypto provider for rustls
    // On non-Windows platforms use aws-lc-rs, on Windows use ring
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    if let Commands::InitConfig { output, force } = &cli.command {
        cli::run_init_config(output, *force).await?;
        return Ok(());
    }

    let config = cli.load_config().await?;

    match cli.command {
        Commands::Auth { force } => {
            tracing::info!("Authenticating with Gmail API...");
            cli::run_auth(&config, force).await?;
        }
        Commands::Quota => cli::run_quota(&config).await?,
        Commands::InitConfig { .. } => {}
        command => {
            let mailbox = cli::connect(config).await?;
            let result = match command {
                Commands::List { query, limit } => cli::run_list(&mailbox, &query, limit).await,
                Commands::Show { id, body } => cli::run_show(&mailbox, &id, body).await,
                Commands::Attachments { id, save } => {
                    cli::run_attachments(&mailbox, &id, save.as_deref()).await
                }
                Commands::Label {
                    query,
                    label,
                    archive,
                } => cli::run_label(&mailbox, &query, &label, archive).await,
                Commands::Trash {
                    query,
                    permanent,
                    yes,
                } => cli::run_trash(&mailbox, &query, permanent, yes).await,
                Commands::Auth { .. } | Commands::Quota | Commands::InitConfig { .. } => Ok(()),
            };

            mailbox.layer().shutdown().await;
            if cli.verbose {
                cli::print_quota(&mailbox.layer().quota().stats().await);
            }
            result?;
        }
    }

    Ok(())
}
