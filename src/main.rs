//! cipherpad - encrypted file access from the command line
//!
//! Reads and writes files encrypted for keys held in cipherpad's key
//! registry, and manages those keys.
//!
//! # Usage
//!
//! ```bash
//! # Create a key and make it the default recipient
//! cipherpad keys generate --user-id "Alice <alice@example.com>" --protect
//! cipherpad keys default <KEY_ID>
//!
//! # Encrypt and decrypt
//! cipherpad write notes.asc --input notes.txt
//! cipherpad read notes.asc
//!
//! # Remembered passphrases need a master password
//! CIPHERPAD_MASTER_PASSWORD=your_password cipherpad read notes.asc
//! ```

use anyhow::Context;
use cipherpad::access::{AccessSettings, RemoveOutcome};
use cipherpad::config::Config;
use cipherpad::{
    EncryptedAccess, KeyKind, KeySummary, NoPrompter, Prompter, TerminalPrompter, WriteOptions,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cipherpad", version)]
#[command(about = "Read and write files encrypted for your keys")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "CIPHERPAD_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage keys
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Decrypt a file to stdout
    Read {
        file: PathBuf,
    },

    /// Encrypt input into a file
    Write {
        file: PathBuf,

        /// Read plaintext from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Key id to encrypt for
        #[arg(short, long)]
        recipient: Option<String>,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// List managed and external keys
    List {
        #[arg(long)]
        json: bool,
    },

    /// Import armored keys from a file
    Import { file: PathBuf },

    /// Remove a managed key
    Remove(KeySelector),

    /// Generate a new key pair
    Generate {
        #[arg(long)]
        user_id: String,

        /// Protect the private key with a passphrase
        #[arg(long)]
        protect: bool,
    },

    /// Print a key in armored form
    Export(KeySelector),

    /// Show, set or clear the default recipient
    Default {
        key_id: Option<String>,

        #[arg(long, conflicts_with = "key_id")]
        clear: bool,
    },

    /// Forget the remembered passphrase of a key
    ForgetPassphrase { key_id: String },

    /// Rescan the configured external key paths
    Reload,
}

#[derive(Args)]
struct KeySelector {
    key_id: String,

    /// Which half of the pair: public or private
    #[arg(long, default_value = "public", value_parser = KeyKind::parse)]
    kind: KeyKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    init_logging(&config);
    debug!("cipherpad v{}", VERSION);

    // Plaintext read from stdin leaves nothing to answer prompts with
    let prompter: Arc<dyn Prompter> = match &cli.command {
        Command::Write { input: None, .. } => Arc::new(NoPrompter),
        _ => Arc::new(TerminalPrompter::new()),
    };

    let access = EncryptedAccess::open(&config, prompter.clone()).await?;

    match cli.command {
        Command::Keys(command) => run_keys(&access, prompter.as_ref(), command).await,
        Command::Read { file } => {
            let outcome = access
                .read_encrypted(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            if let Some(warning) = &outcome.warning {
                eprintln!("warning: {}", warning);
            }
            let mut stdout = tokio::io::stdout();
            stdout.write_all(outcome.content.expose()).await?;
            stdout.flush().await?;
            Ok(())
        }
        Command::Write {
            file,
            input,
            recipient,
        } => {
            let plaintext = match input {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            let report = access
                .write_encrypted(&file, &plaintext, &WriteOptions { recipient })
                .await
                .with_context(|| format!("writing {}", file.display()))?;
            if let Some(warning) = &report.warning {
                eprintln!("warning: {}", warning);
            }
            info!("Encrypted for {}", report.recipient_key_id);
            Ok(())
        }
    }
}

async fn run_keys(
    access: &EncryptedAccess,
    prompter: &dyn Prompter,
    command: KeysCommand,
) -> anyhow::Result<()> {
    match command {
        KeysCommand::List { json } => {
            let listing = access.list_keys().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                print_keys("Managed", &listing.managed);
                print_keys("External", &listing.external);
            }
        }
        KeysCommand::Import { file } => {
            let armored = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            for record in access.import_key(&armored).await? {
                println!("imported {} {} {}", record.kind, record.key_id, record.user_id);
            }
        }
        KeysCommand::Remove(selector) => {
            let kind = selector.kind;
            match access.remove_key(&selector.key_id, kind).await? {
                RemoveOutcome::Removed => println!("removed {} {}", kind, selector.key_id),
                RemoveOutcome::Protected => anyhow::bail!(
                    "{} is loaded from an external path; remove it there instead",
                    selector.key_id
                ),
                RemoveOutcome::NotFound => {
                    anyhow::bail!("no {} key {}", kind, selector.key_id)
                }
            }
        }
        KeysCommand::Generate { user_id, protect } => {
            let passphrase = if protect {
                let passphrase = prompter
                    .prompt_secret("New passphrase")
                    .await?
                    .context("a passphrase is required with --protect")?;
                Some(passphrase)
            } else {
                None
            };
            let records = access.generate_key(&user_id, passphrase.as_ref()).await?;
            if let Some(record) = records.first() {
                println!("{}", record.key_id);
            }
        }
        KeysCommand::Export(selector) => {
            let armored = access
                .export_key(&selector.key_id, selector.kind)
                .await?;
            print!("{}", armored);
        }
        KeysCommand::Default { key_id, clear } => {
            if clear {
                access.set_default_recipient(None).await?;
            } else if let Some(id) = key_id {
                access.set_default_recipient(Some(&id)).await?;
            } else {
                match access.default_recipient().await? {
                    Some(id) => println!("{}", id),
                    None => println!("(none)"),
                }
            }
        }
        KeysCommand::ForgetPassphrase { key_id } => {
            access.forget_passphrase(&key_id).await?;
        }
        KeysCommand::Reload => {
            let AccessSettings { external_paths, .. } = access.settings().await;
            let generation = access.reload_from_config().await;
            let listing = access.list_keys().await;
            println!(
                "loaded {} external keys from {} paths (generation {})",
                listing.external.len(),
                external_paths.len(),
                generation
            );
        }
    }
    Ok(())
}

fn print_keys(title: &str, keys: &[KeySummary]) {
    println!("{} keys:", title);
    if keys.is_empty() {
        println!("  (none)");
    }
    for key in keys {
        match &key.source {
            Some(source) => println!(
                "  {:<7} {} {} [{}]",
                key.kind.as_str(),
                key.key_id,
                key.user_id,
                source.display()
            ),
            None => println!("  {:<7} {} {}", key.kind.as_str(), key.key_id, key.user_id),
        }
    }
}

/// Initialize logging
fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // stdout carries decrypted content, so logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
