//! Command-line interface implementation.

use crate::config::Config;
use crate::crypto::SecretKey;
use crate::error::{KeychainError, Result};
use crate::models::{Chain, ChainLink, Keychain};
use crate::prompt::Prompter;
use crate::security::ClipboardManager;
use crate::service::KeychainService;
use crate::storable::{self, StorableFormat};
use crate::sync::{self, SyncServer};
use crate::utils::{self, success, warning};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Password manager organised in chains of credentials.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true, env = "KEYCHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to store file
    #[arg(short = 's', long, global = true, env = "KEYCHAIN_STORE")]
    pub store: Option<PathBuf>,

    /// Output format
    #[arg(
        short = 'o',
        long,
        global = true,
        value_enum,
        default_value = "text",
        help = "Output format"
    )]
    pub output: OutputFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new, empty store
    Init {
        /// Overwrite an existing store
        #[arg(short, long)]
        force: bool,
    },

    /// Manage chains
    #[command(subcommand)]
    Chain(ChainCommand),

    /// Manage chain links
    #[command(subcommand)]
    Link(LinkCommand),

    /// Search links by name or description
    Search {
        query: String,

        /// Case sensitive search
        #[arg(short = 'c', long)]
        case_sensitive: bool,
    },

    /// Export chains to a JSON, CSV or TXT file
    Export {
        file: PathBuf,

        /// Chain to export (repeatable, default: all)
        #[arg(long = "chain")]
        chains: Vec<String>,

        /// Write clear passwords instead of ciphertext
        #[arg(long)]
        plain: bool,

        /// File format (default: from extension)
        #[arg(short, long, value_enum)]
        format: Option<StorableFormat>,
    },

    /// Import chains from a JSON, CSV or TXT file
    Import {
        file: PathBuf,

        /// File format (default: from extension)
        #[arg(short, long, value_enum)]
        format: Option<StorableFormat>,
    },

    /// Synchronize with another keychain over the network
    #[command(subcommand)]
    Sync(SyncCommand),

    /// Forget deleted records older than the given number of days
    Purge {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ChainCommand {
    /// Create a chain
    New {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List chains
    List,
    /// Rename a chain or change its description
    Edit {
        name: String,
        #[arg(long = "name")]
        new_name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Delete a chain and all of its links
    Remove {
        name: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Change a chain's key
    Rekey { name: String },
}

#[derive(Subcommand, Debug)]
pub enum LinkCommand {
    /// Add a link to a chain
    Add {
        chain: String,
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List the links of a chain
    List { chain: String },
    /// Reveal a link's password
    Show {
        chain: String,
        name: String,
        /// Copy to clipboard instead of printing
        #[arg(short, long)]
        clipboard: bool,
        /// Seconds before the clipboard is cleared
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Change a link
    Edit {
        chain: String,
        name: String,
        #[arg(long = "name")]
        new_name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        /// Prompt for a new password
        #[arg(short, long)]
        password: bool,
    },
    /// Delete a link
    Remove { chain: String, name: String },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Wait for peers and synchronize with them
    Serve {
        #[arg(long)]
        bind: Option<IpAddr>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Exit after the first session
        #[arg(long)]
        once: bool,
    },
    /// Synchronize with a peer at HOST:PORT
    Connect { addr: String },
}

/// Everything a command needs.
struct Context {
    config: Config,
    store_path: PathBuf,
    service: KeychainService,
    prompter: Prompter,
    output: OutputFormat,
}

impl Context {
    fn load(&self) -> Result<Keychain> {
        for warn in utils::check_file_permissions(&self.store_path) {
            warning(&warn);
        }
        self.service.load(&self.store_path)
    }

    fn save(&self, doc: &Keychain) -> Result<()> {
        self.service.save(doc, &self.store_path)
    }

    fn unlock(&mut self, chain: &Chain) -> Result<SecretKey> {
        let key = self.prompter.secret(&format!("Key for chain '{}'", chain.name))?;
        let spinner = self.prompter.spinner("Deriving key...");
        let result = self.service.unlock_chain(chain, &key);
        spinner.finish_and_clear();
        result
    }

    fn print_json(&self, value: &serde_json::Value) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn find_chain<'a>(doc: &'a Keychain, name: &str) -> Result<&'a Chain> {
    doc.find_chain_by_name(name.trim())
        .ok_or_else(|| KeychainError::ChainNotFound(name.to_string()))
}

fn find_link<'a>(doc: &'a Keychain, chain: &Chain, name: &str) -> Result<&'a ChainLink> {
    doc.find_link_by_name(chain.id, name.trim())
        .ok_or_else(|| KeychainError::LinkNotFound(format!("{}/{}", chain.name, name)))
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(&self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let store_path = self
            .store
            .clone()
            .unwrap_or_else(|| config.store_path.clone());
        let service = KeychainService::new()
            .with_kdf(config.kdf)
            .with_backup_on_save(config.backup_on_save);

        let mut ctx = Context {
            config,
            store_path,
            service,
            prompter: Prompter::new(),
            output: self.output,
        };

        match &self.command {
            Commands::Init { force } => init_store(&ctx, *force),
            Commands::Chain(command) => run_chain(&mut ctx, command),
            Commands::Link(command) => run_link(&mut ctx, command).await,
            Commands::Search {
                query,
                case_sensitive,
            } => search(&ctx, query, *case_sensitive),
            Commands::Export {
                file,
                chains,
                plain,
                format,
            } => export(&mut ctx, file, chains, *plain, *format),
            Commands::Import { file, format } => import(&mut ctx, file, *format),
            Commands::Sync(command) => run_sync(ctx, command).await,
            Commands::Purge { days } => purge(&ctx, *days),
        }
    }
}

fn init_store(ctx: &Context, force: bool) -> Result<()> {
    ctx.service.init(&ctx.store_path, force)?;
    success(&format!("Keychain initialized at {}", ctx.store_path.display()));
    Ok(())
}

fn run_chain(ctx: &mut Context, command: &ChainCommand) -> Result<()> {
    let mut doc = ctx.load()?;

    match command {
        ChainCommand::New { name, description } => {
            let key = ctx.prompter.new_secret(&format!("Key for new chain '{name}'"))?;
            let spinner = ctx.prompter.spinner("Deriving key...");
            let result = ctx.service.create_chain(&mut doc, name, description, &key);
            spinner.finish_and_clear();
            result?;
            ctx.save(&doc)?;
            success(&format!("Created chain: {}", name.trim()));
        }
        ChainCommand::List => {
            if ctx.output == OutputFormat::Json {
                let chains: Vec<_> = doc
                    .live_chains()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.id,
                            "name": c.name,
                            "description": c.description,
                            "links": doc.chain_links(c.id).count(),
                            "modified": c.modified,
                        })
                    })
                    .collect();
                return ctx.print_json(&serde_json::json!(chains));
            }

            let mut any = false;
            for chain in doc.live_chains() {
                any = true;
                let count = doc.chain_links(chain.id).count();
                if chain.description.is_empty() {
                    println!("{} ({} links)", chain.name.bold(), count);
                } else {
                    println!(
                        "{} ({} links) - {}",
                        chain.name.bold(),
                        count,
                        chain.description.dimmed()
                    );
                }
            }
            if !any {
                println!("{}", "(no chains)".dimmed());
            }
        }
        ChainCommand::Edit {
            name,
            new_name,
            description,
        } => {
            let id = find_chain(&doc, name)?.id;
            ctx.service
                .update_chain(&mut doc, id, new_name.as_deref(), description.as_deref())?;
            ctx.save(&doc)?;
            success(&format!("Updated chain: {}", name.trim()));
        }
        ChainCommand::Remove { name, yes } => {
            let chain = find_chain(&doc, name)?;
            let id = chain.id;
            let count = doc.chain_links(id).count();
            if !*yes
                && !ctx.prompter.confirm(
                    &format!("Delete chain '{}' and its {} links?", chain.name, count),
                    false,
                )?
            {
                return Err(KeychainError::Cancelled);
            }
            ctx.service.delete_chain(&mut doc, id)?;
            ctx.save(&doc)?;
            success(&format!("Deleted chain: {}", name.trim()));
        }
        ChainCommand::Rekey { name } => {
            let id = find_chain(&doc, name)?.id;
            let old_key = ctx.prompter.secret(&format!("Current key for chain '{name}'"))?;
            let new_key = ctx.prompter.new_secret("New key")?;
            let spinner = ctx.prompter.spinner("Re-encrypting links...");
            let result = ctx.service.change_chain_key(&mut doc, id, &old_key, &new_key);
            spinner.finish_and_clear();
            result?;
            ctx.save(&doc)?;
            success(&format!("Changed key of chain: {}", name.trim()));
        }
    }

    Ok(())
}

async fn run_link(ctx: &mut Context, command: &LinkCommand) -> Result<()> {
    let mut doc = ctx.load()?;

    match command {
        LinkCommand::Add {
            chain,
            name,
            description,
        } => {
            let chain = find_chain(&doc, chain)?.clone();
            let secret = ctx.unlock(&chain)?;
            let password = ctx.prompter.new_secret("Password")?;
            ctx.service
                .add_link(&mut doc, chain.id, &secret, name, description, &password)?;
            ctx.save(&doc)?;
            success(&format!("Added link: {}/{}", chain.name, name.trim()));
        }
        LinkCommand::List { chain } => {
            let chain = find_chain(&doc, chain)?;
            if ctx.output == OutputFormat::Json {
                let links: Vec<_> = doc
                    .chain_links(chain.id)
                    .map(|l| {
                        serde_json::json!({
                            "id": l.id,
                            "name": l.name,
                            "description": l.description,
                            "modified": l.modified,
                        })
                    })
                    .collect();
                return ctx.print_json(&serde_json::json!(links));
            }

            println!("{}", chain.name.bold());
            let links: Vec<_> = doc.chain_links(chain.id).collect();
            for (i, link) in links.iter().enumerate() {
                let branch = if i + 1 == links.len() { "└──" } else { "├──" };
                if link.description.is_empty() {
                    println!("{branch} {}", link.name);
                } else {
                    println!("{branch} {} - {}", link.name, link.description.dimmed());
                }
            }
        }
        LinkCommand::Show {
            chain,
            name,
            clipboard,
            timeout,
        } => {
            let chain = find_chain(&doc, chain)?.clone();
            let link = find_link(&doc, &chain, name)?;
            let secret = ctx.unlock(&chain)?;
            let password = ctx.service.reveal_password(link, &secret)?;

            if *clipboard {
                let timeout = timeout.unwrap_or(ctx.config.clipboard_timeout_secs);
                let handle = ClipboardManager::copy_with_timeout(&password, timeout)?;
                success(&format!("Copied to clipboard, clearing in {timeout}s"));
                let _ = handle.await;
            } else if ctx.output == OutputFormat::Json {
                ctx.print_json(&serde_json::json!({
                    "chain": chain.name,
                    "name": link.name,
                    "description": link.description,
                    "password": password.as_str(),
                }))?;
            } else {
                println!("{}", password.as_str());
            }
        }
        LinkCommand::Edit {
            chain,
            name,
            new_name,
            description,
            password,
        } => {
            let chain = find_chain(&doc, chain)?.clone();
            let link_id = find_link(&doc, &chain, name)?.id;
            let secret = ctx.unlock(&chain)?;
            let new_password = if *password {
                Some(ctx.prompter.new_secret("New password")?)
            } else {
                None
            };
            ctx.service.update_link(
                &mut doc,
                link_id,
                &secret,
                new_name.as_deref(),
                description.as_deref(),
                new_password.as_ref().map(|p| p.as_str()),
            )?;
            ctx.save(&doc)?;
            success(&format!("Updated link: {}/{}", chain.name, name.trim()));
        }
        LinkCommand::Remove { chain, name } => {
            let chain = find_chain(&doc, chain)?.clone();
            let link_id = find_link(&doc, &chain, name)?.id;
            ctx.service.delete_link(&mut doc, link_id)?;
            ctx.save(&doc)?;
            success(&format!("Deleted link: {}/{}", chain.name, name.trim()));
        }
    }

    Ok(())
}

fn search(ctx: &Context, query: &str, case_sensitive: bool) -> Result<()> {
    let doc = ctx.load()?;
    let results = ctx.service.search_links(&doc, query, case_sensitive);

    if ctx.output == OutputFormat::Json {
        let results: Vec<_> = results
            .iter()
            .map(|(chain, link)| {
                serde_json::json!({
                    "chain": chain.name,
                    "name": link.name,
                    "description": link.description,
                })
            })
            .collect();
        return ctx.print_json(&serde_json::json!(results));
    }

    if results.is_empty() {
        println!("{}", "No matches".dimmed());
    }
    for (chain, link) in results {
        println!("{}/{}", chain.name.dimmed(), link.name);
    }
    Ok(())
}

fn export(
    ctx: &mut Context,
    file: &Path,
    chains: &[String],
    plain: bool,
    format: Option<StorableFormat>,
) -> Result<()> {
    let doc = ctx.load()?;
    let ids = chains
        .iter()
        .map(|name| find_chain(&doc, name).map(|c| c.id))
        .collect::<Result<Vec<_>>>()?;

    if plain {
        warning("The export file will contain passwords in plain text");
    }

    let storable = storable::export(&ctx.service, &doc, &ids, !plain, &mut ctx.prompter)?;
    storable::write_file(file, &storable, format)?;
    success(&format!(
        "Exported {} chains to {}",
        storable.chains.len(),
        file.display()
    ));
    Ok(())
}

fn import(ctx: &mut Context, file: &Path, format: Option<StorableFormat>) -> Result<()> {
    let mut doc = ctx.load()?;
    let storable = storable::read_file(file, format)?;
    let report = storable::import(&ctx.service, &mut doc, &storable, &mut ctx.prompter)?;
    ctx.save(&doc)?;

    if ctx.output == OutputFormat::Json {
        return ctx.print_json(&serde_json::to_value(report)?);
    }
    success(&format!(
        "Imported {} chains: {} links created, {} updated, {} unchanged",
        report.chains_created, report.links_created, report.links_updated, report.links_unchanged
    ));
    Ok(())
}

async fn run_sync(ctx: Context, command: &SyncCommand) -> Result<()> {
    let mut sync_config = ctx.config.sync.clone();
    let output = ctx.output;

    let report = match command {
        SyncCommand::Serve { bind, port, once } => {
            if let Some(bind) = bind {
                sync_config.bind_address = *bind;
            }
            if let Some(port) = port {
                sync_config.port = *port;
            }
            let service = Arc::new(ctx.service);

            if *once {
                SyncServer::serve_once(ctx.store_path, service, &sync_config).await?
            } else {
                let server = SyncServer::start(ctx.store_path, service, &sync_config).await?;
                success(&format!(
                    "Listening for sync peers on {} (Ctrl+C to stop)",
                    server.addr
                ));
                tokio::signal::ctrl_c().await?;
                server.stop().await;
                return Ok(());
            }
        }
        SyncCommand::Connect { addr } => {
            sync::sync_with_peer(addr, &ctx.store_path, &ctx.service, &sync_config).await?
        }
    };

    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        success(&format!("Synchronized with {}", report.peer.bold()));
        println!("  local:  {}", report.local);
        println!("  remote: {}", report.remote);
        if report.local.conflicts > 0 {
            warning("Some links were encrypted under an outdated chain key and were deleted");
        }
    }
    Ok(())
}

fn purge(ctx: &Context, days: i64) -> Result<()> {
    if days < 0 {
        return Err(KeychainError::Other("--days must not be negative".to_string()));
    }
    let mut doc = ctx.load()?;
    let purged = ctx
        .service
        .purge_deleted(&mut doc, Utc::now() - Duration::days(days));
    if purged > 0 {
        ctx.save(&doc)?;
    }
    success(&format!("Purged {purged} deleted records"));
    Ok(())
}
