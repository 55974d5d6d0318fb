use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gincli::config::{config_root, find_repo_root};
use gincli::vcs::write_known_hosts;
use gincli::{
    resolve_hosts, AccountClient, AnnexRule, Config, GitAnnexCli, OutputFormat, ProgressReporter,
    RepoPath, RunSummary, SyncEngine, TokenStore,
};

#[derive(Parser)]
#[command(name = "gin")]
#[command(about = "Command-line client for GIN data repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory (defaults to $GIN_CONFIG_DIR or the platform config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a repository and download its annexed content
    Get {
        /// Repository as owner/name
        repository: String,

        /// Print progress as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Commit and upload local changes of the current repository
    Upload {
        /// Files or directories to upload (defaults to all modified files)
        paths: Vec<PathBuf>,

        /// Print progress as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List the SSH keys registered for the logged-in user
    Keys {
        #[arg(long)]
        json: bool,
    },

    /// Register a public SSH key for the logged-in user
    AddKey {
        /// Public key file
        file: PathBuf,

        /// Key description (defaults to the key comment)
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Show account information
    Account {
        /// Login name
        login: String,

        #[arg(long)]
        json: bool,
    },

    /// Forget the stored session
    Logout,
}

/// Per-command context resolved from the command line and environment
struct CommandEnv {
    root: Option<PathBuf>,
    config: Config,
    tokens: TokenStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    debug!("Starting gin v{}", env!("CARGO_PKG_VERSION"));

    let ctx = load_context(cli.config)?;

    match cli.command {
        Commands::Get { repository, json } => cmd_get(&ctx, &repository, json).await,
        Commands::Upload { paths, json } => cmd_upload(&ctx, paths, json).await,
        Commands::Keys { json } => cmd_keys(&ctx, json).await,
        Commands::AddKey { file, description } => cmd_add_key(&ctx, &file, description).await,
        Commands::Account { login, json } => cmd_account(&ctx, &login, json).await,
        Commands::Logout => cmd_logout(&ctx),
    }
}

/// Initialize logging based on verbosity level. Logs go to stderr; stdout
/// belongs to the progress reporter.
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

fn load_context(config_dir: Option<PathBuf>) -> Result<CommandEnv> {
    let root = config_dir.or_else(config_root);
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let config = Config::load_merged(root.as_deref(), &cwd).context("Failed to load configuration")?;

    let tokens = match &root {
        Some(dir) => TokenStore::new(dir),
        None => TokenStore::unresolved(),
    };

    Ok(CommandEnv {
        root,
        config,
        tokens,
    })
}

fn account_client(ctx: &CommandEnv) -> AccountClient {
    let hosts = resolve_hosts(&ctx.config);
    AccountClient::new(hosts.gin_host, ctx.tokens.clone())
}

fn build_engine(ctx: &CommandEnv) -> Result<Arc<SyncEngine>> {
    let hosts = resolve_hosts(&ctx.config);
    let rules = AnnexRule::from_config(&ctx.config.annex).context("Invalid annex configuration")?;

    let known_hosts = match (&ctx.root, ctx.config.git.hostkey.trim()) {
        (Some(root), hostkey) if !hostkey.is_empty() => Some(
            write_known_hosts(root, hostkey).context("Failed to write known hosts file")?,
        ),
        _ => None,
    };
    let vcs = GitAnnexCli::new(&ctx.config, known_hosts.as_deref());

    Ok(Arc::new(SyncEngine::new(Arc::new(vcs), hosts, rules)))
}

fn require_login(ctx: &CommandEnv) -> Result<()> {
    let session = ctx
        .tokens
        .load_token()
        .context("This command requires login")?;
    debug!("Using session of {}", session.username);
    Ok(())
}

/// Clone a repository into the current directory
async fn cmd_get(ctx: &CommandEnv, repository: &str, json: bool) -> Result<()> {
    let repo = RepoPath::parse(repository)?;
    require_login(ctx)?;

    let engine = build_engine(ctx)?;
    let parent = std::env::current_dir().context("Failed to determine working directory")?;
    info!("Getting {} into {}", repo, parent.display());

    let (mut rx, handle) = engine.spawn_clone(repo, parent);
    let mut reporter = ProgressReporter::new(std::io::stdout(), OutputFormat::from_json_flag(json));
    reporter.drain(&mut rx).await?;

    let summary = handle.await.context("Clone task did not complete")??;
    finish(&summary)
}

/// Upload changes of the repository containing the current directory
async fn cmd_upload(ctx: &CommandEnv, paths: Vec<PathBuf>, json: bool) -> Result<()> {
    require_login(ctx)?;

    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let repo_root = find_repo_root(&cwd)
        .ok_or_else(|| anyhow!("This command must be run from inside a gin repository"))?;
    let paths = paths
        .iter()
        .map(|path| relative_to_root(&repo_root, &cwd, path))
        .collect::<Result<Vec<_>>>()?;

    let engine = build_engine(ctx)?;
    info!("Uploading from {}", repo_root.display());

    let (mut rx, handle) = engine.spawn_upload(repo_root, paths);
    let mut reporter = ProgressReporter::new(std::io::stdout(), OutputFormat::from_json_flag(json));
    reporter.drain(&mut rx).await?;

    let summary = handle.await.context("Upload task did not complete")??;
    finish(&summary)
}

/// Express a user-supplied path relative to the repository root
fn relative_to_root(repo_root: &Path, cwd: &Path, path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(cwd.join(path))
        .with_context(|| format!("Invalid path {}", path.display()))?;
    let relative = absolute
        .strip_prefix(repo_root)
        .map_err(|_| anyhow!("{} is outside the repository", path.display()))?;

    if relative.as_os_str().is_empty() {
        Ok(PathBuf::from("."))
    } else {
        Ok(relative.to_path_buf())
    }
}

fn finish(summary: &RunSummary) -> Result<()> {
    if summary.has_failures() {
        bail!("{} of {} files failed", summary.failed, summary.total);
    }
    Ok(())
}

/// List registered SSH keys
async fn cmd_keys(ctx: &CommandEnv, json: bool) -> Result<()> {
    let keys = account_client(ctx).get_user_keys().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }

    println!("You have {} key(s) associated with your account", keys.len());
    for (idx, key) in keys.iter().enumerate() {
        println!("[{}] \"{}\"", idx + 1, key.description);
        println!("   Fingerprint: {}", key.fingerprint);
    }
    Ok(())
}

/// Register a public key read from a file
async fn cmd_add_key(ctx: &CommandEnv, file: &Path, description: Option<String>) -> Result<()> {
    let key = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read key file {}", file.display()))?;
    let key = key.trim();

    let description = description.unwrap_or_else(|| {
        key.split_whitespace()
            .nth(2)
            .map(str::to_string)
            .unwrap_or_else(|| "gin key".to_string())
    });

    account_client(ctx).add_key(key, &description, false).await?;
    println!("\u{2713} Key '{}' added", description);
    Ok(())
}

/// Show account information
async fn cmd_account(ctx: &CommandEnv, login: &str, json: bool) -> Result<()> {
    let account = account_client(ctx).request_account(login).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&account)?);
        return Ok(());
    }

    let names = [
        account.title.as_deref(),
        Some(account.first_name.as_str()),
        account.middle_name.as_deref(),
        Some(account.last_name.as_str()),
    ];
    let full_name = names
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    println!("User {}", account.login);
    println!("   Name: {}", full_name);
    if let Some(affiliation) = &account.affiliation {
        let parts = [
            affiliation.department.as_str(),
            affiliation.institute.as_str(),
            affiliation.city.as_str(),
            affiliation.country.as_str(),
        ];
        let text = parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if !text.is_empty() {
            println!("   Affiliation: {}", text);
        }
    }
    Ok(())
}

fn cmd_logout(ctx: &CommandEnv) -> Result<()> {
    ctx.tokens.delete_token()?;
    println!("\u{2713} Logged out");
    Ok(())
}
