//! jim: fuzzy SSH connection launcher
//!
//! Short-lived CLI talking to the long-lived daemon. `jim server` runs the
//! daemon itself; everything else is a client invocation.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use jim::client::{self, ClientError, DaemonClient};
use jim::config::JimPaths;
use jim::daemon::protocol::{DecryptStep, OpStatus, ServerPayload, StateKind, StepKind};
use jim::search::Filter;
use jim::{crypto, inventory};

const PASSWORD_ATTEMPTS: u32 = 3;

#[derive(Parser)]
#[command(name = "jim")]
#[command(about = "Fuzzy SSH connection launcher backed by an encrypted server inventory")]
#[command(version)]
struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the jim daemon in the foreground
    Server,

    /// Open an interactive SSH session to the best-matching server
    Connect {
        /// Query words matched against the inventory tags
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// List inventory entries, optionally filtered
    List {
        /// Filter on the group field
        #[arg(long)]
        group: Option<String>,

        /// Filter on the environment field
        #[arg(long)]
        env: Option<String>,

        /// Filter on the tag field
        #[arg(long)]
        tag: Option<String>,

        /// Filter on the hostname (exact, case-insensitive)
        #[arg(long)]
        host: Option<String>,

        /// Free-text filter across all fields
        free: Option<String>,

        /// Maximum number of entries
        #[arg(short, long, default_value = "50")]
        limit: i32,
    },

    /// Show the daemon state
    Status,

    /// Reload the encrypted inventory file
    Reload,

    /// Decrypt the inventory for this session
    Unlock,

    /// Print candidate tags for a partial query (shell completion helper)
    Complete {
        query: String,

        /// Number of candidates
        #[arg(short, long, default_value = "3")]
        n: u32,
    },

    /// Encrypt a plaintext inventory file for use with jim
    Encrypt {
        /// Path to the plaintext JSON inventory
        path: PathBuf,

        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },

    /// Check a plaintext inventory file for problems
    Validate {
        /// Path to the plaintext JSON inventory
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon installs its own file-backed subscriber.
    if !matches!(cli.command, Commands::Server) {
        let log_level = match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match cli.command {
        Commands::Server => {
            if let Err(e) = jim::daemon::run().await {
                eprintln!("jim server failed to start: {e:#}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Connect { query } => connect(query.join(" ")).await,
        Commands::List {
            group,
            env,
            tag,
            host,
            free,
            limit,
        } => {
            let filter = Filter {
                group,
                env,
                tag,
                host,
                free,
            };
            list(filter, limit).await
        }
        Commands::Status => status().await,
        Commands::Reload => reload().await,
        Commands::Unlock => unlock().await,
        Commands::Complete { query, n } => complete(&query, n).await,
        Commands::Encrypt { path, force } => encrypt(&path, force),
        Commands::Validate { path } => validate(&path),
    }
}

/// Connect to the daemon and drive it to READY, prompting for the master
/// password when needed.
async fn ready_client() -> Result<DaemonClient> {
    let mut client = DaemonClient::connect().await?;
    loop {
        match client::ensure_ready(&mut client).await {
            Ok(()) => return Ok(client),
            Err(ClientError::DecryptionRequired) => {
                prompt_and_unlock(&mut client).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn prompt_and_unlock(client: &mut DaemonClient) -> Result<()> {
    let mut attempts = PASSWORD_ATTEMPTS;
    loop {
        let password = rpassword::prompt_password("Enter master password: ")
            .context("could not read the password from the terminal")?;

        let terminal = client::decrypt(client, password.into_bytes(), print_step).await?;
        match terminal {
            DecryptStep {
                step: StepKind::Done,
                status: OpStatus::Success,
                ..
            } => return Ok(()),
            DecryptStep {
                step: StepKind::Decrypt,
                reason,
                ..
            } => {
                attempts -= 1;
                if attempts == 0 {
                    bail!("no more attempts left, exiting");
                }
                eprintln!(
                    "Decryption failed ({}), remaining attempts: {attempts}",
                    reason.unwrap_or_else(|| "wrong password".into())
                );
            }
            DecryptStep { step, reason, .. } => {
                bail!(
                    "{} failed: {}. Your configuration file seems to be invalid, \
                     run 'jim validate' for help",
                    step.describe(),
                    reason.unwrap_or_default()
                );
            }
        }
    }
}

fn print_step(step: &DecryptStep) {
    if step.status == OpStatus::Success && step.step != StepKind::Done {
        eprintln!("{}... ok", step.step.describe());
    }
}

async fn connect(query: String) -> Result<()> {
    let mut client = ready_client().await?;
    let (tag, server) = client::match_server(&mut client, &query).await?;
    println!("Connection: {tag} -> {}", server.host);
    exec_ssh(&server)
}

/// Hand the terminal over to ssh, via sshpass when a password is configured.
fn exec_ssh(server: &ServerPayload) -> Result<()> {
    let destination = format!("{}@{}", server.username, server.host);
    let remote_command = format!("cd {}; bash", server.dir);
    let port = server.port.to_string();

    let mut command = if server.password.is_empty() {
        let mut c = Command::new("ssh");
        c.args(["-o", "StrictHostKeyChecking=no", "-p", &port, "-t"])
            .arg(&destination)
            .arg(&remote_command);
        c
    } else {
        let mut c = Command::new("sshpass");
        c.args(["-e", "ssh", "-o", "StrictHostKeyChecking=no", "-p", &port, "-t"])
            .arg(&destination)
            .arg(&remote_command);
        c.env("SSHPASS", String::from_utf8_lossy(&server.password).into_owned());
        c
    };

    let status = command
        .status()
        .context("failed to launch ssh; is it (and sshpass) on PATH?")?;
    if !status.success() {
        bail!("ssh exited with {status}");
    }
    Ok(())
}

async fn list(filter: Filter, limit: i32) -> Result<()> {
    let mut client = ready_client().await?;
    let groups = client::list(&mut client, filter, limit).await?;

    for group in groups {
        println!("{}", group.title);
        for entry in group.entries {
            println!("{} -> {}:{}", entry.tag, entry.info.host, entry.info.directory);
        }
        println!();
    }
    Ok(())
}

async fn status() -> Result<()> {
    let mut client = DaemonClient::connect().await?;
    let state = client::get_state(&mut client).await?;
    let text = match state {
        StateKind::ConfigFileRequired => "no inventory loaded (run 'jim reload')",
        StateKind::DecryptionRequired => "locked (run 'jim unlock')",
        StateKind::Ready => "ready",
    };
    println!("{text}");
    Ok(())
}

async fn reload() -> Result<()> {
    let paths = JimPaths::resolve()?;
    let inventory_file = paths.inventory_file();
    if !inventory_file.is_file() {
        bail!(
            "no encrypted inventory found at {}",
            inventory_file.display()
        );
    }

    let mut client = DaemonClient::connect().await?;
    client::load_config_file(&mut client, &inventory_file.to_string_lossy()).await?;
    println!("Loaded {}", inventory_file.display());
    Ok(())
}

async fn unlock() -> Result<()> {
    let mut client = DaemonClient::connect().await?;
    match client::ensure_ready(&mut client).await {
        Ok(()) => {}
        Err(ClientError::DecryptionRequired) => prompt_and_unlock(&mut client).await?,
        Err(e) => return Err(e.into()),
    }
    println!("jim is ready");
    Ok(())
}

async fn complete(query: &str, n: u32) -> Result<()> {
    // Completion must stay quiet: no daemon, no output.
    let Ok(mut client) = DaemonClient::connect().await else {
        return Ok(());
    };
    if let Ok(tags) = client::match_n(&mut client, query, n).await {
        for tag in tags {
            println!("{tag}");
        }
    }
    Ok(())
}

fn encrypt(path: &PathBuf, force: bool) -> Result<()> {
    let contents = std::fs::read(path)
        .with_context(|| format!("could not read {}", path.display()))?;

    let raw = inventory::parse(&contents)
        .context("the file could not be parsed as a jim inventory")?;
    for finding in inventory::check(&raw) {
        eprintln!("warning: {finding}");
    }

    let mut destination = path.clone().into_os_string();
    destination.push(".enc");
    let destination = PathBuf::from(destination);
    if destination.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            destination.display()
        );
    }

    let password = rpassword::prompt_password("Enter master password: ")
        .context("could not read the password from the terminal")?;
    let sealed = crypto::seal(password.as_bytes(), &contents)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(sealed);

    std::fs::write(&destination, encoded)
        .with_context(|| format!("could not write {}", destination.display()))?;
    println!("Wrote output to {}", destination.display());
    Ok(())
}

fn validate(path: &PathBuf) -> Result<()> {
    let contents = std::fs::read(path)
        .with_context(|| format!("could not read {}", path.display()))?;

    let raw = inventory::parse(&contents)
        .context("the file could not be parsed as a jim inventory")?;
    let findings = inventory::check(&raw);
    if findings.is_empty() {
        println!("Congrats, the config file is valid ({} entries)", raw.len());
        Ok(())
    } else {
        for finding in &findings {
            println!("{finding}");
        }
        bail!("{} problem(s) found", findings.len());
    }
}
