//! Client-side IPC operations
//!
//! Typed wrappers over the wire protocol for CLI commands, plus the
//! ready-state preamble: load the default inventory file when none is
//! loaded, and surface a password requirement for the caller to satisfy.

pub mod connection;

pub use connection::DaemonClient;

use thiserror::Error;

use crate::config::JimPaths;
use crate::daemon::protocol::{
    DecryptStep, Group, OpStatus, Request, Response, ServerPayload, StateKind,
};
use crate::search::Filter;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the jim daemon is not running, start it with: jim server")]
    DaemonNotRunning,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("unexpected response from daemon")]
    UnexpectedResponse,

    #[error("the inventory is locked, the master password is required")]
    DecryptionRequired,

    #[error("no entry matched the query")]
    NoMatch,

    #[error("the daemon reported: {0}")]
    Daemon(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Query the daemon lifecycle state.
pub async fn get_state(client: &mut DaemonClient) -> Result<StateKind, ClientError> {
    match client.request(&Request::GetState).await? {
        Response::State(kind) => Ok(kind),
        Response::Error { reason } => Err(ClientError::Daemon(reason)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

/// Ask the daemon to load the encrypted inventory at `path`.
pub async fn load_config_file(client: &mut DaemonClient, path: &str) -> Result<(), ClientError> {
    let request = Request::LoadConfigFile {
        path: path.to_string(),
    };
    match client.request(&request).await? {
        Response::Load {
            status: OpStatus::Success,
            ..
        } => Ok(()),
        Response::Load { reason, .. } => Err(ClientError::Daemon(
            reason.unwrap_or_else(|| "load failed".into()),
        )),
        Response::Error { reason } => Err(ClientError::Daemon(reason)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

/// Run the decrypt pipeline, reporting each step to `on_step`. Returns the
/// terminal step.
pub async fn decrypt(
    client: &mut DaemonClient,
    password: Vec<u8>,
    mut on_step: impl FnMut(&DecryptStep),
) -> Result<DecryptStep, ClientError> {
    client.send(&Request::Decrypt { password }).await?;

    loop {
        match client.read_frame().await? {
            Response::Step(step) => {
                on_step(&step);
                if step.is_terminal() {
                    return Ok(step);
                }
            }
            Response::Error { reason } => return Err(ClientError::Daemon(reason)),
            _ => return Err(ClientError::UnexpectedResponse),
        }
    }
}

/// Single best match for a query.
pub async fn match_server(
    client: &mut DaemonClient,
    query: &str,
) -> Result<(String, ServerPayload), ClientError> {
    let request = Request::Match {
        query: query.to_string(),
    };
    match client.request(&request).await? {
        Response::Match { tag, server } => Ok((tag, server)),
        Response::NotFound => Err(ClientError::NoMatch),
        Response::WrongState => Err(ClientError::DecryptionRequired),
        Response::Error { reason } => Err(ClientError::Daemon(reason)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

/// Top-n candidate tags for a query.
pub async fn match_n(
    client: &mut DaemonClient,
    query: &str,
    n: u32,
) -> Result<Vec<String>, ClientError> {
    let request = Request::MatchN {
        query: query.to_string(),
        n,
    };
    match client.request(&request).await? {
        Response::Tags(tags) => Ok(tags),
        Response::WrongState => Err(ClientError::DecryptionRequired),
        Response::Error { reason } => Err(ClientError::Daemon(reason)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

/// Filtered listing, sorted for display: groups by title, entries by tag.
pub async fn list(
    client: &mut DaemonClient,
    filter: Filter,
    limit: i32,
) -> Result<Vec<Group>, ClientError> {
    let request = Request::List { filter, limit };
    match client.request(&request).await? {
        Response::Groups(mut groups) => {
            groups.sort_by(|a, b| a.title.cmp(&b.title));
            for group in &mut groups {
                group.entries.sort_by(|a, b| a.tag.cmp(&b.tag));
            }
            Ok(groups)
        }
        Response::WrongState => Err(ClientError::DecryptionRequired),
        Response::Error { reason } => Err(ClientError::Daemon(reason)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

/// Drive the daemon towards READY: load the default inventory file when no
/// file is loaded, and report [`ClientError::DecryptionRequired`] when the
/// caller must supply the master password.
pub async fn ensure_ready(client: &mut DaemonClient) -> Result<(), ClientError> {
    loop {
        match get_state(client).await? {
            StateKind::Ready => return Ok(()),
            StateKind::DecryptionRequired => return Err(ClientError::DecryptionRequired),
            StateKind::ConfigFileRequired => {
                let paths =
                    JimPaths::resolve().map_err(|e| ClientError::Config(e.to_string()))?;
                let inventory = paths.inventory_file();
                if !inventory.is_file() {
                    return Err(ClientError::Config(format!(
                        "no encrypted inventory found at {}; create one with 'jim encrypt' \
                         or point {} at it",
                        inventory.display(),
                        crate::config::ENV_CONFIG_FILE,
                    )));
                }
                load_config_file(client, &inventory.to_string_lossy()).await?;
            }
        }
    }
}
