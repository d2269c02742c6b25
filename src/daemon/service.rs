//! Request handling: the query engine bound to the RPC surface
//!
//! Every method snapshots the state through the manager, works on the
//! snapshot, and signals the idle timer on success. `Match` and `List`
//! require READY and answer `WrongState` otherwise; errors cross the wire as
//! typed replies, never as dropped connections.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{error, info};

use super::idle::IdleTimer;
use super::pipeline;
use super::protocol::{
    DecryptStep, Group, GroupEntry, OpStatus, PublicServerInfo, Request, Response,
};
use super::state::{DaemonState, StateHandle};
use crate::inventory::ConfigElement;
use crate::search::Filter;

pub struct JimService {
    state: StateHandle,
    timer: IdleTimer,
    indices_dir: PathBuf,
}

impl JimService {
    pub fn new(state: StateHandle, timer: IdleTimer, indices_dir: PathBuf) -> Self {
        Self {
            state,
            timer,
            indices_dir,
        }
    }

    /// Dispatch a unary request. `Decrypt` streams and goes through
    /// [`JimService::decrypt_stream`] instead.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetState => self.get_state().await,
            Request::LoadConfigFile { path } => self.load_config_file(&path).await,
            Request::Match { query } => self.match_one(&query).await,
            Request::MatchN { query, n } => self.match_n(&query, n as usize).await,
            Request::List { filter, limit } => self.list(&filter, limit).await,
            Request::Decrypt { .. } => Response::error("decrypt requires a streaming reply"),
        }
    }

    /// Start the decrypt-and-index pipeline; the receiver yields progress
    /// events ending in a terminal step.
    pub fn decrypt_stream(&self, password: Vec<u8>) -> mpsc::Receiver<DecryptStep> {
        pipeline::spawn(
            password,
            self.state.clone(),
            self.indices_dir.clone(),
            self.timer.clone(),
        )
    }

    async fn get_state(&self) -> Response {
        match self.state.read().await {
            Ok(snapshot) => Response::State(snapshot.kind()),
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn load_config_file(&self, path: &str) -> Response {
        let failure = |reason: String| Response::Load {
            status: OpStatus::Failure,
            reason: Some(reason),
        };

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return failure(format!("failed to load config file from {path}")),
        }
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => return failure(format!("could not read file at {path}: {e}")),
        };

        // Close first so a previously decrypted inventory never outlives a
        // reload of its source file.
        if let Err(e) = self.state.close().await {
            return Response::error(e.to_string());
        }
        if let Err(e) = self
            .state
            .write(DaemonState::Locked {
                blob: std::sync::Arc::new(bytes),
            })
            .await
        {
            return Response::error(e.to_string());
        }

        info!(path, "encrypted inventory loaded");
        self.timer.touch();
        Response::Load {
            status: OpStatus::Success,
            reason: None,
        }
    }

    async fn match_one(&self, query: &str) -> Response {
        let snapshot = match self.state.read().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Response::error(e.to_string()),
        };
        let DaemonState::Ready {
            inventory,
            tags,
            index,
            ..
        } = snapshot
        else {
            return Response::WrongState;
        };

        // Exact tag hits win before any ranked matching; similar tags make
        // the ranked answer annoying when the exact one exists.
        if let Some(element) = tags
            .get(&query.to_lowercase())
            .and_then(|&position| inventory.get(position))
        {
            self.timer.touch();
            return reply_match(element);
        }

        match index.match_tag(query) {
            Ok(Some(tag)) => {
                match tags
                    .get(&tag.to_lowercase())
                    .and_then(|&position| inventory.get(position))
                {
                    Some(element) => {
                        self.timer.touch();
                        reply_match(element)
                    }
                    None => Response::NotFound,
                }
            }
            Ok(None) => Response::NotFound,
            Err(e) => {
                error!(query, error = %e, "tag match failed");
                Response::error(e.to_string())
            }
        }
    }

    async fn match_n(&self, query: &str, n: usize) -> Response {
        let snapshot = match self.state.read().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Response::error(e.to_string()),
        };
        let DaemonState::Ready { index, .. } = snapshot else {
            return Response::WrongState;
        };

        match index.top_tags(query, n) {
            Ok(tags) => Response::Tags(tags),
            Err(e) => {
                error!(query, error = %e, "completion match failed");
                Response::error(e.to_string())
            }
        }
    }

    async fn list(&self, filter: &Filter, limit: i32) -> Response {
        let snapshot = match self.state.read().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Response::error(e.to_string()),
        };
        let DaemonState::Ready {
            inventory,
            tags,
            index,
            ..
        } = snapshot
        else {
            return Response::WrongState;
        };

        if limit <= 0 {
            self.timer.touch();
            return Response::Groups(Vec::new());
        }
        let limit = limit as usize;

        let groups = if filter.is_empty() {
            group_records(inventory.iter().take(limit))
        } else {
            let hit_tags = match index.filtered(filter, limit) {
                Ok(hit_tags) => hit_tags,
                Err(e) => {
                    error!(error = %e, "filtered list failed");
                    return Response::error(e.to_string());
                }
            };
            group_records(hit_tags.iter().filter_map(|tag| {
                tags.get(&tag.to_lowercase())
                    .and_then(|&position| inventory.get(position))
            }))
        };

        self.timer.touch();
        Response::Groups(groups)
    }
}

fn reply_match(element: &ConfigElement) -> Response {
    Response::Match {
        tag: element.tag.clone(),
        server: element.into(),
    }
}

/// Group records under `"<group> - <env>"` titles, first-seen order.
fn group_records<'a>(records: impl Iterator<Item = &'a ConfigElement>) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for element in records {
        let title = format!("{} - {}", element.group, element.env);
        let entry = GroupEntry {
            tag: element.tag.clone(),
            info: PublicServerInfo {
                host: element.server.host.clone(),
                directory: element.server.dir.clone(),
            },
        };
        match positions.get(&title) {
            Some(&position) => groups[position].entries.push(entry),
            None => {
                positions.insert(title.clone(), groups.len());
                groups.push(Group {
                    title,
                    entries: vec![entry],
                });
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::StateKind;
    use crate::daemon::state::spawn_state_manager;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> JimService {
        let state = spawn_state_manager();
        let timer = IdleTimer::spawn(state.clone(), Duration::from_secs(90 * 60));
        JimService::new(state, timer, dir.path().join("indices"))
    }

    #[tokio::test]
    async fn fresh_daemon_requires_config_file() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let response = service.handle(Request::GetState).await;
        assert!(matches!(
            response,
            Response::State(StateKind::ConfigFileRequired)
        ));
    }

    #[tokio::test]
    async fn queries_outside_ready_answer_wrong_state() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let response = service
            .handle(Request::Match {
                query: "api".into(),
            })
            .await;
        assert!(matches!(response, Response::WrongState));

        let response = service
            .handle(Request::List {
                filter: Filter::default(),
                limit: 10,
            })
            .await;
        assert!(matches!(response, Response::WrongState));
    }

    #[tokio::test]
    async fn loading_a_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let response = service
            .handle(Request::LoadConfigFile {
                path: "/definitely/not/here.enc".into(),
            })
            .await;
        match response {
            Response::Load { status, reason } => {
                assert_eq!(status, OpStatus::Failure);
                assert!(reason.unwrap().contains("/definitely/not/here.enc"));
            }
            other => panic!("expected load reply, got {other:?}"),
        }
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let raw = crate::inventory::parse(
            br#"[
                {"group":"prod","env":"eu","tag":"b",
                 "server":{"host":"h","dir":"/","port":"22","username":"u","password":"p"}},
                {"group":"db","env":"us","tag":"a",
                 "server":{"host":"h","dir":"/","port":"22","username":"u","password":"p"}},
                {"group":"prod","env":"eu","tag":"c",
                 "server":{"host":"h","dir":"/","port":"22","username":"u","password":"p"}}
            ]"#,
        )
        .unwrap();
        let inventory = crate::inventory::Inventory::from_raw(raw).unwrap();

        let groups = group_records(inventory.iter());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].title, "prod - eu");
        assert_eq!(groups[0].entries.len(), 2);
        assert_eq!(groups[1].title, "db - us");
    }
}
