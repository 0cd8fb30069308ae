//! Accepts the in-container agent wrapper's connection on a project's
//! relay socket and registers the resulting `SocketRelay` with the shared
//! `RelayRegistry` so `RelayExecutor` can find it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use oubliette_core::{RelayRegistry, SocketRelay, SocketRequestHandler};
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Binds one Unix domain socket per project under `socket_dir`, accepting
/// reconnects for as long as the daemon runs. A project whose socket
/// already exists on disk (stale from a prior crash) has it removed
/// first - nothing else binds to it once the container is gone.
pub struct RelayListener {
    socket_dir: PathBuf,
    registry: Arc<RelayRegistry>,
    handler: Arc<dyn SocketRequestHandler>,
}

impl RelayListener {
    pub fn new(
        socket_dir: impl Into<PathBuf>,
        registry: Arc<RelayRegistry>,
        handler: Arc<dyn SocketRequestHandler>,
    ) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            registry,
            handler,
        }
    }

    fn socket_path(&self, project_id: Uuid) -> PathBuf {
        self.socket_dir.join(format!("{project_id}.sock"))
    }

    /// Starts accepting connections for `project_id`. Runs until the
    /// listener itself fails to bind or accept; a per-connection failure
    /// just logs and keeps accepting, since the agent wrapper may dial
    /// back in after a crash.
    pub async fn serve(&self, project_id: Uuid, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        let path = self.socket_path(project_id);
        if let Err(e) = ensure_parent(&path) {
            error!(project_id = %project_id, error = %e, "failed to create relay socket directory");
            return;
        }
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale relay socket");
            }
        }

        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to bind relay socket");
                return;
            }
        };
        info!(project_id = %project_id, path = %path.display(), "relay listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept(project_id, stream).await,
                        Err(e) => warn!(project_id = %project_id, error = %e, "relay accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(project_id = %project_id, "relay listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn accept(&self, project_id: Uuid, stream: tokio::net::UnixStream) {
        let (relay, _pump) = SocketRelay::spawn(project_id, stream, self.handler.clone());
        if let Err(e) = self.registry.register(Arc::new(relay)).await {
            error!(project_id = %project_id, error = %e, "failed to register relay connection");
        } else {
            info!(project_id = %project_id, "agent wrapper connected");
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
