//! Unix socket front end
//!
//! One JSON request line and one JSON response line per connection. The
//! socket is owner-only (0700 on its directory and the socket itself).

use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::errors::{AgentError, AgentResult};
use super::handler::MigrationAgent;
use super::response::Response;
use crate::observability::Logger;

/// Largest accepted request line.
pub const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// Bind the socket, replacing a stale one, and restrict it to the owner.
pub fn bind(socket_path: &Path) -> AgentResult<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent).map_err(|e| AgentError::socket(parent, e))?;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
            .map_err(|e| AgentError::socket(parent, e))?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path).map_err(|e| AgentError::socket(socket_path, e))?;
    }
    let listener = UnixListener::bind(socket_path).map_err(|e| AgentError::socket(socket_path, e))?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o700))
        .map_err(|e| AgentError::socket(socket_path, e))?;
    Ok(listener)
}

/// Accept connections until `shutdown` resolves, then drain the agent.
pub async fn serve<F>(agent: Arc<MigrationAgent>, socket_path: &Path, shutdown: F) -> AgentResult<()>
where
    F: Future<Output = ()>,
{
    let listener = bind(socket_path)?;
    Logger::info(
        "AGENT_LISTENING",
        &[("socket", &socket_path.display().to_string())],
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let agent = agent.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(&agent, stream).await {
                            Logger::warn("AGENT_CONNECTION_FAILED", &[("error", &e.to_string())]);
                        }
                    });
                }
                Err(e) => Logger::error("AGENT_ACCEPT_FAILED", &[("error", &e.to_string())]),
            },
        }
    }

    Logger::info("AGENT_SHUTTING_DOWN", &[]);
    agent.shutdown().await;
    let _ = fs::remove_file(socket_path);
    Logger::info("AGENT_STOPPED", &[]);
    Ok(())
}

async fn handle_connection(agent: &MigrationAgent, stream: UnixStream) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response = if line.trim().is_empty() {
        Response::error(&AgentError::InvalidRequest("empty request".to_string()))
    } else {
        agent.handle_line(line.trim_end()).await
    };

    let mut out = response.to_json();
    out.push('\n');
    write.write_all(out.as_bytes()).await?;
    write.flush().await?;
    write.shutdown().await
}

/// Send one request line to a running agent and return the raw response line.
pub async fn request(socket_path: &Path, line: &str) -> AgentResult<String> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| AgentError::socket(socket_path, e))?;
    let (read, mut write) = stream.into_split();

    let mut payload = line.trim_end().to_string();
    payload.push('\n');
    write
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| AgentError::socket(socket_path, e))?;
    write
        .shutdown()
        .await
        .map_err(|e| AgentError::socket(socket_path, e))?;

    let mut response = String::new();
    BufReader::new(read)
        .read_line(&mut response)
        .await
        .map_err(|e| AgentError::socket(socket_path, e))?;
    Ok(response.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::engine::EngineContext;
    use crate::observability::MemoryAuditLog;
    use crate::services::memory::InMemoryHost;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = MigrationConfig::rooted_at(dir.path());
        let socket = config.socket_path.clone();
        let ctx = EngineContext::in_memory(config, Arc::new(InMemoryHost::new()), u64::MAX).unwrap();
        let agent = Arc::new(MigrationAgent::new(ctx, Arc::new(MemoryAuditLog::new())));

        let (stop, stopped) = oneshot::channel::<()>();
        let server = {
            let socket = socket.clone();
            tokio::spawn(async move {
                serve(agent, &socket, async {
                    let _ = stopped.await;
                })
                .await
            })
        };

        let mut attempts = 0;
        while !socket.exists() && attempts < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            attempts += 1;
        }
        let mode = fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        let raw = request(&socket, r#"{"action":"migration_list_jobs"}"#).await.unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["success"], Value::Bool(true));
        assert_eq!(value["count"], Value::from(0));

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
