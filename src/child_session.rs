//! Owns one child tool-server process and its newline-delimited JSON-RPC
//! stream. See `SPEC_FULL.md` §4.2.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ServerSpec;
use crate::error::ChildSessionError;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initializing,
    Connected,
    Draining,
    Terminated,
}

/// One entry from a `tools/list` response, passed through largely as given.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// One content item from a `tools/call` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, ChildSessionError>>>;

struct Inner {
    server_name: String,
    state: RwLock<SessionState>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    stdin: Mutex<Option<ChildStdin>>,
    reader_cancel: CancellationToken,
}

/// A running child MCP server plus its framed stdio transport.
pub struct ChildSession {
    inner: Arc<Inner>,
    child: Mutex<Child>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChildSession {
    /// Spawn `spec`, perform the MCP `initialize` handshake, and return a
    /// session in the `Connected` state. On any failure the child is killed
    /// before the error is returned.
    pub async fn start(
        server_name: &str,
        spec: &ServerSpec,
        handshake_timeout: Duration,
    ) -> Result<Self, ChildSessionError> {
        let mut command = tokio::process::Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Put the child in its own process group so teardown can reach
        // grandchildren spawned by a wrapper (`npx`, `uvx`, a shell script).
        // SAFETY: setsid() is async-signal-safe and runs before exec.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|source| ChildSessionError::SpawnFailed {
                server: server_name.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ChildSessionError::SpawnFailed {
            server: server_name.to_string(),
            source: std::io::Error::other("child did not provide a stdout handle"),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| ChildSessionError::SpawnFailed {
            server: server_name.to_string(),
            source: std::io::Error::other("child did not provide a stdin handle"),
        })?;
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let inner = Arc::new(Inner {
            server_name: server_name.to_string(),
            state: RwLock::new(SessionState::Initializing),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(Some(stdin)),
            reader_cancel: CancellationToken::new(),
        });

        let reader_task = spawn_reader(inner.clone(), stdout);

        let session = Self {
            inner,
            child: Mutex::new(child),
            reader_task: Mutex::new(Some(reader_task)),
        };

        if let Err(error) = session.handshake(handshake_timeout).await {
            session.close().await;
            return Err(error);
        }

        *session.inner.state.write().await = SessionState::Connected;
        Ok(session)
    }

    async fn handshake(&self, timeout: Duration) -> Result<(), ChildSessionError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "mcp-hub", "version": env!("CARGO_PKG_VERSION") },
        });

        let result = match tokio::time::timeout(
            timeout,
            self.send_request("initialize", Some(params)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                return Err(ChildSessionError::InitializeTimeout {
                    server: self.inner.server_name.clone(),
                });
            }
        };

        result.map_err(|error| match error {
            ChildSessionError::RpcError { message, .. } => ChildSessionError::InitializeRejected {
                server: self.inner.server_name.clone(),
                reason: message,
            },
            other => other,
        })?;

        self.send_notification("notifications/initialized", None)
            .await;
        Ok(())
    }

    /// Issue `tools/list`. Requires the session be `Connected`.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ChildSessionError> {
        self.require_connected().await?;
        let result = self.send_request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        serde_json::from_value(tools).map_err(|source| ChildSessionError::RpcError {
            server: self.inner.server_name.clone(),
            code: -32700,
            message: format!("malformed tools/list response: {source}"),
        })
    }

    /// Issue `tools/call`. If `arguments` is absent, `null`, or an empty
    /// object, the outgoing request omits the `arguments` field entirely.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Vec<ContentItem>, ChildSessionError> {
        self.require_connected().await?;

        let mut params = serde_json::Map::new();
        params.insert("name".to_string(), Value::String(name.to_string()));
        let include_arguments = match &arguments {
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if include_arguments {
            if let Some(arguments) = arguments {
                params.insert("arguments".to_string(), arguments);
            }
        }

        let result = self
            .send_request("tools/call", Some(Value::Object(params)))
            .await?;

        let content = result
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(content
            .into_iter()
            .map(|item| ContentItem {
                kind: item
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("text")
                    .to_string(),
                text: item.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect())
    }

    async fn require_connected(&self) -> Result<(), ChildSessionError> {
        if *self.inner.state.read().await == SessionState::Connected {
            Ok(())
        } else {
            Err(ChildSessionError::NotConnected {
                server: self.inner.server_name.clone(),
            })
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) {
        let mut frame = serde_json::Map::new();
        frame.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        frame.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params {
            frame.insert("params".to_string(), params);
        }
        let _ = self.write_frame(&Value::Object(frame)).await;
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ChildSessionError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let mut frame = serde_json::Map::new();
        frame.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        frame.insert("id".to_string(), Value::Number(id.into()));
        frame.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params {
            frame.insert("params".to_string(), params);
        }

        if let Err(error) = self.write_frame(&Value::Object(frame)).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(error);
        }

        rx.await.unwrap_or(Err(ChildSessionError::StreamClosed {
            server: self.inner.server_name.clone(),
        }))
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), ChildSessionError> {
        let mut line = serde_json::to_string(frame).map_err(|source| {
            ChildSessionError::RpcError {
                server: self.inner.server_name.clone(),
                code: -32700,
                message: format!("failed to encode outgoing frame: {source}"),
            }
        })?;
        line.push('\n');

        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| ChildSessionError::StreamClosed {
            server: self.inner.server_name.clone(),
        })?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| ChildSessionError::StreamClosed {
                server: self.inner.server_name.clone(),
            })?;
        stdin.flush().await.map_err(|_| ChildSessionError::StreamClosed {
            server: self.inner.server_name.clone(),
        })
    }

    /// Cancel the reader task, close stdin, wait briefly for exit, then
    /// kill the child's whole process group. Idempotent — safe to call
    /// more than once.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.write().await;
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Terminated;
        }

        self.inner.reader_cancel.cancel();
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.inner.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::debug!(server = %self.inner.server_name, error = %error, "failed to wait on child exit");
            }
            Err(_) => kill_process_group(&mut child).await,
        }

        fail_all_pending(
            &self.inner,
            ChildSessionError::StreamClosed {
                server: self.inner.server_name.clone(),
            },
        )
        .await;
    }
}

/// Kills the whole process group so a wrapper's (`npx`, `uvx`, a shell
/// script) grandchildren don't survive teardown. Falls back to killing
/// just the immediate child if the pid can't be read.
async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; a negative pid targets
            // the whole process group set up via setsid() at spawn.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }
    let _ = child.kill().await;
}

fn spawn_reader(
    inner: Arc<Inner>,
    stdout: tokio::process::ChildStdout,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let cancel = inner.reader_cancel.clone();

        loop {
            let next_line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            match next_line {
                Ok(Some(line)) => dispatch_line(&inner, &line).await,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(server = %inner.server_name, error = %error, "child stdout read failed");
                    break;
                }
            }
        }

        {
            let mut state = inner.state.write().await;
            if *state != SessionState::Terminated {
                *state = SessionState::Draining;
            }
        }
        fail_all_pending(
            &inner,
            ChildSessionError::StreamClosed {
                server: inner.server_name.clone(),
            },
        )
        .await;
    })
}

async fn dispatch_line(inner: &Arc<Inner>, line: &str) {
    let Ok(message) = serde_json::from_str::<Value>(line) else {
        tracing::warn!(server = %inner.server_name, line, "malformed JSON-RPC line from child");
        return;
    };

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        // Notification from the child — nothing to correlate.
        return;
    };

    let Some(sender) = inner.pending.lock().await.remove(&id) else {
        return;
    };

    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let _ = sender.send(Err(ChildSessionError::RpcError {
            server: inner.server_name.clone(),
            code,
            message: text,
        }));
        return;
    }

    let result = message.get("result").cloned().unwrap_or(Value::Null);
    let _ = sender.send(Ok(result));
}

async fn fail_all_pending(inner: &Arc<Inner>, error: ChildSessionError) {
    let mut pending = inner.pending.lock().await;
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(clone_error(&error)));
    }
}

fn clone_error(error: &ChildSessionError) -> ChildSessionError {
    match error {
        ChildSessionError::StreamClosed { server } => ChildSessionError::StreamClosed {
            server: server.clone(),
        },
        ChildSessionError::NotConnected { server } => ChildSessionError::NotConnected {
            server: server.clone(),
        },
        ChildSessionError::SpawnFailed { server, .. } => ChildSessionError::StreamClosed {
            server: server.clone(),
        },
        ChildSessionError::InitializeTimeout { server } => ChildSessionError::InitializeTimeout {
            server: server.clone(),
        },
        ChildSessionError::InitializeRejected { server, reason } => {
            ChildSessionError::InitializeRejected {
                server: server.clone(),
                reason: reason.clone(),
            }
        }
        ChildSessionError::RpcError {
            server,
            code,
            message,
        } => ChildSessionError::RpcError {
            server: server.clone(),
            code: *code,
            message: message.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_stub(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("stub-mcp.sh");
        fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*) ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn start_list_call_close_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let script = write_stub(temp.path());
        let spec = ServerSpec {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            env: HashMap::new(),
        };

        let session = ChildSession::start("stub", &spec, Duration::from_secs(5))
            .await
            .expect("handshake succeeds");

        let tools = session.list_tools().await.expect("tools/list succeeds");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let content = session
            .call_tool("echo", Some(json!({"value": "ping"})))
            .await
            .expect("tools/call succeeds");
        assert_eq!(content[0].kind, "text");
        assert_eq!(content[0].text.as_deref(), Some("pong"));

        session.close().await;
        session.close().await; // idempotent
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_error() {
        let spec = ServerSpec {
            command: "/definitely/not/a/real/binary".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        let result = ChildSession::start("broken", &spec, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ChildSessionError::SpawnFailed { .. })));
    }
}
