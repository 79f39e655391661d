//! Stdio backend transport: spawns the configured command as a child
//! process and speaks MCP over its stdin/stdout.

use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::transport::{map_call_tool_result, with_timeout, Transport, ToolCallResult};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Tool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::ServiceExt;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL when tearing down a child's
/// process group.
const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct StdioTransport {
    service: RwLock<Option<RunningService<RoleClient, ()>>>,
    timeout: Duration,
    #[cfg(unix)]
    pid: Option<i32>,
}

impl StdioTransport {
    pub async fn connect(config: &BackendConfig) -> Result<Self, TransportError> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| TransportError::ConnectFailed("stdio backend missing command".into()))?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        cmd.envs(&config.env);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            // New process group so `close()` can SIGTERM the whole tree
            // (the child may itself spawn children, e.g. `npx`).
            unsafe {
                use std::os::unix::process::CommandExt;
                cmd.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| TransportError::ConnectFailed(format!("spawn failed: {e}")))?;

        #[cfg(unix)]
        let pid = transport.id().map(|id| id as i32);

        let service = ().serve(transport).await.map_err(|e| {
            TransportError::ConnectFailed(format!("handshake failed: {e}"))
        })?;

        Ok(Self {
            service: RwLock::new(Some(service)),
            timeout: config.timeout,
            #[cfg(unix)]
            pid,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        with_timeout(self.timeout, async {
            let guard = self.service.read().await;
            let service = guard.as_ref().ok_or(TransportError::Closed)?;
            Ok(service
                .peer()
                .list_tools(Default::default())
                .await
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
                .tools)
        })
        .await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<ToolCallResult, TransportError> {
        with_timeout(self.timeout, async {
            let guard = self.service.read().await;
            let service = guard.as_ref().ok_or(TransportError::Closed)?;
            let arguments = arguments.and_then(|v| v.as_object().cloned());
            let result = service
                .peer()
                .call_tool(CallToolRequestParam {
                    name: name.to_string().into(),
                    arguments,
                })
                .await
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
            Ok(map_call_tool_result(result))
        })
        .await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        with_timeout(self.timeout, async {
            let guard = self.service.read().await;
            let service = guard.as_ref().ok_or(TransportError::Closed)?;
            service
                .peer()
                .list_tools(Default::default())
                .await
                .map(|_| ())
                .map_err(|e| TransportError::ProtocolError(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // Negative pid addresses the whole process group the pre_exec
            // setpgid above created, so a grandchild (e.g. spawned by
            // `npx`) is reached too.
            let ret = unsafe { libc::kill(-pid, libc::SIGTERM) };
            if ret == 0 {
                debug!(pid, "sent SIGTERM to stdio backend process group");
                tokio::time::sleep(KILL_GRACE).await;
                let still_alive = unsafe { libc::kill(pid, 0) } == 0;
                if still_alive {
                    warn!(pid, "process group still alive after grace period, sending SIGKILL");
                    unsafe {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                }
            } else {
                warn!(pid, "failed to signal stdio backend process group");
            }
        }

        let service = self.service.write().await.take();
        if let Some(service) = service {
            let _ = service.cancel().await;
            debug!("stdio backend service cancelled");
        }
        Ok(())
    }
}
