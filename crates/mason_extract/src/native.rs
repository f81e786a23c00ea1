//! The native tool invoker. The engine shells out to two external binaries
//! (the archive tool and the installer-payload tool) through this interface;
//! the compatibility-layer implementation differs only in how it launches
//! the binary and pre-translates paths.

use std::process::Stdio;

use async_trait::async_trait;
use mason_core::{AbsolutePath, CancelToken, Cancelled};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;

pub struct ToolRequest {
    pub binary: AbsolutePath,
    pub args: Vec<String>,
    pub working_dir: Option<AbsolutePath>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait NativeTool: Send + Sync {
    /// Translates an absolute host path into the form the tool expects.
    /// Must be injective and invertible by the tool.
    fn translate(&self, path: &AbsolutePath) -> String;

    /// Runs the tool, feeding each stdout line to `on_line`. Returns the
    /// exit code; cancellation kills the process tree.
    async fn run(
        &self,
        request: ToolRequest,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        token: &CancelToken,
    ) -> Result<i32>;
}

/// Runs binaries directly on the host.
pub struct HostTool;

#[async_trait]
impl NativeTool for HostTool {
    fn translate(&self, path: &AbsolutePath) -> String {
        path.as_str().to_string()
    }

    async fn run(
        &self,
        request: ToolRequest,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        token: &CancelToken,
    ) -> Result<i32> {
        let mut command = Command::new(request.binary.as_std());
        command
            .args(&request.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir.as_std());
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        debug!("running native tool: {:?}", command);
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => on_line(&line),
                        None => break,
                    }
                },
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    return Err(Cancelled.into());
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                let _ = child.kill().await;
                return Err(Cancelled.into());
            }
        };
        Ok(status.code().unwrap_or(-1))
    }
}

/// Runs foreign-host binaries through a compatibility runner. Paths are
/// translated to drive-letter form; the runner is expected to invert the
/// mapping.
pub struct CompatTool {
    runner: AbsolutePath,
    drive: char,
}

impl CompatTool {
    pub fn new(runner: AbsolutePath, drive: char) -> Self {
        Self { runner, drive }
    }
}

#[async_trait]
impl NativeTool for CompatTool {
    fn translate(&self, path: &AbsolutePath) -> String {
        format!("{}:{}", self.drive, path.as_str().replace('/', "\\"))
    }

    async fn run(
        &self,
        request: ToolRequest,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        token: &CancelToken,
    ) -> Result<i32> {
        let mut args = Vec::with_capacity(request.args.len() + 1);
        args.push(request.binary.as_str().to_string());
        args.extend(request.args);
        HostTool
            .run(
                ToolRequest {
                    binary: self.runner.clone(),
                    args,
                    working_dir: request.working_dir,
                    env: request.env,
                },
                on_line,
                token,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(path: &str) -> AbsolutePath {
        AbsolutePath::new(camino::Utf8PathBuf::from(path)).unwrap()
    }

    #[test]
    fn host_translate_is_identity() {
        assert_eq!(HostTool.translate(&abs("/downloads/a.7z")), "/downloads/a.7z");
    }

    #[test]
    fn compat_translate_maps_to_drive_letters() {
        let tool = CompatTool::new(abs("/usr/bin/compat-runner"), 'Z');
        assert_eq!(
            tool.translate(&abs("/downloads/a.7z")),
            r"Z:\downloads\a.7z"
        );
        // Injective: distinct inputs stay distinct.
        assert_ne!(
            tool.translate(&abs("/a/b")),
            tool.translate(&abs("/a/c"))
        );
    }

    #[tokio::test]
    async fn host_tool_captures_stdout_and_exit_code() {
        let token = CancelToken::never();
        let mut lines = Vec::new();
        let code = HostTool
            .run(
                ToolRequest {
                    binary: abs("/bin/sh"),
                    args: vec!["-c".into(), "echo 10%; echo 100%; exit 3".into()],
                    working_dir: None,
                    env: vec![],
                },
                &mut |line| lines.push(line.to_string()),
                &token,
            )
            .await
            .unwrap();

        assert_eq!(code, 3);
        assert_eq!(lines, vec!["10%", "100%"]);
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let (handle, token) = CancelToken::new();
        let run = tokio::spawn(async move {
            HostTool
                .run(
                    ToolRequest {
                        binary: abs("/bin/sh"),
                        args: vec!["-c".into(), "sleep 30".into()],
                        working_dir: None,
                        env: vec![],
                    },
                    &mut |_| {},
                    &token,
                )
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.cancel();
        let result = run.await.unwrap();
        assert!(matches!(
            result,
            Err(crate::error::ExtractError::Cancelled(_))
        ));
    }
}
