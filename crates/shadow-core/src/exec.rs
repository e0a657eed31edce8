//! Remote command execution inside running pods.
//!
//! [`ExecBridge`] sends a non-interactive [`ExecRequest`] through an
//! [`ExecTransport`], then normalises what came back: ANSI escape sequences
//! are stripped, surrounding whitespace trimmed, and stderr is scanned for a
//! failure reason embedded by the pod's tooling. A transport that reports
//! success does not mean the command succeeded - if stderr carries such a
//! reason the call fails with it.
//!
//! Recognised stderr failure markers, first match wins:
//!
//! - a JSON log line with `"level":"error"`, reason taken from its `error`
//!   field, falling back to `message`
//! - a line containing `error: '<reason>'`

use crate::error::{CoreError, Result};
use crate::store::{ExecRequest, ExecTransport};
use std::sync::Arc;
use std::time::Duration;

/// Exec configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecConfig {
    /// Abort commands that run longer than this. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// Cleaned output of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output, without colour codes or surrounding whitespace.
    pub stdout: String,
    /// Standard error, without colour codes or surrounding whitespace.
    pub stderr: String,
}

/// Runs commands in pod containers.
pub struct ExecBridge {
    transport: Arc<dyn ExecTransport>,
    config: ExecConfig,
}

impl ExecBridge {
    /// Create a bridge over the given transport.
    pub fn new(transport: Arc<dyn ExecTransport>, config: ExecConfig) -> Self {
        Self { transport, config }
    }

    /// Get the exec configuration.
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Run `command` in `container` of `pod` and return its cleaned output.
    ///
    /// # Errors
    ///
    /// [`CoreError::RemoteCommand`] when the transport fails, the command
    /// times out, or stderr carries a failure marker. The error holds the
    /// cleaned stdout and stderr.
    pub async fn exec<I, S>(&self, container: &str, pod: &str, namespace: &str, command: I) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = ExecRequest::capture(
            container,
            pod,
            namespace,
            command.into_iter().map(Into::into).collect(),
        );
        tracing::debug!(
            pod = %pod,
            container = %container,
            command = ?request.command,
            "Execute command"
        );

        let start = std::time::Instant::now();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let streamed = match self.config.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.transport.stream(&request, &mut stdout, &mut stderr)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::Store(format!("command timed out after {limit:?}"))),
                }
            }
            None => self.transport.stream(&request, &mut stdout, &mut stderr).await,
        };

        let output = ExecOutput {
            stdout: clean(&stdout),
            stderr: clean(&stderr),
        };
        let embedded = extract_error_message(&output.stderr);

        let message = match (streamed, embedded) {
            (Ok(()), None) => {
                tracing::debug!(
                    pod = %pod,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    stdout_len = output.stdout.len(),
                    stderr_len = output.stderr.len(),
                    "Command completed"
                );
                return Ok(output);
            }
            (_, Some(reason)) => reason,
            (Err(e), None) => match e {
                CoreError::Store(raw) => raw,
                other => other.to_string(),
            },
        };

        tracing::debug!(pod = %pod, error = %message, "Command failed");
        Err(CoreError::RemoteCommand {
            message,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn clean(raw: &[u8]) -> String {
    strip_ansi(&String::from_utf8_lossy(raw)).trim().to_string()
}

/// Remove ANSI escape sequences (CSI, OSC and two-byte escapes).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // CSI: parameters and intermediates up to a final byte in '@'..='~'
            Some('[') => {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ST (ESC \)
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) | None => {}
        }
    }
    out
}

/// Find a failure reason embedded in command stderr.
pub fn extract_error_message(stderr: &str) -> Option<String> {
    stderr.lines().find_map(|line| {
        let line = line.trim();
        json_error(line).or_else(|| quoted_error(line))
    })
}

fn json_error(line: &str) -> Option<String> {
    if !line.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("level")?.as_str()? != "error" {
        return None;
    }
    ["error", "message"]
        .iter()
        .filter_map(|field| value.get(*field).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn quoted_error(line: &str) -> Option<String> {
    const MARKER: &str = "error: '";
    let start = line.find(MARKER)? + MARKER.len();
    let rest = &line[start..];
    let end = rest.rfind('\'')?;
    let reason = rest[..end].trim();
    (!reason.is_empty()).then(|| reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeTransport {
        stdout: &'static str,
        stderr: &'static str,
        error: Option<&'static str>,
        requests: Mutex<Vec<ExecRequest>>,
    }

    impl FakeTransport {
        fn new(stdout: &'static str, stderr: &'static str, error: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                stdout,
                stderr,
                error,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ExecTransport for FakeTransport {
        async fn stream(&self, request: &ExecRequest, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            stdout.extend_from_slice(self.stdout.as_bytes());
            stderr.extend_from_slice(self.stderr.as_bytes());
            match self.error {
                Some(e) => Err(CoreError::Store(e.to_string())),
                None => Ok(()),
            }
        }
    }

    struct HangingTransport;

    #[async_trait]
    impl ExecTransport for HangingTransport {
        async fn stream(&self, _request: &ExecRequest, stdout: &mut Vec<u8>, _stderr: &mut Vec<u8>) -> Result<()> {
            stdout.extend_from_slice(b"started\n");
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[32mok\u{1b}[0m"), "ok");
        assert_eq!(strip_ansi("\u{1b}[1;31mred\u{1b}[39;49m text"), "red text");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}body"), "body");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{1b}\\body"), "body");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_extract_quoted_error() {
        assert_eq!(
            extract_error_message("starting\nfailed, error: 'port 8080 already in use'\n"),
            Some("port 8080 already in use".to_string())
        );
        assert_eq!(extract_error_message("error: ''"), None);
        assert_eq!(extract_error_message("warning: nothing"), None);
    }

    #[test]
    fn test_extract_json_error() {
        let stderr = r#"{"level":"info","message":"boot"}
{"level":"error","error":"dial tcp: refused","message":"Failed to connect"}"#;
        assert_eq!(extract_error_message(stderr), Some("dial tcp: refused".to_string()));
        assert_eq!(
            extract_error_message(r#"{"level":"error","message":"bad config"}"#),
            Some("bad config".to_string())
        );
        assert_eq!(extract_error_message(r#"{"level":"warn","message":"slow"}"#), None);
    }

    #[tokio::test]
    async fn test_exec_success_cleans_output() {
        let transport = FakeTransport::new("\u{1b}[32m  hello \u{1b}[0m\n", "\n", None);
        let bridge = ExecBridge::new(transport.clone(), ExecConfig::default());

        let output = bridge.exec("main", "pod-a", "ns", ["echo", "hello"]).await.unwrap();

        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "");
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0], ExecRequest::capture("main", "pod-a", "ns", vec!["echo".into(), "hello".into()]));
    }

    #[tokio::test]
    async fn test_exec_embedded_error_with_transport_success() {
        let transport = FakeTransport::new(
            "partial\n",
            "\u{1b}[31m  failed, error: 'no route to host'  \u{1b}[0m\n",
            None,
        );
        let bridge = ExecBridge::new(transport, ExecConfig::default());

        let err = bridge.exec("main", "pod-a", "ns", ["connect"]).await.unwrap_err();

        match err {
            CoreError::RemoteCommand { message, stdout, stderr } => {
                assert_eq!(message, "no route to host");
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "failed, error: 'no route to host'");
            }
            other => panic!("expected RemoteCommand, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_transport_error_without_marker() {
        let transport = FakeTransport::new("", "", Some("command terminated with exit code 2"));
        let bridge = ExecBridge::new(transport, ExecConfig::default());

        let err = bridge.exec("main", "pod-a", "ns", ["false"]).await.unwrap_err();
        assert_eq!(err.to_string(), "command terminated with exit code 2");
    }

    #[tokio::test]
    async fn test_exec_transport_error_prefers_marker() {
        let transport = FakeTransport::new("", "error: 'disk full'", Some("exit code 1"));
        let bridge = ExecBridge::new(transport, ExecConfig::default());

        let err = bridge.exec("main", "pod-a", "ns", ["write"]).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_timeout_keeps_partial_output() {
        let bridge = ExecBridge::new(
            Arc::new(HangingTransport),
            ExecConfig {
                timeout: Some(Duration::from_secs(5)),
            },
        );

        let err = bridge.exec("main", "pod-a", "ns", ["sleep", "infinity"]).await.unwrap_err();
        match err {
            CoreError::RemoteCommand { message, stdout, .. } => {
                assert_eq!(message, "command timed out after 5s");
                assert_eq!(stdout, "started");
            }
            other => panic!("expected RemoteCommand, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_sub_second_timeout_message() {
        let bridge = ExecBridge::new(
            Arc::new(HangingTransport),
            ExecConfig {
                timeout: Some(Duration::from_millis(250)),
            },
        );

        let err = bridge.exec("main", "pod-a", "ns", ["sleep", "1"]).await.unwrap_err();
        assert_eq!(err.to_string(), "command timed out after 250ms");
    }
}
