//! Command execution gateway: runs the beans binary and maps its failures to
//! domain errors. Requests flow dedup -> retry -> subprocess.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::Settings;
use crate::dedup::{fingerprint, InFlight};
use crate::error::{BeansError, Result};
use crate::retry::{with_retry, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

static ERROR_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*Error:\s*(.+?)\s*$").unwrap());

/// Executes one invocation of the external binary and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<String>;
}

/// Runs the real binary as a child process, arguments passed as an array.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: String,
    workdir: PathBuf,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => BeansError::NotFound {
                    binary: self.binary.clone(),
                },
                _ => BeansError::Spawn(err.to_string()),
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| BeansError::Spawn("stdout not captured".into()))?;
        let mut stderr = child.stderr.take().ok_or_else(|| BeansError::Spawn("stderr not captured".into()))?;

        let work = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            tokio::try_join!(
                async {
                    (&mut stdout)
                        .take(MAX_OUTPUT_BYTES as u64 + 1)
                        .read_to_end(&mut out)
                        .await?;
                    if out.len() > MAX_OUTPUT_BYTES {
                        return Err(BeansError::OutputTooLarge {
                            limit: MAX_OUTPUT_BYTES,
                        });
                    }
                    Ok::<_, BeansError>(())
                },
                async {
                    (&mut stderr)
                        .take(MAX_OUTPUT_BYTES as u64)
                        .read_to_end(&mut err)
                        .await?;
                    Ok::<_, BeansError>(())
                }
            )?;
            let status = child.wait().await?;
            Ok::<_, BeansError>((status, out, err))
        };

        // Dropping `work` on timeout drops the child, which kills it.
        let (status, out, err) = tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| BeansError::Timeout { after: timeout })??;

        let stdout = String::from_utf8_lossy(&out).into_owned();
        if status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&err);
        Err(command_failure(&stderr, &stdout, status.code()))
    }
}

/// Map a non-zero exit to an error. An "Error: ..." line means beans itself
/// refused the request, which a retry will not change.
pub fn command_failure(stderr: &str, stdout: &str, code: Option<i32>) -> BeansError {
    match reported_error(stderr, stdout) {
        Some(message) => BeansError::Rejected(message),
        None => BeansError::Command {
            message: clean_error_message(stderr, stdout, code),
        },
    }
}

fn reported_error(stderr: &str, stdout: &str) -> Option<String> {
    ERROR_LINE
        .captures(stderr)
        .or_else(|| ERROR_LINE.captures(stdout))
        .map(|caps| caps[1].to_string())
}

/// Reduce failing-process output to the "Error: ..." line when one exists.
pub fn clean_error_message(stderr: &str, stdout: &str, code: Option<i32>) -> String {
    if let Some(message) = reported_error(stderr, stdout) {
        return message;
    }
    let detail = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("no diagnostic output");
    match code {
        Some(code) => format!("exited with status {code}: {detail}"),
        None => format!("terminated by signal: {detail}"),
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub path: Option<Vec<Value>>,
}

impl GraphQlError {
    /// First path segment, i.e. the field or alias the error belongs to.
    pub fn root_field(&self) -> Option<&str> {
        self.path.as_ref()?.first()?.as_str()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    /// Collapse backend-reported errors into one, otherwise return `data`.
    pub fn into_data(self) -> Result<Value> {
        if !self.errors.is_empty() {
            return Err(BeansError::Backend(join_messages(&self.errors)));
        }
        Ok(self.data.unwrap_or(Value::Null))
    }
}

pub fn join_messages(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Entry point for every backend call the service makes.
#[derive(Clone)]
pub struct Gateway {
    runner: Arc<dyn CommandRunner>,
    inflight: InFlight,
    timeout: Duration,
    probe_timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
}

impl Gateway {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            inflight: InFlight::new(),
            timeout: COMMAND_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn from_settings(runner: Arc<dyn CommandRunner>, settings: &Settings) -> Self {
        Self {
            timeout: settings.command_timeout(),
            probe_timeout: settings.probe_timeout(),
            max_retries: settings.retry.max_retries,
            base_delay: settings.base_delay(),
            ..Self::new(runner)
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    /// Run a subcommand and return its stdout.
    #[instrument(skip_all)]
    pub async fn exec_text(&self, args: Vec<String>) -> Result<String> {
        let key = fingerprint(&args);
        debug!(fingerprint = %key, "beans request");
        let runner = self.runner.clone();
        let (timeout, max_retries, base_delay) = (self.timeout, self.max_retries, self.base_delay);
        self.inflight
            .run(key, move || async move {
                with_retry(max_retries, base_delay, || runner.run(&args, timeout)).await
            })
            .await
    }

    /// Run a subcommand whose stdout is JSON.
    pub async fn exec_json<T: DeserializeOwned>(&self, args: Vec<String>) -> Result<T> {
        let raw = self.exec_text(args).await?;
        serde_json::from_str(&raw).map_err(|err| BeansError::parse(err.to_string(), raw))
    }

    /// Send a GraphQL document with its variables.
    pub async fn exec_graphql(&self, query: &str, variables: &Value) -> Result<GraphQlResponse> {
        let args = vec![
            "query".to_string(),
            "--json".to_string(),
            query.to_string(),
            "--variables".to_string(),
            variables.to_string(),
        ];
        self.exec_json(args).await
    }

    /// Availability probe with the short timeout; bypasses retry and dedup.
    pub async fn probe(&self) -> Result<String> {
        let out = self
            .runner
            .run(&["version".to_string()], self.probe_timeout)
            .await?;
        Ok(out.trim().to_string())
    }
}
