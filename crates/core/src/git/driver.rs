//! Git CLI driver.
//!
//! Spawns the `git` binary as an isolated child process per operation and
//! captures a structured result. The driver never interprets remote-side
//! semantics (auth vs. not-found vs. network); that is the classifier's job.
//! It only reports exit status, bounded output, wall time, and parsed ref
//! update counts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::GitError;

/// Cap on captured stdout/stderr; beyond this, head and tail are kept.
const OUTPUT_CAP: usize = 8 * 1024;

/// Grace period between SIGTERM and SIGKILL on timeout or cancellation.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Timeout for quick local-only operations (rev-parse, remote get-url).
const LOCAL_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable names the askpass helper reads.
const ASKPASS_USER_VAR: &str = "GITMIRROR_ASKPASS_USERNAME";
const ASKPASS_PASS_VAR: &str = "GITMIRROR_ASKPASS_PASSWORD";

// ---------------------------------------------------------------------------
// Structured command result
// ---------------------------------------------------------------------------

/// Outcome of one git invocation.
#[derive(Debug, Clone)]
pub struct GitCmdResult {
    /// Process exit code; -1 when the process was killed.
    pub exit_code: i32,
    pub stdout: String,
    /// Captured stderr, bounded (head + tail when oversized). Partial output
    /// is still present after a timeout.
    pub stderr: String,
    pub wall_time: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Parsed ref-update count, where the operation reports one.
    pub refs_updated: u64,
}

impl GitCmdResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Driver for the `git` binary with scrubbed environment and timeouts.
pub struct GitDriver {
    /// Path to the ephemeral askpass helper, present when an upstream token
    /// is configured.
    askpass: Option<AskpassHelper>,
    /// Outbound proxy URL (credentials embedded) injected into every child.
    proxy_url: Option<String>,
}

impl GitDriver {
    /// Create a driver. When `upstream_token` is set, an askpass helper
    /// script is written under `helper_dir` so fetches can authenticate
    /// without embedding the token in the persisted origin URL. When
    /// `proxy_url` is set, it is handed to every git child through the
    /// standard proxy environment variables.
    pub fn new(
        upstream_token: Option<String>,
        helper_dir: &Path,
        proxy_url: Option<String>,
    ) -> Result<Self, GitError> {
        let askpass = match upstream_token {
            Some(token) => Some(AskpassHelper::create(helper_dir, token)?),
            None => None,
        };
        Ok(Self { askpass, proxy_url })
    }

    // -- Repository operations ----------------------------------------------

    /// `git clone --mirror <url> <dir>`.
    pub async fn clone_mirror(
        &self,
        url: &str,
        dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<GitCmdResult, GitError> {
        let dir_str = dir.to_string_lossy().to_string();
        self.run(None, &["clone", "--mirror", url, &dir_str], timeout, cancel, true)
            .await
    }

    /// `git fetch --prune origin '+refs/*:refs/*'`.
    pub async fn fetch_prune(
        &self,
        dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<GitCmdResult, GitError> {
        let mut result = self
            .run(
                Some(dir),
                &["fetch", "--prune", "origin", "+refs/*:refs/*"],
                timeout,
                cancel,
                true,
            )
            .await?;
        result.refs_updated = count_fetch_ref_updates(&result.stderr);
        Ok(result)
    }

    /// `git push --mirror <push_url>`. The URL may embed credentials; it is
    /// passed as a transient argument only and never written to the repo
    /// config.
    pub async fn push_mirror(
        &self,
        dir: &Path,
        push_url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<GitCmdResult, GitError> {
        let mut result = self
            .run(
                Some(dir),
                &["push", "--mirror", "--porcelain", push_url],
                timeout,
                cancel,
                false,
            )
            .await?;
        result.refs_updated = count_push_ref_updates(&result.stdout);
        Ok(result)
    }

    /// Check that `dir` holds a healthy bare repository.
    pub async fn sanity_check(&self, dir: &Path) -> Result<bool, GitError> {
        if !dir.is_dir() {
            return Ok(false);
        }
        let cancel = CancellationToken::new();
        let result = self
            .run(
                Some(dir),
                &["rev-parse", "--is-bare-repository"],
                LOCAL_OP_TIMEOUT,
                &cancel,
                false,
            )
            .await?;
        Ok(result.success() && result.stdout.trim() == "true")
    }

    /// Current `origin` fetch URL, if the remote is configured.
    pub async fn remote_url(&self, dir: &Path) -> Result<Option<String>, GitError> {
        let cancel = CancellationToken::new();
        let result = self
            .run(
                Some(dir),
                &["remote", "get-url", "origin"],
                LOCAL_OP_TIMEOUT,
                &cancel,
                false,
            )
            .await?;
        if result.success() {
            Ok(Some(result.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Delete a local clone. Missing directories are fine.
    pub async fn remove_clone(&self, dir: &Path) -> Result<(), GitError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GitError::Io(e)),
        }
    }

    // -- Process supervision -------------------------------------------------

    async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
        auth: bool,
    ) -> Result<GitCmdResult, GitError> {
        let mut cmd = Command::new("git");

        // HTTP tuning: keep slow links alive, large pushes unchunked, and
        // avoid HTTP/2 connection resets on large transfers.
        cmd.args([
            "-c",
            "http.postBuffer=524288000",
            "-c",
            "http.version=HTTP/1.1",
        ]);
        cmd.args(args);

        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        // Scrubbed environment: no ambient credentials reach the child.
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.env("GIT_HTTP_LOW_SPEED_LIMIT", "1000");
        cmd.env("GIT_HTTP_LOW_SPEED_TIME", "60");

        // env_clear wiped any ambient proxy settings; re-inject the
        // configured one under both spellings git's curl honors.
        if let Some(proxy) = &self.proxy_url {
            for key in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
                cmd.env(key, proxy);
            }
        }

        if auth {
            if let Some(askpass) = &self.askpass {
                cmd.env("GIT_ASKPASS", &askpass.script);
                cmd.env(ASKPASS_USER_VAR, "git");
                cmd.env(ASKPASS_PASS_VAR, &askpass.token);
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd = %format!("git {}", args.join(" ")), "running git command");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound("git".into())
            } else {
                GitError::Io(e)
            }
        })?;

        // Drain output concurrently so a chatty child cannot fill the pipe
        // and deadlock against our wait().
        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());

        let mut timed_out = false;
        let mut was_cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status.map_err(GitError::Io)?),
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                None
            }
            _ = cancel.cancelled() => {
                was_cancelled = true;
                None
            }
        };

        let status = match status {
            Some(status) => status,
            None => {
                warn!(
                    timed_out,
                    cancelled = was_cancelled,
                    "terminating git child process"
                );
                terminate(&mut child).await.map_err(GitError::Io)?
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(GitCmdResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: bound_output(&String::from_utf8_lossy(&stdout)),
            stderr: bound_output(&String::from_utf8_lossy(&stderr)),
            wall_time: started.elapsed(),
            timed_out,
            cancelled: was_cancelled,
            refs_updated: 0,
        })
    }
}

/// SIGTERM, wait a grace period, then SIGKILL. Returns the final status.
async fn terminate(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            child.kill().await?;
            child.wait().await
        }
    }
}

fn spawn_reader<R>(reader: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Keep head and tail of oversized output.
fn bound_output(text: &str) -> String {
    if text.len() <= OUTPUT_CAP {
        return text.to_string();
    }
    let half = OUTPUT_CAP / 2;
    let mut head_end = half;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n... [{} bytes truncated] ...\n{}",
        &text[..head_end],
        tail_start - head_end,
        &text[tail_start..]
    )
}

// ---------------------------------------------------------------------------
// Ref-update parsing
// ---------------------------------------------------------------------------

/// Count updated refs in `git push --porcelain` stdout.
///
/// Porcelain lines are `<flag>\t<from>:<to>\t<summary>`; `=` flags mean
/// up-to-date and are not counted.
pub fn count_push_ref_updates(stdout: &str) -> u64 {
    stdout
        .lines()
        .filter(|line| {
            let mut chars = line.chars();
            let flag = chars.next();
            matches!(flag, Some('*') | Some('+') | Some('-') | Some(' '))
                && chars.next() == Some('\t')
        })
        .count() as u64
}

/// Count updated refs in `git fetch` stderr ("a1b2c3..d4e5f6  main -> main",
/// "* [new branch] …", "- [deleted] …").
pub fn count_fetch_ref_updates(stderr: &str) -> u64 {
    stderr
        .lines()
        .map(str::trim_start)
        .filter(|line| line.contains(" -> ") || line.starts_with("- [deleted]"))
        .count() as u64
}

/// Best-effort recursive directory size in bytes.
pub fn dir_size_bytes(dir: &Path) -> u64 {
    fn walk(dir: &Path, total: &mut u64) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path: PathBuf = entry.path();
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => walk(&path, total),
                Ok(meta) => *total += meta.len(),
                Err(_) => {}
            }
        }
    }
    let mut total = 0;
    walk(dir, &mut total);
    total
}

// ---------------------------------------------------------------------------
// Askpass helper
// ---------------------------------------------------------------------------

/// Ephemeral credential helper script for upstream authentication.
///
/// Git invokes `$GIT_ASKPASS <prompt>`; the script answers the username and
/// password prompts from environment variables the driver injects per call,
/// so the token never appears in the repo config or the process argv.
struct AskpassHelper {
    script: PathBuf,
    token: String,
}

impl AskpassHelper {
    fn create(dir: &Path, token: String) -> Result<Self, GitError> {
        std::fs::create_dir_all(dir)?;
        let script = dir.join("askpass.sh");
        let body = format!(
            "#!/bin/sh\ncase \"$1\" in\n  Username*) printf '%s\\n' \"${ASKPASS_USER_VAR}\" ;;\n  *) printf '%s\\n' \"${ASKPASS_PASS_VAR}\" ;;\nesac\n",
        );
        std::fs::write(&script, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { script, token })
    }
}
