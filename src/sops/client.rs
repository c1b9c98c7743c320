//! SOPS client
//!
//! Decrypts single values by running `sops decrypt --extract` against a
//! remote keyservice. The local keyservice is disabled so no key material
//! ever has to be present on this machine.

use crate::config::SopsConfig;
use crate::error::{DecryptError, Result};
use crate::sops::keyservice::KeyserviceAddr;
use crate::sops::{structure, Decryptor};
use crate::tree::{KeyPath, SecretTree};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// sops exit status: the data key could not be retrieved
const EXIT_COULD_NOT_RETRIEVE_KEY: i32 = 128;

/// sops exit status: MAC verification failed
const EXIT_MAC_MISMATCH: i32 = 51;

/// sops exit status: malformed `--extract` path
const EXIT_INVALID_TREE_PATH: i32 = 91;

/// Longest stderr excerpt carried in an error
const STDERR_EXCERPT_LEN: usize = 200;

struct FailurePatterns {
    denied: Regex,
    key_unavailable: Regex,
    path_not_found: Regex,
}

fn failure_patterns() -> &'static FailurePatterns {
    static PATTERNS: OnceLock<FailurePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| FailurePatterns {
        denied: Regex::new(
            r"(?i)access ?denied|permission denied|unauthori[sz]ed|forbidden|mac mismatch",
        )
        .expect("static regex"),
        key_unavailable: Regex::new(
            r"(?i)failed to get the data key|could not (retrieve|decrypt) (the )?data key|no keyservice|connection refused|error while dialing",
        )
        .expect("static regex"),
        path_not_found: Regex::new(r"(?i)component .* not found|not found in tree|key .* not found")
            .expect("static regex"),
    })
}

/// Client running the sops binary against a remote keyservice
pub struct SopsClient {
    binary: PathBuf,
    keyservice: KeyserviceAddr,
    runtime: Handle,
}

impl SopsClient {
    /// Create a new client.
    ///
    /// `runtime` drives the sops child processes when called from the
    /// filesystem threads, which are not runtime workers.
    pub fn new(config: &SopsConfig, runtime: Handle) -> Result<Self> {
        let keyservice = KeyserviceAddr::parse(&config.keyservice)?;
        info!(
            "Using {} with keyservice at {}",
            config.binary.display(),
            keyservice
        );

        Ok(SopsClient {
            binary: config.binary.clone(),
            keyservice,
            runtime,
        })
    }

    /// Configured keyservice
    pub fn keyservice(&self) -> &KeyserviceAddr {
        &self.keyservice
    }

    /// Decrypt the value at `key_path`, giving up after `timeout`.
    ///
    /// The child process is killed if the timeout expires.
    pub async fn decrypt(
        &self,
        source: &Path,
        key_path: &KeyPath,
        timeout: Duration,
    ) -> std::result::Result<String, DecryptError> {
        let extract = extract_expression(key_path);
        debug!(
            "Running: {} decrypt --keyservice {} --extract {} {}",
            self.binary.display(),
            self.keyservice,
            extract,
            source.display()
        );

        let mut command = Command::new(&self.binary);
        command
            .arg("decrypt")
            .arg("--enable-local-keyservice=false")
            .arg("--keyservice")
            .arg(self.keyservice.uri())
            .arg("--extract")
            .arg(&extract)
            .arg(source)
            .env("SOPS_KEYSERVICE", self.keyservice.uri())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DecryptError::Failed(format!(
                    "failed to run {}: {}",
                    self.binary.display(),
                    e
                )))
            }
            Err(_) => return Err(DecryptError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(output.status.code(), &stderr));
        }

        let value = String::from_utf8(output.stdout)
            .map_err(|_| DecryptError::Failed("sops produced non-UTF-8 output".to_string()))?;
        let value = strip_line_terminator(value);

        info!(
            "Decrypted {} ({} bytes) in {}ms",
            key_path,
            value.len(),
            started.elapsed().as_millis()
        );
        Ok(value)
    }
}

impl Decryptor for SopsClient {
    fn load_structure(&self, source: &Path) -> Result<SecretTree> {
        structure::load_structure_file(source)
    }

    fn decrypt_leaf(
        &self,
        source: &Path,
        key_path: &KeyPath,
        timeout: Duration,
    ) -> std::result::Result<String, DecryptError> {
        self.runtime.block_on(self.decrypt(source, key_path, timeout))
    }
}

/// Build the `--extract` expression for a key path, e.g. `["a"]["b"]`
pub fn extract_expression(key_path: &KeyPath) -> String {
    key_path
        .segments()
        .iter()
        .map(|segment| {
            let escaped = segment.replace('\\', "\\\\").replace('"', "\\\"");
            format!("[\"{}\"]", escaped)
        })
        .collect()
}

/// Map a failed sops run to a decrypt error
fn classify_failure(code: Option<i32>, stderr: &str) -> DecryptError {
    let patterns = failure_patterns();
    let excerpt = stderr_excerpt(stderr);
    warn!("sops exited with status {:?}: {}", code, excerpt);

    if code == Some(EXIT_MAC_MISMATCH) || patterns.denied.is_match(stderr) {
        DecryptError::Denied(excerpt)
    } else if code == Some(EXIT_COULD_NOT_RETRIEVE_KEY) || patterns.key_unavailable.is_match(stderr)
    {
        DecryptError::KeyUnavailable(excerpt)
    } else if code == Some(EXIT_INVALID_TREE_PATH) || patterns.path_not_found.is_match(stderr) {
        DecryptError::PathNotFound(excerpt)
    } else {
        DecryptError::Failed(match code {
            Some(code) => format!("exit status {}: {}", code, excerpt),
            None => format!("terminated by signal: {}", excerpt),
        })
    }
}

/// First non-empty stderr line, bounded in length
fn stderr_excerpt(stderr: &str) -> String {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output");
    line.chars().take(STDERR_EXCERPT_LEN).collect()
}

/// Drop the line terminator sops appends, keeping the value otherwise intact
fn strip_line_terminator(mut value: String) -> String {
    if value.ends_with('\n') {
        value.pop();
        if value.ends_with('\r') {
            value.pop();
        }
    }
    value
}
