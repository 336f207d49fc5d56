//! Shell environment sourcing
//!
//! An application's worker environment is built by sourcing shell scripts
//! (`.powrc`, `.powenv`, `.rvmrc`) and capturing the environment they leave
//! behind. [`source`] seeds a `/bin/sh` subprocess with a base environment,
//! sources the script, then dumps the resulting environment to stdout behind
//! a marker line. The parsed map fully replaces the base environment, so
//! variables a script unsets are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Marker separating script output from the environment dump.
const ENV_MARKER: &str = "\n__RACKWAY_ENV__\n";

/// Environment variable pointing the shell at the script to source.
const SCRIPT_VAR: &str = "RACKWAY_SOURCE_SCRIPT";

/// An environment script exited non-zero.
///
/// Carries the captured output so boot failures can be rendered with the
/// script's own diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("environment script {} exited with status {status}", .script.display())]
pub struct ScriptError {
    /// The script that was being sourced.
    pub script: PathBuf,
    /// The shell's exit status (-1 if killed by a signal).
    pub status: i32,
    /// Everything the script wrote to stdout.
    pub stdout: String,
    /// Everything the script wrote to stderr.
    pub stderr: String,
}

/// Failure to source an environment script.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The shell could not be spawned or driven.
    #[error("failed to run shell for {}: {message}", .script.display())]
    Shell { script: PathBuf, message: String },

    /// The shell exited zero but never printed the environment marker.
    #[error("no environment dump from {}", .script.display())]
    MissingEnvelope { script: PathBuf },
}

/// Source `script` in a shell seeded with `base`, returning the resulting
/// environment.
///
/// `before` is an optional snippet executed ahead of the source line (used to
/// load rvm before `.rvmrc`). A non-zero exit from the script aborts the
/// shell and surfaces as [`ScriptError`].
pub async fn source(
    script: &Path,
    base: &HashMap<String, String>,
    before: Option<&str>,
) -> Result<HashMap<String, String>, SourceError> {
    let shell_err = |e: std::io::Error| SourceError::Shell {
        script: script.to_path_buf(),
        message: e.to_string(),
    };

    let mut child = Command::new("/bin/sh")
        .env_clear()
        .envs(base)
        .env(SCRIPT_VAR, script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(shell_err)?;

    let mut program = String::new();
    if let Some(snippet) = before {
        program.push_str(snippet);
        program.push('\n');
    }
    program.push_str(". \"$RACKWAY_SOURCE_SCRIPT\" || exit $?\n");
    program.push_str("printf '\\n__RACKWAY_ENV__\\n'\n");
    program.push_str("env\n");

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(program.as_bytes()).await.map_err(shell_err)?;
        // Dropping stdin closes the pipe so the shell sees EOF.
    }

    let output = child.wait_with_output().await.map_err(shell_err)?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ScriptError {
            script: script.to_path_buf(),
            status: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        }
        .into());
    }

    let dump_at = stdout
        .rfind(ENV_MARKER)
        .ok_or_else(|| SourceError::MissingEnvelope {
            script: script.to_path_buf(),
        })?;

    let mut env = parse_env_dump(&stdout[dump_at + ENV_MARKER.len()..]);
    env.remove(SCRIPT_VAR);
    debug!(script = %script.display(), vars = env.len(), "Sourced environment script");
    Ok(env)
}

/// Parse `env` output into a map.
///
/// Lines without a valid `NAME=` prefix are continuations of the previous
/// variable's value, so multi-line values survive.
fn parse_env_dump(dump: &str) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;

    let mut lines: Vec<&str> = dump.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    for line in lines {
        if let Some((name, value)) = line.split_once('=') {
            if is_env_name(name) {
                env.insert(name.to_string(), value.to_string());
                current = Some(name.to_string());
                continue;
            }
        }
        if let Some(name) = &current {
            if let Some(value) = env.get_mut(name) {
                value.push('\n');
                value.push_str(line);
            }
        }
    }

    env
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
