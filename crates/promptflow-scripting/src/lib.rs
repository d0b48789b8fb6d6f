//! Script side of the promptflow execution tools boundary.
//!
//! Script tasks are never interpreted here: a [`ScriptExecutionTools`]
//! implementation hands the source to an external runtime.
//! [`ProcessScriptTools`] runs it through a local interpreter binary.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use promptflow_types::{PromptflowError, Result};

// ---------------------------------------------------------------------------
// ScriptRequest
// ---------------------------------------------------------------------------

/// One script invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRequest {
    /// Language tag from the code fence, lower-case.
    pub language: String,
    pub script: String,
    /// Parameter values, exposed to the script as environment variables.
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// ScriptExecutionTools
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ScriptExecutionTools: Send + Sync {
    fn title(&self) -> &str;

    /// Whether `language` can be run by these tools.
    fn supports(&self, language: &str) -> bool;

    /// Run the script and return what it printed, without the trailing newline.
    async fn execute(&self, request: &ScriptRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// ProcessScriptTools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: String,
    /// Flag that makes the program read the script from the next argument.
    pub inline_flag: String,
}

impl Interpreter {
    pub fn new(program: impl Into<String>, inline_flag: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            inline_flag: inline_flag.into(),
        }
    }
}

/// Runs scripts through interpreter binaries on the local machine.
pub struct ProcessScriptTools {
    working_dir: PathBuf,
    default_timeout: Duration,
    interpreters: HashMap<String, Interpreter>,
}

impl ProcessScriptTools {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let mut interpreters = HashMap::new();
        for tag in ["sh", "bash", "shell"] {
            interpreters.insert(tag.to_string(), Interpreter::new("bash", "-c"));
        }
        for tag in ["python", "py", "python3"] {
            interpreters.insert(tag.to_string(), Interpreter::new("python3", "-c"));
        }
        for tag in ["javascript", "js", "node"] {
            interpreters.insert(tag.to_string(), Interpreter::new("node", "-e"));
        }
        Self {
            working_dir: working_dir.into(),
            default_timeout: Duration::from_secs(30),
            interpreters,
        }
    }

    pub fn current_dir() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register or replace the interpreter for a language tag.
    pub fn with_interpreter(mut self, language: impl Into<String>, interpreter: Interpreter) -> Self {
        self.interpreters
            .insert(language.into().to_ascii_lowercase(), interpreter);
        self
    }

    /// Environment for the child: the parent's variables minus obvious
    /// secrets, plus the script parameters.
    fn child_env(parameters: &BTreeMap<String, String>) -> HashMap<String, String> {
        let exclude_suffixes: &[&str] = &["_api_key", "_secret", "_token", "_password"];
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| {
                let lower = key.to_lowercase();
                !exclude_suffixes.iter().any(|s| lower.ends_with(s))
            })
            .collect();
        env.extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

#[async_trait]
impl ScriptExecutionTools for ProcessScriptTools {
    fn title(&self) -> &str {
        "Local interpreters"
    }

    fn supports(&self, language: &str) -> bool {
        self.interpreters.contains_key(&language.to_ascii_lowercase())
    }

    async fn execute(&self, request: &ScriptRequest) -> Result<String> {
        let language = request.language.to_ascii_lowercase();
        let interpreter = self.interpreters.get(&language).ok_or_else(|| {
            PromptflowError::EnvironmentMismatch(format!(
                "no interpreter configured for script language \"{}\"",
                request.language
            ))
        })?;

        let mut cmd = tokio::process::Command::new(&interpreter.program);
        cmd.arg(&interpreter.inline_flag)
            .arg(&request.script)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(Self::child_env(&request.parameters))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PromptflowError::EnvironmentMismatch(format!(
                    "interpreter \"{}\" for {} scripts is not installed",
                    interpreter.program, request.language
                ))
            } else {
                PromptflowError::Io(e)
            }
        })?;
        let pid = child.id();

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let start = tokio::time::Instant::now();
        tracing::debug!(language = %language, program = %interpreter.program, "Running script");

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let duration_ms = start.elapsed().as_millis() as u64;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                if output.status.success() {
                    tracing::debug!(language = %language, duration_ms, "Script finished");
                    Ok(stdout.strip_suffix('\n').unwrap_or(&stdout).to_string())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(PromptflowError::Tool {
                        tool: interpreter.program.clone(),
                        message: format!(
                            "exited with code {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ),
                        retryable: true,
                    })
                }
            }
            Err(_) => {
                // The child is killed on drop; take its process group with it.
                #[cfg(unix)]
                {
                    if let Some(pid) = pid {
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                }
                #[cfg(not(unix))]
                let _ = pid;
                Err(PromptflowError::Timeout {
                    tool: interpreter.program.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptflow_types::ErrorKind;
    use tempfile::TempDir;

    fn request(language: &str, script: &str) -> ScriptRequest {
        ScriptRequest {
            language: language.into(),
            script: script.into(),
            parameters: BTreeMap::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn runs_shell_with_parameters_as_env() {
        let dir = TempDir::new().unwrap();
        let tools = ProcessScriptTools::new(dir.path());
        let mut req = request("sh", "echo \"hello $name\"");
        req.parameters.insert("name".into(), "world".into());
        let out = tools.execute(&req).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found").unwrap();
        let tools = ProcessScriptTools::new(dir.path());
        let out = tools.execute(&request("bash", "cat marker.txt")).await.unwrap();
        assert_eq!(out, "found");
    }

    #[tokio::test]
    async fn nonzero_exit_is_retryable_tool_error() {
        let dir = TempDir::new().unwrap();
        let tools = ProcessScriptTools::new(dir.path());
        let err = tools
            .execute(&request("sh", "echo oops >&2; exit 3"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tool);
        assert!(err.is_attempt_failure());
        assert!(err.to_string().contains("exited with code 3"));
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn unknown_language_is_environment_mismatch() {
        let dir = TempDir::new().unwrap();
        let tools = ProcessScriptTools::new(dir.path());
        assert!(!tools.supports("cobol"));
        let err = tools.execute(&request("cobol", "DISPLAY 'x'")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentMismatch);
    }

    #[tokio::test]
    async fn missing_interpreter_binary_is_environment_mismatch() {
        let dir = TempDir::new().unwrap();
        let tools = ProcessScriptTools::new(dir.path())
            .with_interpreter("lua", Interpreter::new("definitely-not-an-interpreter-xyz", "-e"));
        assert!(tools.supports("LUA"));
        let err = tools.execute(&request("lua", "print(1)")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentMismatch);
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let dir = TempDir::new().unwrap();
        let tools = ProcessScriptTools::new(dir.path()).with_timeout(Duration::from_millis(100));
        let err = tools.execute(&request("sh", "sleep 10")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_attempt_failure());
    }
}
