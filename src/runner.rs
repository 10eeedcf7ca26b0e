use crate::error::{ProcessErrorDetails, ServError};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Runs short-lived external tools (`docker`, `keytool`, `tar`, `unzip`).
pub trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct RealRunner;

impl CommandRunner for RealRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        let output = cmd.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program));
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn spawn_error_details(program: &str, err: &io::Error, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        let tool = Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string());
        return ProcessErrorDetails {
            error_code: format!("{tool}_not_found"),
            hint: Some(format!("Install {tool} and ensure `{tool}` is on your PATH.")),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated")
        || lower.contains("bind: address already in use")
        || lower.contains("address already in use")
    {
        return (
            "docker_port_conflict".to_string(),
            Some(
                "A required host port is already in use. Free the port or set an explicit one with `servman config set port=<port>`."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "docker_name_conflict".to_string(),
            Some("A container with this name already exists. Run `servman stop` or `servman prune` and retry.".to_string()),
        );
    }

    if lower.contains("no such container") {
        return (
            "docker_container_missing".to_string(),
            Some("The container no longer exists; `servman prune` clears the stale record.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") || lower.contains("authentication") {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login <registry>` for private images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Run `program` and turn spawn errors and non-zero exits into
/// `ServError::ProcessDetailed`.
pub fn execute<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[String],
    cwd: &Path,
) -> Result<CommandOutput, ServError> {
    let command = render_command(program, args);
    debug!(command = %command, "running external command");
    let cmd_output = runner
        .run(program, args, cwd, &BTreeMap::new())
        .map_err(|err| ServError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details: spawn_error_details(program, &err, &command),
        })?;
    if cmd_output.success() {
        return Ok(cmd_output);
    }
    let stderr = String::from_utf8_lossy(&cmd_output.stderr).trim().to_string();
    let (error_code, hint) = if program == "docker" {
        classify_docker_failure(&stderr)
    } else {
        ("process_command_failed".to_string(), None)
    };
    let mut message = format!(
        "command failed with status {} while running `{}`",
        cmd_output.status_code, command
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    Err(ServError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
        },
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
    }

    #[derive(Default)]
    pub(crate) struct MockRunner {
        calls: RefCell<Vec<RecordedCall>>,
        outputs: RefCell<Vec<CommandOutput>>,
    }

    impl MockRunner {
        pub(crate) fn push_output(&self, output: CommandOutput) {
            self.outputs.borrow_mut().push(output);
        }

        pub(crate) fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _cwd: &Path,
            _env_overrides: &BTreeMap<String, String>,
        ) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
            });
            let mut queued = self.outputs.borrow_mut();
            if queued.is_empty() {
                return Ok(CommandOutput {
                    status_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }
            Ok(queued.remove(0))
        }
    }

    pub(crate) fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code: 1,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn render_command_quotes_whitespace() {
        let rendered = render_command("docker", &["run".into(), "a b".into(), "".into()]);
        assert_eq!(rendered, "docker run \"a b\" \"\"");
    }

    #[test]
    fn docker_failures_are_classified() {
        let runner = MockRunner::default();
        runner.push_output(failed(
            "docker: Error response from daemon: driver failed programming external connectivity: Bind for 0.0.0.0:8080 failed: port is already allocated.",
        ));
        let err = execute(&runner, "docker", &["run".to_string()], Path::new(".")).unwrap_err();
        let details = err.details().unwrap();
        assert_eq!(details.error_code, "docker_port_conflict");
        assert_eq!(details.command.as_deref(), Some("docker run"));
        assert!(err.to_string().contains("Hint:"));
    }

    #[test]
    fn daemon_unreachable_gets_setup_hint() {
        let (code, hint) =
            classify_docker_failure("Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?");
        assert_eq!(code, "docker_daemon_unreachable");
        assert!(hint.unwrap().contains("Start Docker"));
    }

    #[test]
    fn missing_program_is_reported_with_tool_name() {
        let err = execute(
            &RealRunner,
            "servman-definitely-missing-tool",
            &[],
            Path::new("."),
        )
        .unwrap_err();
        let details = err.details().unwrap();
        assert_eq!(details.error_code, "servman-definitely-missing-tool_not_found");
    }

    #[test]
    fn successful_output_passes_through() {
        let runner = MockRunner::default();
        runner.push_output(CommandOutput {
            status_code: 0,
            stdout: b"abc123\n".to_vec(),
            stderr: Vec::new(),
        });
        let out = execute(&runner, "docker", &["ps".to_string()], Path::new(".")).unwrap();
        assert_eq!(out.stdout_text(), "abc123");
        assert_eq!(runner.calls()[0].program, "docker");
    }
}
