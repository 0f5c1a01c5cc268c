//! Structured controller commands.
//!
//! A [`RemoteCommand`] is a program plus a discrete argument list. It is only
//! turned into a shell line at the transport boundary, and then every token
//! is quoted, so user supplied values never get interpreted by the remote
//! shell.

use serde::Serialize;
use std::fmt;

use crate::db::enums::CloudProvider;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Payload written to the remote process' stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Renders the command as one remote shell line with every token quoted.
    ///
    /// `binary_dir` prefixes `axiom-*` programs when the controller does not
    /// have them on its `PATH`.
    pub fn to_shell_line(&self, binary_dir: Option<&str>) -> String {
        let program = match binary_dir {
            Some(dir) if self.program.starts_with("axiom-") => {
                format!("{}/{}", dir.trim_end_matches('/'), self.program)
            }
            _ => self.program.clone(),
        };
        let mut line = shell_quote(&program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_line(None))
    }
}

/// POSIX single-quote escaping. Plain tokens are left bare for readable logs.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ',' | ':' | '=' | '@')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Checks identifiers that also end up inside instance names or file paths.
pub fn validate_identifier(field: &str, value: &str, max_len: usize) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= max_len
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !value.starts_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(format!(
            "{field} must be 1-{max_len} characters of [A-Za-z0-9._-] and must not start with '-' or '.', got {value:?}"
        )))
    }
}

/// Fleet names become instance name prefixes, so they are stricter.
pub fn validate_fleet_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 24
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(OrchestratorError::Validation(format!(
            "Fleet name must be 1-24 characters of [a-z0-9-] starting with a letter, got {name:?}"
        )));
    }
    if looks_like_remote_prefix(name) {
        return Err(OrchestratorError::Validation(format!(
            "Fleet name {name:?} must not end in '-' followed by 8 hex digits"
        )));
    }
    Ok(())
}

/// Remote prefixes are `<name>-<8 hex>`; a name of that shape would read as
/// another fleet's prefix on the controller.
fn looks_like_remote_prefix(name: &str) -> bool {
    name.rsplit_once('-').is_some_and(|(head, tail)| {
        !head.is_empty() && tail.len() == 8 && tail.chars().all(|c| c.is_ascii_hexdigit())
    })
}

/// The controller's command vocabulary.
pub struct ControllerCommand;

impl ControllerCommand {
    pub fn list_instances() -> RemoteCommand {
        RemoteCommand::new("axiom-ls")
    }

    pub fn deploy_fleet(
        prefix: &str,
        count: u32,
        regions: &[String],
        provider: CloudProvider,
        instance_type: &str,
    ) -> RemoteCommand {
        RemoteCommand::new("axiom-fleet")
            .arg(prefix)
            .args(["-i".to_string(), count.to_string()])
            .args(["-r".to_string(), regions.join(",")])
            .args(["--provider".to_string(), provider.to_string()])
            .args(["--size", instance_type])
    }

    pub fn add_instances(prefix: &str, count: u32) -> RemoteCommand {
        RemoteCommand::new("axiom-fleet")
            .arg(prefix)
            .args(["--add".to_string(), count.to_string()])
    }

    pub fn remove_instances(prefix: &str, count: u32) -> RemoteCommand {
        RemoteCommand::new("axiom-fleet")
            .arg(prefix)
            .args(["--remove".to_string(), count.to_string()])
    }

    pub fn install_module(prefix: &str, module: &str) -> RemoteCommand {
        RemoteCommand::new("axiom-fleet").arg(prefix).args(["-m", module])
    }

    /// Deletes exactly one instance. Callers resolve the fleet's members
    /// from the inventory first; no glob ever reaches the controller.
    pub fn delete_instance(name: &str) -> RemoteCommand {
        RemoteCommand::new("axiom-rm").args([name, "-f"])
    }

    pub fn exec_on_instance(instance: &str, command: &str) -> RemoteCommand {
        RemoteCommand::new("axiom-exec")
            .args(["--instance", instance, "--"])
            .arg(command)
    }

    pub fn make_dir(path: &str) -> RemoteCommand {
        RemoteCommand::new("mkdir").args(["-p", path])
    }

    pub fn write_file(path: &str, contents: String) -> RemoteCommand {
        RemoteCommand::new("tee").arg(path).stdin(contents)
    }

    pub fn scan(
        targets_file: &str,
        tool: &str,
        instance: Option<&str>,
        rate_limit: u32,
        output_file: &str,
    ) -> RemoteCommand {
        let mut cmd = RemoteCommand::new("axiom-scan")
            .arg(targets_file)
            .args(["-m", tool]);
        if let Some(instance) = instance {
            cmd = cmd.args(["--instance", instance]);
        }
        cmd.args(["--rate-limit".to_string(), rate_limit.to_string()])
            .args(["-o", output_file])
    }

    pub fn stop_tool(instance: &str, tool: &str) -> RemoteCommand {
        Self::exec_on_instance(instance, &format!("pkill -f {}", shell_quote(tool)))
    }

    /// Kills controller-side processes whose command line contains `pattern`.
    pub fn stop_local(pattern: &str) -> RemoteCommand {
        RemoteCommand::new("pkill").args(["-f", pattern])
    }
}
