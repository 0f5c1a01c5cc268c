//! In-process stand-in for the provisioning controller.
//!
//! Understands the same command vocabulary as the real controller, keeps an
//! instance inventory in memory and records every command it receives. Used
//! by the test suites and by `controller.simulated = true` for local runs.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ControllerEndpoint, RemoteCommand, RemoteSession, SessionFactory};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
struct SimInstance {
    primary_ip: String,
    region: String,
    size: String,
    status: String,
}

#[derive(Default)]
struct State {
    instances: BTreeMap<String, SimInstance>,
    files: HashMap<String, String>,
    modules: Vec<(String, String)>,
    log: Vec<String>,
    fail_connect: bool,
    failing_programs: HashMap<String, (i32, String)>,
    failing_instances: HashSet<String>,
    latency: Duration,
    open_sessions: usize,
    next_ip: u32,
}

/// Shared handle; clones observe the same controller.
#[derive(Clone, Default)]
pub struct SimulatedController {
    state: Arc<Mutex<State>>,
}

type Outcome = std::result::Result<String, (i32, String)>;

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint() -> ControllerEndpoint {
        ControllerEndpoint {
            host: "controller.simulated".to_string(),
            port: 22,
            user: "axiom".to_string(),
            key_path: "/dev/null".into(),
            known_hosts_path: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the rest of the suite.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Makes every invocation of `program` exit with `exit_status`.
    pub fn fail_program(&self, program: &str, exit_status: i32, stderr: &str) {
        self.state()
            .failing_programs
            .insert(program.to_string(), (exit_status, stderr.to_string()));
    }

    /// Makes commands targeting `instance` fail.
    pub fn fail_instance(&self, instance: &str) {
        self.state().failing_instances.insert(instance.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_connect = false;
        state.failing_programs.clear();
        state.failing_instances.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Adds an instance behind the orchestrator's back.
    pub fn insert_instance(&self, name: &str, region: &str) {
        let mut state = self.state();
        let ip = state.allocate_ip();
        state.instances.insert(
            name.to_string(),
            SimInstance {
                primary_ip: ip,
                region: region.to_string(),
                size: "s-1vcpu-1gb".to_string(),
                status: "active".to_string(),
            },
        );
    }

    /// Destroys an instance behind the orchestrator's back.
    pub fn remove_instance(&self, name: &str) -> bool {
        self.state().instances.remove(name).is_some()
    }

    pub fn set_instance_status(&self, name: &str, status: &str) {
        if let Some(instance) = self.state().instances.get_mut(name) {
            instance.status = status.to_string();
        }
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.state().instances.keys().cloned().collect()
    }

    pub fn installed_modules(&self) -> Vec<(String, String)> {
        self.state().modules.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    /// Every command received so far, rendered as shell lines.
    pub fn commands(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn count_commands(&self, program: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|line| line.split(' ').next() == Some(program))
            .count()
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    fn handle(&self, command: &RemoteCommand) -> Outcome {
        let mut state = self.state();
        state.log.push(command.to_shell_line(None));

        if let Some(failure) = state.failing_programs.get(&command.program) {
            return Err(failure.clone());
        }

        let args = &command.args;
        match command.program.as_str() {
            "axiom-ls" => Ok(state.render_listing()),
            "axiom-fleet" => state.fleet(args),
            "axiom-rm" => {
                let name = args.first().map(String::as_str).unwrap_or_default();
                if name.contains('*') {
                    return Err((2, format!("{name}: refusing wildcard delete")));
                }
                match state.instances.remove(name) {
                    Some(_) => Ok(format!("Deleted {name}\n")),
                    None => Ok(format!("{name}: already gone\n")),
                }
            }
            "pkill" => Ok(String::new()),
            "axiom-exec" => {
                let instance = flag_value(args, "--instance").unwrap_or_default();
                state.check_instance(instance)?;
                let cmd = args
                    .iter()
                    .skip_while(|a| a.as_str() != "--")
                    .skip(1)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok(format!("[{instance}] {cmd}\n"))
            }
            "mkdir" => Ok(String::new()),
            "tee" => {
                let path = args.first().cloned().unwrap_or_default();
                let contents = command.stdin.clone().unwrap_or_default();
                state.files.insert(path, contents.clone());
                Ok(contents)
            }
            "axiom-scan" => state.scan(args),
            other => Err((127, format!("{other}: command not found"))),
        }
    }
}

impl State {
    fn allocate_ip(&mut self) -> String {
        self.next_ip += 1;
        format!("203.0.113.{}", self.next_ip % 250 + 1)
    }

    fn render_listing(&self) -> String {
        let mut out = String::from("Instance            Primary Ip      Backend Ip   Region  Type          Status   $/M\n");
        for (name, instance) in &self.instances {
            out.push_str(&format!(
                "{name}  {}  10.0.0.1  {}  {}  {}  5\n",
                instance.primary_ip, instance.region, instance.size, instance.status
            ));
        }
        out.push_str("_______________________________________________________________\n");
        out.push_str(&format!("Total Instances: {}\n", self.instances.len()));
        out
    }

    fn members(&self, prefix: &str) -> Vec<String> {
        self.instances
            .keys()
            .filter(|name| super::inventory::belongs_to_fleet(name, prefix))
            .cloned()
            .collect()
    }

    fn spawn(&mut self, prefix: &str, count: u32, regions: &[String], size: &str) {
        let mut next = self
            .members(prefix)
            .iter()
            .filter_map(|name| name[prefix.len()..].parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        for i in 0..count {
            next += 1;
            let region = regions
                .get(i as usize % regions.len().max(1))
                .cloned()
                .unwrap_or_else(|| "nyc1".to_string());
            let ip = self.allocate_ip();
            self.instances.insert(
                format!("{prefix}{next:02}"),
                SimInstance {
                    primary_ip: ip,
                    region,
                    size: size.to_string(),
                    status: "active".to_string(),
                },
            );
        }
    }

    fn fleet(&mut self, args: &[String]) -> Outcome {
        let prefix = args.first().cloned().unwrap_or_default();
        if let Some(module) = flag_value(args, "-m") {
            self.modules.push((prefix, module.to_string()));
            return Ok(format!("Installed {module}\n"));
        }
        if let Some(count) = flag_value(args, "--add").and_then(|v| v.parse::<u32>().ok()) {
            let (regions, size) = match self.members(&prefix).first().and_then(|n| self.instances.get(n)) {
                Some(existing) => (vec![existing.region.clone()], existing.size.clone()),
                None => (Vec::new(), "s-1vcpu-1gb".to_string()),
            };
            self.spawn(&prefix, count, &regions, &size);
            return Ok(format!("Added {count} instances to {prefix}\n"));
        }
        if let Some(count) = flag_value(args, "--remove").and_then(|v| v.parse::<usize>().ok()) {
            let members = self.members(&prefix);
            if members.len() < count {
                return Err((1, format!("{prefix} has only {} instances", members.len())));
            }
            for name in members.iter().rev().take(count) {
                self.instances.remove(name);
            }
            return Ok(format!("Removed {count} instances from {prefix}\n"));
        }
        let count = flag_value(args, "-i")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| (2, "usage: axiom-fleet <name> -i <count>".to_string()))?;
        let regions: Vec<String> = flag_value(args, "-r")
            .map(|r| r.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        let size = flag_value(args, "--size").unwrap_or("s-1vcpu-1gb").to_string();
        self.spawn(&prefix, count, &regions, &size);
        Ok(format!("Fleet {prefix} initialized with {count} instances\n"))
    }

    fn check_instance(&self, instance: &str) -> std::result::Result<(), (i32, String)> {
        if self.failing_instances.contains(instance) {
            return Err((1, format!("{instance}: connection reset")));
        }
        if !self.instances.contains_key(instance) {
            return Err((1, format!("{instance}: no such instance")));
        }
        Ok(())
    }

    fn scan(&mut self, args: &[String]) -> Outcome {
        let targets_file = args.first().cloned().unwrap_or_default();
        let tool = flag_value(args, "-m").unwrap_or_default().to_string();
        let instance = flag_value(args, "--instance").map(str::to_string);
        if let Some(instance) = &instance {
            self.check_instance(instance)?;
        }
        let targets = self
            .files
            .get(&targets_file)
            .cloned()
            .ok_or_else(|| (2, format!("{targets_file}: no such file")))?;

        let mut out = String::new();
        for target in targets.lines().filter(|l| !l.trim().is_empty()) {
            let line = json!({ "target": target, "tool": tool, "status": "ok" });
            out.push_str(&line.to_string());
            out.push('\n');
        }
        if let Some(output_file) = flag_value(args, "-o") {
            self.files.insert(output_file.to_string(), out.clone());
        }
        Ok(out)
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub struct SimulatedSession {
    controller: SimulatedController,
    connected: bool,
}

#[async_trait]
impl RemoteSession for SimulatedSession {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let mut state = self.controller.state();
        if state.fail_connect {
            return Err(OrchestratorError::Connection(
                "controller.simulated: connection refused".to_string(),
            ));
        }
        state.open_sessions += 1;
        self.connected = true;
        Ok(())
    }

    async fn execute(&mut self, command: &RemoteCommand) -> Result<String> {
        if !self.connected {
            return Err(OrchestratorError::Connection("session is not connected".to_string()));
        }
        let latency = self.controller.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.controller
            .handle(command)
            .map_err(|(exit_status, stderr)| OrchestratorError::Execution {
                command: command.to_shell_line(None),
                exit_status,
                stderr,
            })
    }

    async fn close(&mut self) {
        if self.connected {
            self.connected = false;
            let mut state = self.controller.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

impl SessionFactory for SimulatedController {
    fn open(&self, _endpoint: &ControllerEndpoint) -> Box<dyn RemoteSession> {
        Box::new(SimulatedSession {
            controller: self.clone(),
            connected: false,
        })
    }
}
