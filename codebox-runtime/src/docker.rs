//! [`ContainerRuntime`] on top of the docker CLI.

use crate::command::DockerCommand;
use crate::error::{Result, RuntimeError};
use crate::{
    ComposeSpec, ContainerHandle, ContainerRuntime, ContainerSpec, ExecOptions, ExecOutput,
    ImageSpec, RuntimeSpec, VolumeInfo, AGENT_CONTAINER_PORT, COMPOSE_PROJECT_LABEL,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Keeps an image without its own long running command alive and lets it
/// exit cleanly on SIGTERM.
const KEEPALIVE_SCRIPT: &str = "trap 'exit 0' TERM; while sleep 1000 & wait $!; do :; done";

fn published_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "0.0.0.0:50000->55088/tcp", ":::8000-8002->8000-8002/tcp"
    RE.get_or_init(|| Regex::new(r":(\d+)(?:-(\d+))?->").unwrap_or_else(|_| unreachable!()))
}

/// Extracts published host ports from `docker ps --format {{.Ports}}` output.
pub(crate) fn parse_published_ports(output: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for caps in published_port_re().captures_iter(output) {
        let Some(start) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) else {
            continue;
        };
        let end = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(start);
        ports.extend(start..=end);
    }
    ports
}

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    program: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    /// Talks to a docker compatible CLI other than `docker`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn cmd(&self) -> DockerCommand {
        DockerCommand::with_program(&self.program)
    }

    /// Address of the container on its first attached network.
    fn container_address(&self, id: &str) -> Result<String> {
        let output = self
            .cmd()
            .subcommand("inspect")
            .arg("--format")
            .arg("{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}")
            .arg(id)
            .execute_with_output()?;

        output
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| {
                RuntimeError::UnexpectedOutput(format!("container {id} has no network address"))
            })
    }

    fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let image = match &spec.image {
            ImageSpec::Pull(image) => image.clone(),
            ImageSpec::Build {
                dockerfile,
                context,
                tag,
            } => {
                info!(%tag, "building workspace image");
                self.cmd()
                    .subcommand("build")
                    .arg("-t")
                    .arg(tag)
                    .arg("-f")
                    .arg(dockerfile.display().to_string())
                    .arg(context.display().to_string())
                    .execute()?;
                tag.clone()
            }
        };

        let mut cmd = self
            .cmd()
            .subcommand("run")
            .arg("-d")
            .arg("--name")
            .arg(&spec.name)
            .arg("--publish")
            .arg(format!("{}:{AGENT_CONTAINER_PORT}", spec.agent_host_port))
            .arg("--mount")
            .arg(format!(
                "source={},target={},type=volume",
                spec.workspace_volume, spec.workspace_folder
            ));
        for (key, value) in &spec.labels {
            cmd = cmd.arg("--label").arg(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            cmd = cmd.arg("--env").arg(format!("{key}={value}"));
        }

        let id = cmd
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg(image)
            .arg("-c")
            .arg(KEEPALIVE_SCRIPT)
            .execute_with_output()?
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(RuntimeError::UnexpectedOutput(
                "docker run returned no container id".to_string(),
            ));
        }

        let address = self.container_address(&id)?;
        info!(container = %spec.name, %id, %address, "container started");
        Ok(ContainerHandle {
            id,
            name: spec.logical_name.clone(),
            address,
            agent_port: spec.agent_host_port,
        })
    }

    fn start_compose(&self, spec: &ComposeSpec) -> Result<Vec<ContainerHandle>> {
        let file = spec.file.display().to_string();
        self.cmd()
            .subcommand("compose")
            .args(["-p", spec.project.as_str(), "-f", file.as_str()])
            .args(["up", "-d", "--build"])
            .execute()?;

        let listing = self
            .cmd()
            .subcommand("ps")
            .arg("-a")
            .arg("--filter")
            .arg(format!("label={COMPOSE_PROJECT_LABEL}={}", spec.project))
            .arg("--format")
            .arg("{{.ID}}\t{{.Label \"com.docker.compose.service\"}}")
            .execute_with_output()?;

        let mut handles = Vec::new();
        for line in listing.lines().filter(|l| !l.trim().is_empty()) {
            let (id, service) = line.split_once('\t').ok_or_else(|| {
                RuntimeError::UnexpectedOutput(format!("cannot parse container listing '{line}'"))
            })?;
            let agent_port = *spec.agent_ports.get(service).ok_or_else(|| {
                RuntimeError::UnexpectedOutput(format!(
                    "container {id} belongs to unknown service '{service}'"
                ))
            })?;
            handles.push(ContainerHandle {
                id: id.to_string(),
                name: service.to_string(),
                address: self.container_address(id)?,
                agent_port,
            });
        }

        if handles.is_empty() {
            return Err(RuntimeError::UnexpectedOutput(format!(
                "compose project {} started no containers",
                spec.project
            )));
        }
        info!(project = %spec.project, containers = handles.len(), "compose stack started");
        Ok(handles)
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn create_and_start(&self, spec: &RuntimeSpec) -> Result<Vec<ContainerHandle>> {
        match spec {
            RuntimeSpec::Container(spec) => Ok(vec![self.start_container(spec)?]),
            RuntimeSpec::Compose(spec) => self.start_compose(spec),
        }
    }

    fn exec(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        options: &ExecOptions,
    ) -> Result<ExecOutput> {
        let mut cmd = self.cmd().subcommand("exec");
        if options.detached {
            cmd = cmd.arg("-d");
        }
        cmd = cmd
            .opt("-w", options.working_dir.as_deref())
            .opt("-u", options.user.as_deref());
        for (key, value) in &options.env {
            cmd = cmd.arg("-e").arg(format!("{key}={value}"));
        }
        let cmd = cmd.arg(&handle.id).args(command.iter().cloned());

        if options.detached {
            cmd.execute()?;
            return Ok(ExecOutput::default());
        }

        let output = cmd.execute_raw()?;
        let result = ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(container = %handle.id, exit_code = ?result.exit_code, "exec finished");
        Ok(result)
    }

    fn copy_file(&self, handle: &ContainerHandle, dest: &Path, content: &[u8]) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(content)?;
        staged.flush()?;

        self.cmd()
            .subcommand("cp")
            .arg(staged.path().display().to_string())
            .arg(format!("{}:{}", handle.id, dest.display()))
            .execute()
    }

    fn list_used_host_ports(&self) -> Result<BTreeSet<u16>> {
        let output = self
            .cmd()
            .subcommand("ps")
            .arg("-a")
            .arg("--format")
            .arg("{{.Ports}}")
            .execute_with_output()?;
        Ok(parse_published_ports(&output))
    }

    fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.cmd().subcommand("stop").arg(&handle.id).execute()
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.cmd()
            .subcommand("rm")
            .arg("-f")
            .arg(&handle.id)
            .execute()
    }

    fn remove_by_name(&self, name: &str) -> Result<()> {
        self.cmd().subcommand("rm").arg("-f").arg(name).execute()
    }

    fn remove_project(&self, project: &str) -> Result<()> {
        self.cmd()
            .subcommand("compose")
            .args(["-p", project, "down", "--remove-orphans"])
            .execute()
    }

    fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let output = self
            .cmd()
            .subcommand("volume")
            .arg("ls")
            .arg("--format")
            .arg(format!("{{{{.Name}}}}\t{{{{.Label \"{COMPOSE_PROJECT_LABEL}\"}}}}"))
            .execute_with_output()?;

        Ok(output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let (name, project) = line.split_once('\t').unwrap_or((line, ""));
                VolumeInfo {
                    name: name.trim().to_string(),
                    compose_project: Some(project.trim())
                        .filter(|p| !p.is_empty())
                        .map(str::to_string),
                }
            })
            .collect())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.cmd()
            .subcommand("volume")
            .arg("rm")
            .arg("-f")
            .arg(name)
            .execute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_published_ports() {
        let output = "\
0.0.0.0:50000->55088/tcp, :::50000->55088/tcp
5432/tcp

0.0.0.0:8000-8002->8000-8002/tcp
127.0.0.1:50001->55088/tcp
";
        let ports = parse_published_ports(output);
        assert_eq!(
            ports,
            BTreeSet::from([8000, 8001, 8002, 50000, 50001])
        );
    }

    #[test]
    fn test_parse_published_ports_empty() {
        assert!(parse_published_ports("").is_empty());
        assert!(parse_published_ports("80/tcp, 443/tcp").is_empty());
    }

    #[test]
    fn test_project_teardown_runs_compose_down() {
        // `false` always fails, so the error carries the full command line.
        let runtime = DockerRuntime::with_program("false");
        let err = runtime.remove_project("codebox_workspace_3").unwrap_err();
        match err {
            RuntimeError::CommandFailed { command, .. } => assert_eq!(
                command,
                "false compose -p codebox_workspace_3 down --remove-orphans"
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exec_runs_through_cli() {
        // `echo` stands in for the engine CLI and prints the arguments back.
        let runtime = DockerRuntime::with_program("echo");
        let handle = ContainerHandle {
            id: "abc123".to_string(),
            name: "development".to_string(),
            address: "172.17.0.2".to_string(),
            agent_port: 50000,
        };
        let output = runtime
            .exec(
                &handle,
                &["ls".to_string(), "-la".to_string()],
                &ExecOptions {
                    working_dir: Some("/opt".to_string()),
                    user: Some("root".to_string()),
                    env: vec![("A".to_string(), "1".to_string())],
                    detached: false,
                },
            )
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "exec -w /opt -u root -e A=1 abc123 ls -la");
    }
}
