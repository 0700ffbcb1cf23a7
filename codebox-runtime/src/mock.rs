//! Recording runtime for tests.

use crate::error::{Result, RuntimeError};
use crate::{
    ContainerHandle, ContainerRuntime, ExecOptions, ExecOutput, RuntimeSpec, VolumeInfo,
};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One call made against the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateAndStart(RuntimeSpec),
    Exec {
        container: String,
        command: Vec<String>,
        detached: bool,
    },
    CopyFile {
        container: String,
        dest: PathBuf,
        len: usize,
    },
    ListUsedHostPorts,
    Stop(String),
    Remove(String),
    RemoveByName(String),
    RemoveProject(String),
    ListVolumes,
    RemoveVolume(String),
}

#[derive(Default)]
struct State {
    calls: Vec<MockCall>,
    used_ports: BTreeSet<u16>,
    volumes: Vec<VolumeInfo>,
    failures: HashMap<&'static str, String>,
    /// Engine-level container names in use, with the id of the started
    /// container. `None` for containers created by a start that failed.
    names: BTreeMap<String, Option<String>>,
}

/// In-memory [`ContainerRuntime`] that records every call.
///
/// Containers come up on `127.0.0.1` so tests can run real upstream servers
/// behind the registered address. Like the engine, a single container start
/// that fails leaves its container name taken until it is removed by name.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<State>,
    next_id: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports reported as already taken by other containers.
    pub fn with_used_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.with_state(|s| s.used_ports.extend(ports));
        self
    }

    pub fn with_volumes(self, volumes: impl IntoIterator<Item = VolumeInfo>) -> Self {
        self.with_state(|s| s.volumes.extend(volumes));
        self
    }

    /// Makes every later call of `operation` fail, e.g. `"create_and_start"`.
    pub fn fail_on(&self, operation: &'static str, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| {
            s.failures.insert(operation, message);
        });
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| s.failures.clear());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).count())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn record(&self, operation: &'static str, call: MockCall) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(call);
            match s.failures.get(operation) {
                Some(message) => Err(RuntimeError::CommandFailed {
                    command: format!("mock {operation}"),
                    stderr: message.clone(),
                }),
                None => Ok(()),
            }
        })
    }

    fn handle(&self, name: &str, agent_port: u16) -> ContainerHandle {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        ContainerHandle {
            id: format!("mock-{n}"),
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            agent_port,
        }
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_and_start(&self, spec: &RuntimeSpec) -> Result<Vec<ContainerHandle>> {
        let outcome = self.record("create_and_start", MockCall::CreateAndStart(spec.clone()));
        if let RuntimeSpec::Container(c) = spec {
            let claimed = self.with_state(|s| match s.names.entry(c.name.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(None);
                    true
                }
            });
            if !claimed {
                return Err(RuntimeError::CommandFailed {
                    command: "mock create_and_start".to_string(),
                    stderr: format!(
                        "Conflict. The container name \"/{}\" is already in use",
                        c.name
                    ),
                });
            }
        }
        outcome?;

        let handles: Vec<ContainerHandle> = match spec {
            RuntimeSpec::Container(c) => vec![self.handle(&c.logical_name, c.agent_host_port)],
            RuntimeSpec::Compose(c) => c
                .agent_ports
                .iter()
                .map(|(service, port)| self.handle(service, *port))
                .collect(),
        };
        self.with_state(|s| {
            s.used_ports.extend(handles.iter().map(|h| h.agent_port));
            match spec {
                RuntimeSpec::Container(c) => {
                    s.names
                        .insert(c.name.clone(), handles.first().map(|h| h.id.clone()));
                }
                RuntimeSpec::Compose(c) => s.volumes.push(VolumeInfo {
                    name: format!("{}_data", c.project),
                    compose_project: Some(c.project.clone()),
                }),
            }
        });
        Ok(handles)
    }

    fn exec(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        options: &ExecOptions,
    ) -> Result<ExecOutput> {
        self.record(
            "exec",
            MockCall::Exec {
                container: handle.id.clone(),
                command: command.to_vec(),
                detached: options.detached,
            },
        )?;
        if options.detached {
            return Ok(ExecOutput::default());
        }
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn copy_file(&self, handle: &ContainerHandle, dest: &Path, content: &[u8]) -> Result<()> {
        self.record(
            "copy_file",
            MockCall::CopyFile {
                container: handle.id.clone(),
                dest: dest.to_path_buf(),
                len: content.len(),
            },
        )
    }

    fn list_used_host_ports(&self) -> Result<BTreeSet<u16>> {
        self.record("list_used_host_ports", MockCall::ListUsedHostPorts)?;
        Ok(self.with_state(|s| s.used_ports.clone()))
    }

    fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("stop", MockCall::Stop(handle.id.clone()))
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("remove", MockCall::Remove(handle.id.clone()))?;
        self.with_state(|s| {
            s.used_ports.remove(&handle.agent_port);
            s.names.retain(|_, id| id.as_deref() != Some(handle.id.as_str()));
        });
        Ok(())
    }

    fn remove_by_name(&self, name: &str) -> Result<()> {
        self.record("remove_by_name", MockCall::RemoveByName(name.to_string()))?;
        match self.with_state(|s| s.names.remove(name)) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(format!("No such container: {name}"))),
        }
    }

    fn remove_project(&self, project: &str) -> Result<()> {
        self.record("remove_project", MockCall::RemoveProject(project.to_string()))
    }

    fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.record("list_volumes", MockCall::ListVolumes)?;
        Ok(self.with_state(|s| s.volumes.clone()))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.record("remove_volume", MockCall::RemoveVolume(name.to_string()))?;
        self.with_state(|s| s.volumes.retain(|v| v.name != name));
        Ok(())
    }
}

/// Volume as `docker volume ls` reports it for a compose project.
pub fn compose_volume(name: &str, project: &str) -> VolumeInfo {
    VolumeInfo {
        name: name.to_string(),
        compose_project: Some(project.to_string()),
    }
}
