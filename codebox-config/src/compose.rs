//! Docker compose document handling.
//!
//! The document is kept as a generic YAML mapping: only the parts the engine
//! rewrites (volumes, ports, labels) are interpreted, everything else is
//! written back untouched.

use crate::error::ConfigParseError;
use serde_yaml_ng::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ComposeDocument {
    path: PathBuf,
    root: Mapping,
}

/// How a compose stack is adjusted before it is brought up for a workspace.
#[derive(Debug, Clone, Default)]
pub struct ComposeRewrite {
    /// Source of the volume currently backing the workspace folder, as
    /// returned by [`ComposeDocument::workspace_volume`]. Empty means none.
    pub workspace_volume_source: String,
    /// Per-workspace volume that replaces it.
    pub replacement_volume: String,
    /// Host port published for the agent of each service.
    pub agent_ports: BTreeMap<String, u16>,
    pub agent_container_port: u16,
    pub labels: Vec<(String, String)>,
}

/// One entry of a service's `volumes` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub mode: Option<String>,
}

impl VolumeMount {
    /// Parses the short `source:target[:mode]` syntax. Anonymous volumes
    /// (a bare container path) have no source and yield `None`.
    pub fn parse_short(spec: &str) -> Option<Self> {
        let mut parts = spec.splitn(3, ':');
        let source = parts.next()?;
        let target = parts.next()?;
        Some(Self {
            source: source.to_string(),
            target: target.to_string(),
            mode: parts.next().map(str::to_string),
        })
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(spec) => Self::parse_short(spec),
            Value::Mapping(long) => {
                let source = long.get("source")?.as_str()?;
                let target = long.get("target")?.as_str()?;
                let mode = long
                    .get("read_only")
                    .and_then(Value::as_bool)
                    .filter(|ro| *ro)
                    .map(|_| "ro".to_string());
                Some(Self {
                    source: source.to_string(),
                    target: target.to_string(),
                    mode,
                })
            }
            _ => None,
        }
    }
}

impl ComposeDocument {
    pub fn load(path: &Path) -> Result<Self, ConfigParseError> {
        if !path.is_file() {
            return Err(ConfigParseError::MissingComposeFile(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigParseError::syntax(path, format!("cannot read file: {e}")))?;

        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigParseError> {
        let value: Value =
            serde_yaml_ng::from_str(content).map_err(|e| ConfigParseError::syntax(path, e))?;

        match value {
            Value::Mapping(root) => Ok(Self {
                path: path.to_path_buf(),
                root,
            }),
            _ => Err(ConfigParseError::syntax(
                path,
                "top level of a compose document must be a mapping",
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn services(&self) -> Result<&Mapping, ConfigParseError> {
        self.root
            .get("services")
            .ok_or_else(|| ConfigParseError::syntax(&self.path, "missing 'services' key"))?
            .as_mapping()
            .ok_or_else(|| ConfigParseError::syntax(&self.path, "'services' must be a mapping"))
    }

    pub fn service_names(&self) -> Result<Vec<String>, ConfigParseError> {
        Ok(self
            .services()?
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect())
    }

    fn service(&self, name: &str) -> Result<&Mapping, ConfigParseError> {
        self.services()?
            .get(name)
            .ok_or_else(|| ConfigParseError::UnknownService(name.to_string()))?
            .as_mapping()
            .ok_or_else(|| {
                ConfigParseError::syntax(&self.path, format!("service '{name}' must be a mapping"))
            })
    }

    pub fn volume_mounts(&self, service: &str) -> Result<Vec<VolumeMount>, ConfigParseError> {
        let Some(volumes) = self.service(service)?.get("volumes") else {
            return Ok(Vec::new());
        };

        let list = volumes.as_sequence().ok_or_else(|| {
            ConfigParseError::syntax(
                &self.path,
                format!("volumes of service '{service}' must be a list"),
            )
        })?;

        Ok(list.iter().filter_map(VolumeMount::from_value).collect())
    }

    /// Finds the volume mounted at `workspace_path` in `service`.
    ///
    /// Returns an empty string when the service has no such mount.
    pub fn workspace_volume(
        &self,
        service: &str,
        workspace_path: &str,
    ) -> Result<String, ConfigParseError> {
        Ok(self
            .volume_mounts(service)?
            .into_iter()
            .find(|mount| mount.target == workspace_path)
            .map(|mount| mount.source)
            .unwrap_or_default())
    }

    pub fn rewrite(&mut self, plan: &ComposeRewrite) -> Result<(), ConfigParseError> {
        let path = self.path.clone();
        let services = self
            .root
            .get_mut("services")
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| ConfigParseError::syntax(&path, "missing 'services' key"))?;

        for (name, definition) in services.iter_mut() {
            let name = name.as_str().unwrap_or_default().to_string();
            let definition = definition.as_mapping_mut().ok_or_else(|| {
                ConfigParseError::syntax(&path, format!("service '{name}' must be a mapping"))
            })?;

            if !plan.workspace_volume_source.is_empty() {
                if let Some(Value::Sequence(volumes)) = definition.get_mut("volumes") {
                    for volume in volumes.iter_mut() {
                        replace_volume_source(
                            volume,
                            &plan.workspace_volume_source,
                            &plan.replacement_volume,
                        );
                    }
                }
            }

            if let Some(agent_port) = plan.agent_ports.get(&name) {
                definition.insert(
                    Value::from("ports"),
                    Value::Sequence(vec![Value::from(format!(
                        "{agent_port}:{}",
                        plan.agent_container_port
                    ))]),
                );
            }

            let labels = definition
                .entry(Value::from("labels"))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            for (key, value) in &plan.labels {
                match &mut *labels {
                    Value::Sequence(list) => list.push(Value::from(format!("{key}={value}"))),
                    Value::Mapping(map) => {
                        map.insert(Value::from(key.as_str()), Value::from(value.as_str()));
                    }
                    _ => {
                        return Err(ConfigParseError::syntax(
                            &path,
                            format!("labels of service '{name}' must be a list or mapping"),
                        ))
                    }
                }
            }
            debug!(service = %name, "rewrote compose service");
        }

        if !plan.replacement_volume.is_empty() {
            let volumes = self
                .root
                .entry(Value::from("volumes"))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if volumes.is_null() {
                *volumes = Value::Mapping(Mapping::new());
            }
            let volumes = volumes.as_mapping_mut().ok_or_else(|| {
                ConfigParseError::syntax(&path, "top level 'volumes' must be a mapping")
            })?;
            volumes.insert(Value::from(plan.replacement_volume.as_str()), Value::Null);
        }

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, ConfigParseError> {
        serde_yaml_ng::to_string(&self.root).map_err(|e| ConfigParseError::syntax(&self.path, e))
    }

    /// Writes the (possibly rewritten) document back to its own path.
    pub fn save(&self) -> Result<(), ConfigParseError> {
        let yaml = self.to_yaml()?;
        fs::write(&self.path, yaml)
            .map_err(|e| ConfigParseError::syntax(&self.path, format!("cannot write file: {e}")))
    }
}

fn replace_volume_source(volume: &mut Value, from: &str, to: &str) {
    match volume {
        Value::String(spec) => {
            if let Some((source, rest)) = spec.split_once(':') {
                if source == from {
                    *spec = format!("{to}:{rest}");
                }
            }
        }
        Value::Mapping(long) => {
            if long.get("source").and_then(Value::as_str) == Some(from) {
                long.insert(Value::from("source"), Value::from(to));
            }
        }
        _ => {}
    }
}
