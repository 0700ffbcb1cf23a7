//! devcontainer.json loading.

use crate::compose::ComposeDocument;
use crate::error::ConfigParseError;
use crate::jsonc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DESCRIPTOR_FILE_NAME: &str = "devcontainer.json";
pub const DEFAULT_WORKSPACE_FOLDER: &str = "/workspace";
pub const DEFAULT_REMOTE_USER: &str = "root";

/// Keys the engine manages itself and refuses to take from user configuration.
const DENIED_KEYS: &[&str] = &["workspaceMount"];

/// Where the development container image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Image(String),
    Build {
        dockerfile: PathBuf,
        context: PathBuf,
    },
}

/// A `forwardPorts` entry. Compose workspaces may address a specific
/// service with the `"service:port"` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub service: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DevcontainerConfig {
    descriptor_path: PathBuf,
    descriptor: Map<String, Value>,
    compose: Option<ComposeDocument>,
}

impl DevcontainerConfig {
    /// Loads `devcontainer.json` from `config_dir` and, if it references one,
    /// the compose document next to it.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigParseError> {
        let descriptor_path = config_dir.join(DESCRIPTOR_FILE_NAME);
        if !descriptor_path.is_file() {
            return Err(ConfigParseError::MissingDescriptor(descriptor_path));
        }

        let raw = fs::read_to_string(&descriptor_path)
            .map_err(|_| ConfigParseError::MissingDescriptor(descriptor_path.clone()))?;

        let mut config = Self::parse(&descriptor_path, &raw)?;

        if let Some(relative) = config.compose_file()? {
            let base = descriptor_path.parent().unwrap_or(config_dir);
            let compose_path = base.join(relative);
            config.compose = Some(ComposeDocument::load(&compose_path)?);
        }

        Ok(config)
    }

    /// Parses descriptor content without touching the filesystem.
    pub fn parse(descriptor_path: &Path, raw: &str) -> Result<Self, ConfigParseError> {
        let strict = jsonc::normalize(raw).map_err(|e| ConfigParseError::syntax(descriptor_path, e))?;
        let value: Value = serde_json::from_str(&strict)
            .map_err(|e| ConfigParseError::syntax(descriptor_path, e))?;

        let Value::Object(descriptor) = value else {
            return Err(ConfigParseError::syntax(
                descriptor_path,
                "devcontainer.json must contain a JSON object",
            ));
        };

        if let Some(key) = DENIED_KEYS.iter().find(|k| descriptor.contains_key(**k)) {
            return Err(ConfigParseError::DeniedKey(key.to_string()));
        }

        Ok(Self {
            descriptor_path: descriptor_path.to_path_buf(),
            descriptor,
            compose: None,
        })
    }

    fn compose_file(&self) -> Result<Option<&str>, ConfigParseError> {
        match self.descriptor.get("dockerComposeFile") {
            None => Ok(None),
            Some(Value::String(path)) => Ok(Some(path.as_str())),
            Some(_) => Err(ConfigParseError::InvalidValue {
                key: "dockerComposeFile".to_string(),
                message: "expected a string".to_string(),
            }),
        }
    }

    fn string_key(&self, key: &str) -> Result<Option<&str>, ConfigParseError> {
        match self.descriptor.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.as_str())),
            Some(_) => Err(ConfigParseError::InvalidValue {
                key: key.to_string(),
                message: "expected a string".to_string(),
            }),
        }
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    pub fn descriptor_dir(&self) -> &Path {
        self.descriptor_path.parent().unwrap_or(Path::new("."))
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.descriptor
    }

    pub fn compose(&self) -> Option<&ComposeDocument> {
        self.compose.as_ref()
    }

    pub fn compose_mut(&mut self) -> Option<&mut ComposeDocument> {
        self.compose.as_mut()
    }

    /// Compose service that hosts the development environment.
    pub fn service(&self) -> Result<&str, ConfigParseError> {
        self.string_key("service")?
            .ok_or(ConfigParseError::MissingKey("service"))
    }

    pub fn workspace_folder(&self) -> Result<&str, ConfigParseError> {
        Ok(self
            .string_key("workspaceFolder")?
            .unwrap_or(DEFAULT_WORKSPACE_FOLDER))
    }

    pub fn remote_user(&self) -> Result<&str, ConfigParseError> {
        if let Some(user) = self.string_key("remoteUser")? {
            return Ok(user);
        }
        Ok(self
            .string_key("containerUser")?
            .unwrap_or(DEFAULT_REMOTE_USER))
    }

    pub fn image_source(&self) -> Result<ImageSource, ConfigParseError> {
        if let Some(image) = self.string_key("image")? {
            return Ok(ImageSource::Image(image.to_string()));
        }

        let base = self.descriptor_dir();
        let (dockerfile, context) = match self.descriptor.get("build") {
            Some(Value::Object(build)) => {
                let dockerfile = build
                    .get("dockerfile")
                    .and_then(Value::as_str)
                    .ok_or(ConfigParseError::MissingKey("build.dockerfile"))?;
                let context = build.get("context").and_then(Value::as_str).unwrap_or(".");
                (dockerfile, context)
            }
            Some(_) => {
                return Err(ConfigParseError::InvalidValue {
                    key: "build".to_string(),
                    message: "expected an object".to_string(),
                })
            }
            None => {
                let dockerfile = self
                    .string_key("dockerFile")?
                    .ok_or(ConfigParseError::MissingKey("image"))?;
                let context = self.string_key("context")?.unwrap_or(".");
                (dockerfile, context)
            }
        };

        Ok(ImageSource::Build {
            dockerfile: base.join(dockerfile),
            context: base.join(context),
        })
    }

    pub fn container_env(&self) -> Result<BTreeMap<String, String>, ConfigParseError> {
        let mut env = BTreeMap::new();
        for key in ["containerEnv", "remoteEnv"] {
            match self.descriptor.get(key) {
                None | Some(Value::Null) => {}
                Some(Value::Object(vars)) => {
                    for (name, value) in vars {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            Value::Null => continue,
                            other => other.to_string(),
                        };
                        env.entry(name.clone()).or_insert(value);
                    }
                }
                Some(_) => {
                    return Err(ConfigParseError::InvalidValue {
                        key: key.to_string(),
                        message: "expected an object".to_string(),
                    })
                }
            }
        }
        Ok(env)
    }

    pub fn forward_ports(&self) -> Result<Vec<PortForward>, ConfigParseError> {
        let entries = match self.descriptor.get("forwardPorts") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(ConfigParseError::InvalidValue {
                    key: "forwardPorts".to_string(),
                    message: "expected a list".to_string(),
                })
            }
        };

        entries.iter().map(parse_port_forward).collect()
    }
}

fn parse_port_forward(entry: &Value) -> Result<PortForward, ConfigParseError> {
    let invalid = || ConfigParseError::InvalidValue {
        key: "forwardPorts".to_string(),
        message: format!("{entry} is not a valid port"),
    };

    let (service, port) = match entry {
        Value::Number(n) => (None, n.as_u64().ok_or_else(invalid)?),
        Value::String(s) => match s.rsplit_once(':') {
            Some((service, port)) => (
                Some(service.to_string()),
                port.parse::<u64>().map_err(|_| invalid())?,
            ),
            None => (None, s.parse::<u64>().map_err(|_| invalid())?),
        },
        _ => return Err(invalid()),
    };

    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok(PortForward { service, port }),
        _ => Err(invalid()),
    }
}
