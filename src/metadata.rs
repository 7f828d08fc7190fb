//! Metadata extraction.
//!
//! Turns an inspected container into a [`ContainerRecord`], or explains
//! why the container does not take part in routing.  Exclusion is a
//! normal result; only a label that cannot be parsed is an error, and
//! even that only drops the one container from the current cycle.
//!
//! Label keys are `enable`, `path`, `host` and `port`, each optionally
//! preceded by the configured prefix.

use std::collections::BTreeMap;

use crate::error::LabelError;
use crate::runtime::ContainerDetails;
use crate::types::ContainerRecord;

pub const LABEL_ENABLE: &str = "enable";
pub const LABEL_PATH: &str = "path";
pub const LABEL_HOST: &str = "host";
pub const LABEL_PORT: &str = "port";

/// Why a container was left out of the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    NotRunning,
    NotOnNetwork,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Eligible(ContainerRecord),
    NotEligible(Exclusion),
}

/// Routing labels, typed and defaulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLabels {
    pub enable: bool,
    /// Normalized prefix; `None` means derive it from the container name.
    pub path: Option<String>,
    pub host: Option<String>,
    /// `None` means infer it from the exposed ports.
    pub port: Option<u16>,
}

impl Default for RouteLabels {
    fn default() -> Self {
        Self {
            enable: true,
            path: None,
            host: None,
            port: None,
        }
    }
}

impl RouteLabels {
    pub fn parse(labels: &BTreeMap<String, String>, prefix: &str) -> Result<Self, LabelError> {
        let get = |key: &str| lookup(labels, prefix, key);

        let mut parsed = RouteLabels::default();

        if let Some((label, value)) = get(LABEL_ENABLE) {
            parsed.enable = parse_bool(&label, value)?;
        }
        // A disabled container is not routed, whatever else it says.
        if !parsed.enable {
            return Ok(parsed);
        }

        if let Some((label, value)) = get(LABEL_PATH) {
            parsed.path = Some(normalize_path(&label, value)?);
        }
        if let Some((label, value)) = get(LABEL_HOST) {
            parsed.host = Some(parse_host(&label, value)?);
        }
        if let Some((label, value)) = get(LABEL_PORT) {
            parsed.port = Some(parse_port(&label, value)?);
        }

        Ok(parsed)
    }
}

/// Extracts [`ContainerRecord`]s for one managed network.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    network: String,
    label_prefix: String,
}

impl MetadataExtractor {
    pub fn new(network: impl Into<String>, label_prefix: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            label_prefix: label_prefix.into(),
        }
    }

    pub fn extract(&self, details: &ContainerDetails) -> Result<Extraction, LabelError> {
        if !details.running {
            return Ok(Extraction::NotEligible(Exclusion::NotRunning));
        }
        let Some(ip) = details.addresses.get(&self.network) else {
            return Ok(Extraction::NotEligible(Exclusion::NotOnNetwork));
        };

        let labels = RouteLabels::parse(&details.labels, &self.label_prefix)?;
        if !labels.enable {
            return Ok(Extraction::NotEligible(Exclusion::Disabled));
        }

        let path_prefix = match labels.path {
            Some(path) => path,
            None => normalize_path("container name", &format!("/{}", details.name))?,
        };
        let port = match labels.port {
            Some(port) => port,
            None => infer_port(&details.exposed_ports).ok_or(LabelError::NoPort)?,
        };

        Ok(Extraction::Eligible(ContainerRecord {
            id: details.id.clone(),
            name: details.name.clone(),
            ip: *ip,
            port,
            path_prefix,
            host: labels.host,
            enabled: true,
            started_at: details.started_at,
        }))
    }
}

fn lookup<'a>(
    labels: &'a BTreeMap<String, String>,
    prefix: &str,
    key: &str,
) -> Option<(String, &'a str)> {
    let full = format!("{}{}", prefix, key);
    labels.get(&full).map(|v| (full, v.trim()))
}

fn parse_bool(label: &str, value: &str) -> Result<bool, LabelError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(LabelError::InvalidBool {
            label: label.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_port(label: &str, value: &str) -> Result<u16, LabelError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(LabelError::InvalidPort {
            label: label.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_host(label: &str, value: &str) -> Result<String, LabelError> {
    if value.is_empty() {
        return Err(LabelError::Empty {
            label: label.to_string(),
        });
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(LabelError::Unsafe {
            label: label.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value.to_ascii_lowercase())
}

/// Characters that would let a label escape its directive.
fn is_unsafe(c: char) -> bool {
    c.is_whitespace()
        || c.is_control()
        || matches!(c, '"' | '\'' | ';' | '{' | '}' | '#' | '$' | '\\' | '`')
}

/// Normalize a path prefix to `/a/b/` form, collapsing repeated slashes.
pub fn normalize_path(label: &str, value: &str) -> Result<String, LabelError> {
    if value.is_empty() {
        return Err(LabelError::Empty {
            label: label.to_string(),
        });
    }
    if value.chars().any(is_unsafe) {
        return Err(LabelError::Unsafe {
            label: label.to_string(),
            value: value.to_string(),
        });
    }

    let segments: Vec<&str> = value.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}/", segments.join("/")))
}

/// Lowest exposed TCP port.
fn infer_port(exposed: &[String]) -> Option<u16> {
    exposed
        .iter()
        .filter_map(|spec| {
            let (port, proto) = spec.split_once('/').unwrap_or((spec.as_str(), "tcp"));
            if proto != "tcp" {
                return None;
            }
            port.parse::<u16>().ok().filter(|p| *p != 0)
        })
        .min()
}
