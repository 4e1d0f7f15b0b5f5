//! Deterministic ownership keys
//!
//! Every server group and listener the controller creates carries a
//! [`NamedKey`] in its name or description. Reading it back is how a
//! reconcile tells its own resources apart from those of other Services or
//! of the user.
//!
//! Grammar (`D` is the delimiter of the load balancer family):
//!
//! ```text
//! key       = prefix D port-spec D service D namespace D cluster
//! port-spec = port-range | protocol "_" port-range
//! port-range= port | port "-" port
//! ```
//!
//! `prefix`, `service` and `namespace` are non-empty and free of `D`.
//! `cluster` is the non-empty remainder and may itself contain `D`.

use std::fmt;

use crate::error::{Error, Result};
use crate::model::NamespacedName;

pub const DEFAULT_PREFIX: &str = "k8s";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Delimiter {
    /// `/`, used by CLB virtual server groups and listeners
    Slash,
    /// `.`, used by NLB server groups and listeners
    Dot,
}

impl Delimiter {
    pub fn as_char(self) -> char {
        match self {
            Delimiter::Slash => '/',
            Delimiter::Dot => '.',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortSpec {
    Single(i32),
    Range { start: i32, end: i32 },
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(port) => write!(f, "{port}"),
            PortSpec::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl PortSpec {
    fn parse(s: &str) -> Result<Self> {
        let parse_port = |p: &str| -> Result<i32> {
            // canonical decimal only, so that formatting reproduces the input
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) || (p.len() > 1 && p.starts_with('0')) {
                return Err(Error::ValidationError(format!("invalid port {p:?} in named key")));
            }
            p.parse::<i32>()
                .map_err(|e| Error::ValidationError(format!("invalid port {p:?}: {e}")))
        };
        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_port(start)?, parse_port(end)?);
                if start > end {
                    return Err(Error::ValidationError(format!(
                        "port range {start}-{end} is inverted"
                    )));
                }
                Ok(PortSpec::Range { start, end })
            }
            None => Ok(PortSpec::Single(parse_port(s)?)),
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            PortSpec::Single(p) => p >= 0,
            PortSpec::Range { start, end } => start >= 0 && start <= end,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamedKey {
    pub prefix: String,
    pub cluster_id: String,
    pub namespace: String,
    pub service_name: String,
    pub port: PortSpec,
    /// Upper-case protocol, only encoded by the NLB family
    pub protocol: Option<String>,
    pub delimiter: Delimiter,
}

impl NamedKey {
    /// Key for a CLB virtual server group or listener on `port`
    pub fn clb(svc: &NamespacedName, cluster_id: &str, port: i32) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            cluster_id: cluster_id.to_string(),
            namespace: svc.namespace.clone(),
            service_name: svc.name.clone(),
            port: PortSpec::Single(port),
            protocol: None,
            delimiter: Delimiter::Slash,
        }
    }

    /// Key for an NLB server group or listener
    pub fn nlb(svc: &NamespacedName, cluster_id: &str, protocol: &str, port: PortSpec) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            cluster_id: cluster_id.to_string(),
            namespace: svc.namespace.clone(),
            service_name: svc.name.clone(),
            port,
            protocol: Some(protocol.to_ascii_uppercase()),
            delimiter: Delimiter::Dot,
        }
    }

    /// Whether `format` followed by `parse` reproduces this key
    pub fn is_valid(&self) -> bool {
        let d = self.delimiter.as_char();
        let plain = |s: &str| !s.is_empty() && !s.contains(d);
        plain(&self.prefix)
            && plain(&self.service_name)
            && plain(&self.namespace)
            && !self.cluster_id.is_empty()
            && self.port.is_valid()
            && self
                .protocol
                .as_deref()
                .map(|p| plain(p) && !p.contains(['_', '-']) && !p.starts_with(|c: char| c.is_ascii_digit()))
                .unwrap_or(true)
    }

    pub fn key(&self) -> String {
        let d = self.delimiter.as_char();
        let port = match &self.protocol {
            Some(protocol) => format!("{protocol}_{}", self.port),
            None => self.port.to_string(),
        };
        format!(
            "{prefix}{d}{port}{d}{svc}{d}{ns}{d}{cluster}",
            prefix = self.prefix,
            svc = self.service_name,
            ns = self.namespace,
            cluster = self.cluster_id,
        )
    }

    pub fn parse(key: &str, delimiter: Delimiter) -> Result<Self> {
        let d = delimiter.as_char();
        let parts: Vec<&str> = key.splitn(5, d).collect();
        if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::ValidationError(format!(
                "{key:?} is not a named key"
            )));
        }

        let (protocol, port) = match parts[1].split_once('_') {
            Some((protocol, _)) if protocol.is_empty() => {
                return Err(Error::ValidationError(format!(
                    "{key:?} has an empty protocol"
                )));
            }
            Some((protocol, port)) => (Some(protocol.to_string()), PortSpec::parse(port)?),
            None => (None, PortSpec::parse(parts[1])?),
        };

        Ok(Self {
            prefix: parts[0].to_string(),
            port,
            protocol,
            service_name: parts[2].to_string(),
            namespace: parts[3].to_string(),
            cluster_id: parts[4].to_string(),
            delimiter,
        })
    }

    /// Lenient parse used when reading cloud descriptions: anything that is
    /// not a well-formed key belongs to somebody else.
    pub fn try_parse(key: &str, delimiter: Delimiter) -> Option<Self> {
        Self::parse(key, delimiter).ok()
    }

    /// Whether this key was minted by the controller for `svc` in `cluster_id`
    pub fn is_managed_by(&self, svc: &NamespacedName, cluster_id: &str) -> bool {
        self.prefix == DEFAULT_PREFIX
            && self.service_name == svc.name
            && self.namespace == svc.namespace
            && self.cluster_id == cluster_id
    }
}

impl fmt::Display for NamedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Whether `description` is a key owned by `svc` in `cluster_id`
pub fn is_owned_description(
    description: &str,
    delimiter: Delimiter,
    svc: &NamespacedName,
    cluster_id: &str,
) -> bool {
    NamedKey::try_parse(description, delimiter)
        .map(|k| k.is_managed_by(svc, cluster_id))
        .unwrap_or(false)
}
