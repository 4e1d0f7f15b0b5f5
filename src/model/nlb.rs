//! Network load balancer (NLB) attributes and listeners

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{
    AddressType, ListenerIdentity, ListenerStatus, LoadBalancerAttributes, NamedKey, PortSpec,
    Tag,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneMapping {
    pub zone_id: String,
    pub vswitch_id: String,
    pub allocation_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NlbAttributes {
    pub load_balancer_id: String,
    pub name: Option<String>,
    pub address_type: Option<AddressType>,
    pub address_ip_version: Option<String>,
    /// Assigned by the cloud
    pub dns_name: Option<String>,
    pub vpc_id: Option<String>,
    pub zone_mappings: Vec<ZoneMapping>,
    pub resource_group_id: Option<String>,
    pub delete_protection: Option<bool>,
    pub modification_protection: Option<bool>,
    pub tags: Vec<Tag>,
    pub is_user_managed: bool,
    pub preserve_on_delete: bool,
}

impl LoadBalancerAttributes for NlbAttributes {
    fn load_balancer_id(&self) -> &str {
        &self.load_balancer_id
    }

    fn is_user_managed(&self) -> bool {
        self.is_user_managed
    }

    fn preserve_on_delete(&self) -> bool {
        self.preserve_on_delete
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn address(&self) -> Option<&str> {
        self.dns_name.as_deref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NlbProtocol {
    Tcp,
    Udp,
    TcpSsl,
}

impl fmt::Display for NlbProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NlbProtocol::Tcp => write!(f, "TCP"),
            NlbProtocol::Udp => write!(f, "UDP"),
            NlbProtocol::TcpSsl => write!(f, "TCPSSL"),
        }
    }
}

impl FromStr for NlbProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(NlbProtocol::Tcp),
            "UDP" => Ok(NlbProtocol::Udp),
            "TCPSSL" => Ok(NlbProtocol::TcpSsl),
            other => Err(Error::ValidationError(format!(
                "unsupported NLB listener protocol {other:?}"
            ))),
        }
    }
}

impl NlbProtocol {
    /// Protocol of the server group behind a listener of this protocol
    pub fn server_group_protocol(self) -> NlbProtocol {
        match self {
            NlbProtocol::TcpSsl => NlbProtocol::Tcp,
            other => other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NlbListener {
    /// Empty until created
    pub listener_id: String,
    pub protocol: NlbProtocol,
    pub port: PortSpec,
    pub server_group_id: String,
    pub server_group_name: String,
    pub named_key: Option<NamedKey>,
    pub description: String,
    pub status: ListenerStatus,
    pub idle_timeout: Option<i32>,
    pub certificate_ids: Vec<String>,
    pub ca_certificate_ids: Vec<String>,
    pub ca_enabled: Option<bool>,
    pub security_policy_id: Option<String>,
    pub proxy_protocol_enabled: Option<bool>,
    pub cps: Option<i32>,
}

impl NlbListener {
    pub fn new(port: PortSpec, protocol: NlbProtocol) -> Self {
        Self {
            listener_id: String::new(),
            protocol,
            port,
            server_group_id: String::new(),
            server_group_name: String::new(),
            named_key: None,
            description: String::new(),
            status: ListenerStatus::Running,
            idle_timeout: None,
            certificate_ids: Vec::new(),
            ca_certificate_ids: Vec::new(),
            ca_enabled: None,
            security_policy_id: None,
            proxy_protocol_enabled: None,
            cps: None,
        }
    }
}

impl ListenerIdentity for NlbListener {
    type Key = (PortSpec, NlbProtocol);

    fn match_key(&self) -> Self::Key {
        (self.port, self.protocol)
    }

    fn named_key(&self) -> Option<&NamedKey> {
        self.named_key.as_ref()
    }
}

/// Partial attribute update for an existing NLB
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NlbAttributeUpdate {
    pub name: Option<String>,
    pub delete_protection: Option<bool>,
    pub modification_protection: Option<bool>,
    pub zone_mappings: Option<Vec<ZoneMapping>>,
}

impl NlbAttributeUpdate {
    pub fn is_empty(&self) -> bool {
        *self == NlbAttributeUpdate::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcpssl_uses_tcp_group() {
        assert_eq!(NlbProtocol::TcpSsl.server_group_protocol(), NlbProtocol::Tcp);
        assert_eq!("tcpssl".parse::<NlbProtocol>().unwrap(), NlbProtocol::TcpSsl);
    }

    #[test]
    fn test_range_listener_identity() {
        let l = NlbListener::new(PortSpec::Range { start: 100, end: 200 }, NlbProtocol::Tcp);
        assert_eq!(
            l.match_key(),
            (PortSpec::Range { start: 100, end: 200 }, NlbProtocol::Tcp)
        );
    }
}
