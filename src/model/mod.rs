//! In-memory load balancer model
//!
//! The same shapes describe both the desired ("local") state built from a
//! Service and the actual ("remote") state read back from the cloud, so the
//! diff engine can compare them field by field.
//!
//! - [`LoadBalancer`] - one per Service, generic over the CLB/NLB attribute
//!   and listener types in [`clb`] and [`nlb`]
//! - [`ServerGroup`] - backend pool bound to listeners
//! - [`Backend`] - one registered server
//! - [`named_key::NamedKey`] - ownership encoding

pub mod clb;
pub mod named_key;
pub mod nlb;

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::error::{Error, Result};

pub use named_key::{Delimiter, NamedKey, PortSpec};

/// Weight given to a backend when no algorithm asks for anything else
pub const DEFAULT_SERVER_WEIGHT: i32 = 100;

/// Tag marking a load balancer as created by the controller for one Service
pub const TAG_KEY_OWNER: &str = "kubernetes.do.not.delete";

/// Tag recording which cluster created a resource
pub const TAG_KEY_CLUSTER: &str = "ack.aliyun.com";

/// Upper bound on tags per resource, also the size of a tag/untag batch
pub const MAX_TAGS_PER_RESOURCE: usize = 20;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_service(svc: &Service) -> Self {
        Self {
            namespace: svc.namespace().unwrap_or_else(|| "default".to_string()),
            name: svc.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Name the controller gives the load balancer of a Service, derived from
/// the Service UID so it survives renames and controller restarts.
pub fn load_balancer_name(uid: &str) -> String {
    let mut name = format!("a{}", uid.replace('-', ""));
    name.truncate(32);
    name
}

/// The fixed tags every controller-created load balancer carries
pub fn default_tags(owner_name: &str, cluster_id: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_KEY_OWNER, owner_name),
        Tag::new(TAG_KEY_CLUSTER, cluster_id),
    ]
}

pub fn is_default_tag_key(key: &str) -> bool {
    key == TAG_KEY_OWNER || key == TAG_KEY_CLUSTER
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressType {
    #[default]
    Internet,
    Intranet,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Internet => write!(f, "internet"),
            AddressType::Intranet => write!(f, "intranet"),
        }
    }
}

impl FromStr for AddressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "internet" => Ok(AddressType::Internet),
            "intranet" => Ok(AddressType::Intranet),
            other => Err(Error::ValidationError(format!(
                "unsupported address type {other:?}, expected internet or intranet"
            ))),
        }
    }
}

/// Which endpoints become backends and how they are weighted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrafficPolicy {
    /// Pods registered directly through their network interfaces
    Eni,
    /// Only nodes that host a ready pod, preserving the client IP
    Local,
    /// Every eligible node
    Cluster,
}

impl fmt::Display for TrafficPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficPolicy::Eni => write!(f, "eni"),
            TrafficPolicy::Local => write!(f, "local"),
            TrafficPolicy::Cluster => write!(f, "cluster"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendType {
    /// Cloud instance behind a node
    #[default]
    Ecs,
    /// Elastic network interface of a pod
    Eni,
    /// Raw IP address
    Ip,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Ecs => write!(f, "ecs"),
            BackendType::Eni => write!(f, "eni"),
            BackendType::Ip => write!(f, "ip"),
        }
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ecs" => Ok(BackendType::Ecs),
            "eni" => Ok(BackendType::Eni),
            "ip" => Ok(BackendType::Ip),
            other => Err(Error::ValidationError(format!(
                "unsupported backend type {other:?}"
            ))),
        }
    }
}

/// Identity of a backend inside a server group
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKey {
    Instance {
        server_id: String,
        port: i32,
    },
    Network {
        server_id: String,
        server_ip: String,
        port: i32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    /// Instance id, ENI id or raw IP depending on `backend_type`
    pub server_id: String,
    /// Set for ENI and IP backends only
    pub server_ip: Option<String>,
    pub port: i32,
    pub weight: i32,
    pub backend_type: BackendType,
    /// NamedKey of the owning group for controller-added backends
    pub description: String,
    /// Added by someone else; the controller never removes or rewrites it
    pub is_user_managed: bool,
}

impl Backend {
    pub fn instance(server_id: impl Into<String>, port: i32, weight: i32) -> Self {
        Self {
            server_id: server_id.into(),
            server_ip: None,
            port,
            weight,
            backend_type: BackendType::Ecs,
            description: String::new(),
            is_user_managed: false,
        }
    }

    pub fn eni(eni_id: impl Into<String>, ip: impl Into<String>, port: i32, weight: i32) -> Self {
        Self {
            server_id: eni_id.into(),
            server_ip: Some(ip.into()),
            port,
            weight,
            backend_type: BackendType::Eni,
            description: String::new(),
            is_user_managed: false,
        }
    }

    pub fn ip(ip: impl Into<String>, port: i32, weight: i32) -> Self {
        let ip = ip.into();
        Self {
            server_id: ip.clone(),
            server_ip: Some(ip),
            port,
            weight,
            backend_type: BackendType::Ip,
            description: String::new(),
            is_user_managed: false,
        }
    }

    pub fn key(&self) -> BackendKey {
        match self.backend_type {
            BackendType::Ecs => BackendKey::Instance {
                server_id: self.server_id.clone(),
                port: self.port,
            },
            BackendType::Eni | BackendType::Ip => BackendKey::Network {
                server_id: self.server_id.clone(),
                server_ip: self.server_ip.clone().unwrap_or_default(),
                port: self.port,
            },
        }
    }
}

/// The Service port a server group serves
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServicePortRef {
    /// Empty for single-port Services that leave the port unnamed
    pub name: String,
    pub port: i32,
    pub node_port: i32,
    pub target_port: TargetPort,
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetPort {
    Number(i32),
    Named(String),
}

impl Default for TargetPort {
    fn default() -> Self {
        TargetPort::Number(0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerGroupType {
    #[default]
    Instance,
    Ip,
}

/// Health check settings of an NLB server group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupHealthCheck {
    pub enabled: Option<bool>,
    pub check_type: Option<String>,
    pub connect_port: Option<i32>,
    pub connect_timeout: Option<i32>,
    pub interval: Option<i32>,
    pub healthy_threshold: Option<i32>,
    pub unhealthy_threshold: Option<i32>,
    pub uri: Option<String>,
    pub domain: Option<String>,
}

/// Group-level attributes; only the NLB family manages them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerGroupAttributes {
    pub protocol: Option<String>,
    pub scheduler: Option<String>,
    pub connection_drain_enabled: Option<bool>,
    pub connection_drain_timeout: Option<i32>,
    pub preserve_client_ip: Option<bool>,
    pub any_port_enabled: bool,
    pub group_type: ServerGroupType,
    pub health_check: GroupHealthCheck,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerGroup {
    /// Empty until the group exists in the cloud
    pub id: String,
    pub name: String,
    pub named_key: Option<NamedKey>,
    pub service_port: Option<ServicePortRef>,
    pub backends: Vec<Backend>,
    /// Supplied by the user through annotation rather than created here
    pub is_user_managed: bool,
    /// Percentage weight override for the whole group
    pub weight: Option<i32>,
    pub ignore_weight_update: bool,
    pub attributes: ServerGroupAttributes,
}

impl ServerGroup {
    pub fn is_owned_by(&self, svc: &NamespacedName, cluster_id: &str) -> bool {
        self.named_key
            .as_ref()
            .map(|k| k.is_managed_by(svc, cluster_id))
            .unwrap_or(false)
    }
}

/// Attributes every load balancer family exposes to the shared pipeline
pub trait LoadBalancerAttributes {
    fn load_balancer_id(&self) -> &str;
    fn is_user_managed(&self) -> bool;
    fn preserve_on_delete(&self) -> bool;
    fn tags(&self) -> &[Tag];
    /// Externally visible address (IP or DNS name)
    fn address(&self) -> Option<&str>;
}

/// Matching of listeners between local and remote models
pub trait ListenerIdentity {
    type Key: Clone + Eq + std::hash::Hash + fmt::Debug;

    fn match_key(&self) -> Self::Key;
    fn named_key(&self) -> Option<&NamedKey>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenerStatus {
    #[default]
    Running,
    Stopped,
}

impl fmt::Display for ListenerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerStatus::Running => write!(f, "running"),
            ListenerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One load balancer with everything attached to it
#[derive(Clone, Debug)]
pub struct LoadBalancer<A, L> {
    pub namespaced_name: NamespacedName,
    pub attributes: A,
    pub server_groups: Vec<ServerGroup>,
    pub listeners: Vec<L>,
}

impl<A: Default, L> Default for LoadBalancer<A, L> {
    fn default() -> Self {
        Self {
            namespaced_name: NamespacedName::default(),
            attributes: A::default(),
            server_groups: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

impl<A: LoadBalancerAttributes, L> LoadBalancer<A, L> {
    pub fn exists(&self) -> bool {
        !self.attributes.load_balancer_id().is_empty()
    }
}

pub type ClbModel = LoadBalancer<clb::ClbAttributes, clb::ClbListener>;
pub type NlbModel = LoadBalancer<nlb::NlbAttributes, nlb::NlbListener>;
