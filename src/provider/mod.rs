//! Cloud provider capability interface
//!
//! The reconcile pipeline only ever talks to the cloud through these traits.
//! [`memory::MemoryCloud`] implements all of them in-process and backs both
//! `--dry-run` and the test suite.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::Result;
use crate::model::clb::{ClbAttributeUpdate, ClbAttributes, ClbListener, ClbProtocol};
use crate::model::nlb::{NlbAttributeUpdate, NlbAttributes, NlbListener};
use crate::model::{Backend, ServerGroup, ServerGroupAttributes, Tag};

/// Resource kinds that carry tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Clb,
    Nlb,
    NlbServerGroup,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Clb => write!(f, "instance"),
            ResourceType::Nlb => write!(f, "loadbalancer"),
            ResourceType::NlbServerGroup => write!(f, "servergroup"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Succeeded,
    Failed { code: String, message: String },
}

#[async_trait]
pub trait TagProvider: Send + Sync {
    async fn list_tags(&self, resource: ResourceType, id: &str) -> Result<Vec<Tag>>;
    async fn tag_resource(&self, resource: ResourceType, id: &str, tags: &[Tag]) -> Result<()>;
    async fn untag_resource(&self, resource: ResourceType, id: &str, keys: &[String])
        -> Result<()>;
}

/// Network lookups used by the endpoint resolver
#[async_trait]
pub trait VpcProvider: Send + Sync {
    async fn describe_vpc_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>>;

    /// Map of pod IP to elastic network interface id; unknown IPs are absent
    async fn resolve_eni_ids(&self, vpc_id: &str, ips: &[String]) -> Result<HashMap<String, String>>;
}

#[async_trait]
pub trait ClbProvider: Send + Sync {
    async fn find_clb_by_id(&self, id: &str) -> Result<Option<ClbAttributes>>;
    /// Controller-created CLB carrying every tag in `tags`
    async fn find_clb_by_tags(&self, tags: &[Tag]) -> Result<Option<ClbAttributes>>;
    async fn create_clb(&self, attrs: &ClbAttributes) -> Result<String>;
    async fn update_clb(&self, id: &str, update: &ClbAttributeUpdate) -> Result<()>;
    async fn delete_clb(&self, id: &str) -> Result<()>;

    async fn describe_vserver_groups(&self, lb_id: &str) -> Result<Vec<ServerGroup>>;
    async fn create_vserver_group(&self, lb_id: &str, name: &str) -> Result<String>;
    async fn delete_vserver_group(&self, group_id: &str) -> Result<()>;
    async fn add_vserver_group_backends(&self, group_id: &str, backends: &[Backend])
        -> Result<()>;
    async fn remove_vserver_group_backends(&self, group_id: &str, backends: &[Backend])
        -> Result<()>;
    async fn update_vserver_group_backends(&self, group_id: &str, backends: &[Backend])
        -> Result<()>;

    async fn describe_clb_listeners(&self, lb_id: &str) -> Result<Vec<ClbListener>>;
    async fn create_clb_listener(&self, lb_id: &str, listener: &ClbListener) -> Result<()>;
    async fn update_clb_listener(&self, lb_id: &str, listener: &ClbListener) -> Result<()>;
    async fn delete_clb_listener(&self, lb_id: &str, port: i32, protocol: ClbProtocol)
        -> Result<()>;
    async fn start_clb_listener(&self, lb_id: &str, port: i32, protocol: ClbProtocol)
        -> Result<()>;
}

/// NLB writes are asynchronous; every call that returns a job id must be
/// followed by [`NlbProvider::describe_job`] polling.
#[async_trait]
pub trait NlbProvider: Send + Sync {
    async fn find_nlb_by_id(&self, id: &str) -> Result<Option<NlbAttributes>>;
    async fn find_nlb_by_tags(&self, tags: &[Tag]) -> Result<Option<NlbAttributes>>;
    async fn create_nlb(&self, attrs: &NlbAttributes) -> Result<String>;
    async fn update_nlb(&self, id: &str, update: &NlbAttributeUpdate) -> Result<String>;
    async fn delete_nlb(&self, id: &str) -> Result<String>;

    /// Server groups carrying every tag in `tags`
    async fn list_nlb_server_groups(&self, tags: &[Tag]) -> Result<Vec<ServerGroup>>;
    async fn get_nlb_server_group(&self, id: &str) -> Result<Option<ServerGroup>>;
    async fn create_nlb_server_group(&self, group: &ServerGroup, vpc_id: &str, tags: &[Tag])
        -> Result<String>;
    async fn update_nlb_server_group(&self, id: &str, attrs: &ServerGroupAttributes)
        -> Result<String>;
    async fn delete_nlb_server_group(&self, id: &str) -> Result<String>;
    async fn add_nlb_servers(&self, group_id: &str, backends: &[Backend]) -> Result<String>;
    async fn remove_nlb_servers(&self, group_id: &str, backends: &[Backend]) -> Result<String>;
    async fn update_nlb_servers(&self, group_id: &str, backends: &[Backend]) -> Result<String>;

    async fn list_nlb_listeners(&self, lb_id: &str) -> Result<Vec<NlbListener>>;
    async fn create_nlb_listener(&self, lb_id: &str, listener: &NlbListener) -> Result<String>;
    async fn update_nlb_listener(&self, listener: &NlbListener) -> Result<String>;
    async fn delete_nlb_listener(&self, listener_id: &str) -> Result<String>;

    async fn describe_job(&self, job_id: &str) -> Result<JobStatus>;
}

/// Everything the reconcile pipeline needs from the cloud
pub trait CloudProvider: ClbProvider + NlbProvider + TagProvider + VpcProvider {
    fn as_vpc(&self) -> &dyn VpcProvider;
}

impl<T> CloudProvider for T
where
    T: ClbProvider + NlbProvider + TagProvider + VpcProvider,
{
    fn as_vpc(&self) -> &dyn VpcProvider {
        self
    }
}
