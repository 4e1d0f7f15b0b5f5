//! In-memory cloud
//!
//! Keeps load balancers, server groups, listeners and tags in a single
//! mutex-guarded state and records every call it receives. Mutating calls
//! can be made to fail with injected conflicts or cloud errors, and NLB jobs
//! can be told to stay in `Processing` for a number of polls.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ClbProvider, JobStatus, NlbProvider, ResourceType, TagProvider, VpcProvider,
};
use crate::error::{Error, Result};
use crate::model::clb::{ClbAttributeUpdate, ClbAttributes, ClbListener, ClbProtocol};
use crate::model::nlb::{NlbAttributeUpdate, NlbAttributes, NlbListener};
use crate::model::{
    AddressType, Backend, BackendKey, ListenerStatus, ServerGroup, ServerGroupAttributes, Tag,
};

/// Per-call backend limits of the real APIs
pub const CLB_MAX_BACKENDS_PER_CALL: usize = 40;
pub const NLB_MAX_BACKENDS_PER_CALL: usize = 200;

/// One call received by the in-memory cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudCall {
    pub op: String,
    pub resource: String,
    pub mutating: bool,
}

impl fmt::Display for CloudCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.resource)
    }
}

#[derive(Default)]
struct CloudState {
    next_id: u64,
    clbs: BTreeMap<String, ClbAttributes>,
    vserver_groups: BTreeMap<String, (String, ServerGroup)>,
    clb_listeners: BTreeMap<(String, i32, ClbProtocol), ClbListener>,
    nlbs: BTreeMap<String, NlbAttributes>,
    nlb_groups: BTreeMap<String, (ServerGroup, Vec<Tag>)>,
    nlb_listeners: BTreeMap<String, (String, NlbListener)>,
    enis: HashMap<String, String>,
    vpc_cidrs: Vec<IpNet>,
    jobs: HashMap<String, u32>,
    job_polls: u32,
    conflicts: HashMap<String, u32>,
    failures: HashMap<String, (String, String)>,
    calls: Vec<CloudCall>,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn read(&mut self, op: &str, resource: &str) {
        self.calls.push(CloudCall {
            op: op.to_string(),
            resource: resource.to_string(),
            mutating: false,
        });
    }

    /// Record a write and apply any injected failure for `op`
    fn write(&mut self, op: &str, resource: &str) -> Result<()> {
        debug!(op, resource, "memory cloud write");
        self.calls.push(CloudCall {
            op: op.to_string(),
            resource: resource.to_string(),
            mutating: true,
        });
        if let Some(remaining) = self.conflicts.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Conflict(format!("{op} {resource}: resource is busy")));
            }
        }
        if let Some((code, message)) = self.failures.remove(op) {
            return Err(Error::cloud(code, message));
        }
        Ok(())
    }

    fn new_job(&mut self) -> String {
        let id = self.next_id("job");
        let polls = self.job_polls;
        self.jobs.insert(id.clone(), polls);
        id
    }
}

fn not_found(what: &str, id: &str) -> Error {
    Error::cloud("ResourceNotFound", format!("{what} {id} does not exist"))
}

fn has_tags(actual: &[Tag], wanted: &[Tag]) -> bool {
    wanted.iter().all(|w| actual.contains(w))
}

fn merge_tags(existing: &mut Vec<Tag>, tags: &[Tag]) {
    for tag in tags {
        match existing.iter_mut().find(|t| t.key == tag.key) {
            Some(t) => t.value = tag.value.clone(),
            None => existing.push(tag.clone()),
        }
    }
}

fn check_batch(backends: &[Backend], limit: usize) -> Result<()> {
    if backends.len() > limit {
        return Err(Error::cloud(
            "TooManyBackendServers",
            format!("{} backends exceed the per-call limit of {limit}", backends.len()),
        ));
    }
    Ok(())
}

fn add_backends(group: &mut ServerGroup, backends: &[Backend]) -> Result<()> {
    for b in backends {
        if group.backends.iter().any(|e| e.key() == b.key()) {
            return Err(Error::cloud(
                "BackendServer.Exists",
                format!("backend {} port {} already registered", b.server_id, b.port),
            ));
        }
    }
    group.backends.extend(backends.iter().cloned().map(|mut b| {
        b.is_user_managed = false;
        b
    }));
    Ok(())
}

fn remove_backends(group: &mut ServerGroup, backends: &[Backend]) {
    let keys: Vec<BackendKey> = backends.iter().map(Backend::key).collect();
    group.backends.retain(|b| !keys.contains(&b.key()));
}

fn update_backends(group: &mut ServerGroup, backends: &[Backend]) -> Result<()> {
    for b in backends {
        let existing = group
            .backends
            .iter_mut()
            .find(|e| e.key() == b.key())
            .ok_or_else(|| not_found("backend", &b.server_id))?;
        existing.weight = b.weight;
        existing.description = b.description.clone();
    }
    Ok(())
}

/// Ports on one CLB collide unless one listener is UDP and the other is not
fn clb_port_collides(a: ClbProtocol, b: ClbProtocol) -> bool {
    (a == ClbProtocol::Udp) == (b == ClbProtocol::Udp)
}

#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vpc_cidr(mut self, cidr: IpNet) -> Self {
        self.state.get_mut().vpc_cidrs.push(cidr);
        self
    }

    pub fn with_eni(mut self, ip: impl Into<String>, eni_id: impl Into<String>) -> Self {
        self.state.get_mut().enis.insert(ip.into(), eni_id.into());
        self
    }

    /// Jobs report `Processing` for this many polls before succeeding
    pub fn with_job_polls(mut self, polls: u32) -> Self {
        self.state.get_mut().job_polls = polls;
        self
    }

    /// The next `count` calls of `op` fail with a conflict
    pub async fn inject_conflicts(&self, op: &str, count: u32) {
        self.state.lock().await.conflicts.insert(op.to_string(), count);
    }

    /// The next call of `op` fails with a cloud API error
    pub async fn fail_next(&self, op: &str, code: &str, message: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(op.to_string(), (code.to_string(), message.to_string()));
    }

    pub async fn calls(&self) -> Vec<CloudCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn mutating_calls(&self) -> Vec<CloudCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.mutating)
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Seed a load balancer the user created outside the controller
    pub async fn insert_clb(&self, attrs: ClbAttributes) -> String {
        let mut state = self.state.lock().await;
        let mut attrs = attrs;
        if attrs.load_balancer_id.is_empty() {
            attrs.load_balancer_id = state.next_id("lb");
        }
        let id = attrs.load_balancer_id.clone();
        state.clbs.insert(id.clone(), attrs);
        id
    }

    pub async fn insert_vserver_group(&self, lb_id: &str, group: ServerGroup) -> String {
        let mut state = self.state.lock().await;
        let mut group = group;
        if group.id.is_empty() {
            group.id = state.next_id("rsp");
        }
        let id = group.id.clone();
        state.vserver_groups.insert(id.clone(), (lb_id.to_string(), group));
        id
    }

    pub async fn insert_clb_listener(&self, lb_id: &str, listener: ClbListener) {
        let mut state = self.state.lock().await;
        state
            .clb_listeners
            .insert((lb_id.to_string(), listener.port, listener.protocol), listener);
    }

    pub async fn insert_nlb(&self, attrs: NlbAttributes) -> String {
        let mut state = self.state.lock().await;
        let mut attrs = attrs;
        if attrs.load_balancer_id.is_empty() {
            attrs.load_balancer_id = state.next_id("nlb");
        }
        let id = attrs.load_balancer_id.clone();
        state.nlbs.insert(id.clone(), attrs);
        id
    }

    pub async fn insert_nlb_server_group(&self, group: ServerGroup, tags: Vec<Tag>) -> String {
        let mut state = self.state.lock().await;
        let mut group = group;
        if group.id.is_empty() {
            group.id = state.next_id("sgp");
        }
        let id = group.id.clone();
        state.nlb_groups.insert(id.clone(), (group, tags));
        id
    }

    pub async fn insert_nlb_listener(&self, lb_id: &str, listener: NlbListener) -> String {
        let mut state = self.state.lock().await;
        let mut listener = listener;
        if listener.listener_id.is_empty() {
            listener.listener_id = state.next_id("lsn");
        }
        let id = listener.listener_id.clone();
        state.nlb_listeners.insert(id.clone(), (lb_id.to_string(), listener));
        id
    }

    pub async fn clb(&self, id: &str) -> Option<ClbAttributes> {
        self.state.lock().await.clbs.get(id).cloned()
    }

    pub async fn clb_count(&self) -> usize {
        self.state.lock().await.clbs.len()
    }

    pub async fn nlb(&self, id: &str) -> Option<NlbAttributes> {
        self.state.lock().await.nlbs.get(id).cloned()
    }

    pub async fn nlb_count(&self) -> usize {
        self.state.lock().await.nlbs.len()
    }

    pub async fn vserver_groups(&self, lb_id: &str) -> Vec<ServerGroup> {
        self.state
            .lock()
            .await
            .vserver_groups
            .values()
            .filter(|(lb, _)| lb == lb_id)
            .map(|(_, g)| g.clone())
            .collect()
    }

    pub async fn clb_listeners(&self, lb_id: &str) -> Vec<ClbListener> {
        self.state
            .lock()
            .await
            .clb_listeners
            .iter()
            .filter(|((lb, _, _), _)| lb == lb_id)
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub async fn nlb_server_groups(&self) -> Vec<ServerGroup> {
        self.state
            .lock()
            .await
            .nlb_groups
            .values()
            .map(|(g, _)| g.clone())
            .collect()
    }

    pub async fn nlb_listeners(&self, lb_id: &str) -> Vec<NlbListener> {
        self.state
            .lock()
            .await
            .nlb_listeners
            .values()
            .filter(|(lb, _)| lb == lb_id)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

#[async_trait]
impl TagProvider for MemoryCloud {
    async fn list_tags(&self, resource: ResourceType, id: &str) -> Result<Vec<Tag>> {
        let mut state = self.state.lock().await;
        state.read("ListTagResources", id);
        match resource {
            ResourceType::Clb => state.clbs.get(id).map(|a| a.tags.clone()),
            ResourceType::Nlb => state.nlbs.get(id).map(|a| a.tags.clone()),
            ResourceType::NlbServerGroup => state.nlb_groups.get(id).map(|(_, t)| t.clone()),
        }
        .ok_or_else(|| not_found(&resource.to_string(), id))
    }

    async fn tag_resource(&self, resource: ResourceType, id: &str, tags: &[Tag]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("TagResources", id)?;
        let existing = match resource {
            ResourceType::Clb => state.clbs.get_mut(id).map(|a| &mut a.tags),
            ResourceType::Nlb => state.nlbs.get_mut(id).map(|a| &mut a.tags),
            ResourceType::NlbServerGroup => state.nlb_groups.get_mut(id).map(|(_, t)| t),
        }
        .ok_or_else(|| not_found(&resource.to_string(), id))?;
        merge_tags(existing, tags);
        Ok(())
    }

    async fn untag_resource(
        &self,
        resource: ResourceType,
        id: &str,
        keys: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("UntagResources", id)?;
        let existing = match resource {
            ResourceType::Clb => state.clbs.get_mut(id).map(|a| &mut a.tags),
            ResourceType::Nlb => state.nlbs.get_mut(id).map(|a| &mut a.tags),
            ResourceType::NlbServerGroup => state.nlb_groups.get_mut(id).map(|(_, t)| t),
        }
        .ok_or_else(|| not_found(&resource.to_string(), id))?;
        existing.retain(|t| !keys.contains(&t.key));
        Ok(())
    }
}

#[async_trait]
impl VpcProvider for MemoryCloud {
    async fn describe_vpc_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>> {
        let mut state = self.state.lock().await;
        state.read("DescribeVpcs", vpc_id);
        Ok(state.vpc_cidrs.clone())
    }

    async fn resolve_eni_ids(
        &self,
        vpc_id: &str,
        ips: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock().await;
        state.read("DescribeNetworkInterfaces", vpc_id);
        Ok(ips
            .iter()
            .filter_map(|ip| state.enis.get(ip).map(|eni| (ip.clone(), eni.clone())))
            .collect())
    }
}

#[async_trait]
impl ClbProvider for MemoryCloud {
    async fn find_clb_by_id(&self, id: &str) -> Result<Option<ClbAttributes>> {
        let mut state = self.state.lock().await;
        state.read("DescribeLoadBalancerAttribute", id);
        Ok(state.clbs.get(id).cloned())
    }

    async fn find_clb_by_tags(&self, tags: &[Tag]) -> Result<Option<ClbAttributes>> {
        let mut state = self.state.lock().await;
        state.read("DescribeLoadBalancers", "tags");
        Ok(state.clbs.values().find(|a| has_tags(&a.tags, tags)).cloned())
    }

    async fn create_clb(&self, attrs: &ClbAttributes) -> Result<String> {
        let mut state = self.state.lock().await;
        let name = attrs.name.clone().unwrap_or_default();
        state.write("CreateLoadBalancer", &name)?;
        let id = state.next_id("lb");
        let mut created = attrs.clone();
        created.load_balancer_id = id.clone();
        created.address = Some(match created.address_type.unwrap_or_default() {
            AddressType::Internet => format!("47.100.0.{}", state.next_id % 250),
            AddressType::Intranet => format!("192.168.0.{}", state.next_id % 250),
        });
        state.clbs.insert(id.clone(), created);
        Ok(id)
    }

    async fn update_clb(&self, id: &str, update: &ClbAttributeUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("ModifyLoadBalancerAttribute", id)?;
        let attrs = state.clbs.get_mut(id).ok_or_else(|| not_found("load balancer", id))?;
        if let Some(name) = &update.name {
            attrs.name = Some(name.clone());
        }
        if let Some(spec) = &update.spec {
            attrs.spec = Some(spec.clone());
        }
        if let Some(charge) = &update.charge_type {
            attrs.charge_type = Some(charge.clone());
        }
        if let Some(bandwidth) = update.bandwidth {
            attrs.bandwidth = Some(bandwidth);
        }
        if let Some(dp) = update.delete_protection {
            attrs.delete_protection = Some(dp);
        }
        if let Some(mp) = &update.modification_protection {
            attrs.modification_protection = Some(mp.clone());
        }
        Ok(())
    }

    async fn delete_clb(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("DeleteLoadBalancer", id)?;
        let attrs = state.clbs.get(id).ok_or_else(|| not_found("load balancer", id))?;
        if attrs.delete_protection == Some(true) {
            return Err(Error::cloud(
                "LoadBalancer.DeleteProtectionEnabled",
                format!("load balancer {id} has delete protection on"),
            ));
        }
        state.clbs.remove(id);
        state.vserver_groups.retain(|_, (lb, _)| lb != id);
        state.clb_listeners.retain(|(lb, _, _), _| lb != id);
        Ok(())
    }

    async fn describe_vserver_groups(&self, lb_id: &str) -> Result<Vec<ServerGroup>> {
        let mut state = self.state.lock().await;
        state.read("DescribeVServerGroups", lb_id);
        if !state.clbs.contains_key(lb_id) {
            return Err(not_found("load balancer", lb_id));
        }
        Ok(state
            .vserver_groups
            .values()
            .filter(|(lb, _)| lb == lb_id)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn create_vserver_group(&self, lb_id: &str, name: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("CreateVServerGroup", name)?;
        if !state.clbs.contains_key(lb_id) {
            return Err(not_found("load balancer", lb_id));
        }
        let id = state.next_id("rsp");
        let group = ServerGroup {
            id: id.clone(),
            name: name.to_string(),
            ..Default::default()
        };
        state.vserver_groups.insert(id.clone(), (lb_id.to_string(), group));
        Ok(id)
    }

    async fn delete_vserver_group(&self, group_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("DeleteVServerGroup", group_id)?;
        if state
            .clb_listeners
            .values()
            .any(|l| l.vgroup_id == group_id)
        {
            return Err(Error::cloud(
                "RspAssociatedWithListener",
                format!("vserver group {group_id} is still used by a listener"),
            ));
        }
        state
            .vserver_groups
            .remove(group_id)
            .map(|_| ())
            .ok_or_else(|| not_found("vserver group", group_id))
    }

    async fn add_vserver_group_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("AddVServerGroupBackendServers", group_id)?;
        check_batch(backends, CLB_MAX_BACKENDS_PER_CALL)?;
        let (_, group) = state
            .vserver_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("vserver group", group_id))?;
        add_backends(group, backends)
    }

    async fn remove_vserver_group_backends(
        &self,
        group_id: &str,
        backends: &[Backend],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("RemoveVServerGroupBackendServers", group_id)?;
        check_batch(backends, CLB_MAX_BACKENDS_PER_CALL)?;
        let (_, group) = state
            .vserver_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("vserver group", group_id))?;
        remove_backends(group, backends);
        Ok(())
    }

    async fn update_vserver_group_backends(
        &self,
        group_id: &str,
        backends: &[Backend],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.write("SetVServerGroupAttribute", group_id)?;
        check_batch(backends, CLB_MAX_BACKENDS_PER_CALL)?;
        let (_, group) = state
            .vserver_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("vserver group", group_id))?;
        update_backends(group, backends)
    }

    async fn describe_clb_listeners(&self, lb_id: &str) -> Result<Vec<ClbListener>> {
        let mut state = self.state.lock().await;
        state.read("DescribeLoadBalancerListeners", lb_id);
        Ok(state
            .clb_listeners
            .iter()
            .filter(|((lb, _, _), _)| lb == lb_id)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn create_clb_listener(&self, lb_id: &str, listener: &ClbListener) -> Result<()> {
        let mut state = self.state.lock().await;
        let resource = format!("{lb_id}:{}/{}", listener.protocol, listener.port);
        state.write("CreateLoadBalancerListener", &resource)?;
        if !state.clbs.contains_key(lb_id) {
            return Err(not_found("load balancer", lb_id));
        }
        if state.clb_listeners.iter().any(|((lb, port, proto), _)| {
            lb == lb_id && *port == listener.port && clb_port_collides(*proto, listener.protocol)
        }) {
            return Err(Error::cloud(
                "ListenerAlreadyExists",
                format!("port {} is already used on {lb_id}", listener.port),
            ));
        }
        if !listener.is_forwarding() && !state.vserver_groups.contains_key(&listener.vgroup_id) {
            return Err(not_found("vserver group", &listener.vgroup_id));
        }
        let mut created = listener.clone();
        created.status = ListenerStatus::Stopped;
        state
            .clb_listeners
            .insert((lb_id.to_string(), listener.port, listener.protocol), created);
        Ok(())
    }

    async fn update_clb_listener(&self, lb_id: &str, listener: &ClbListener) -> Result<()> {
        let mut state = self.state.lock().await;
        let resource = format!("{lb_id}:{}/{}", listener.protocol, listener.port);
        state.write("SetLoadBalancerListenerAttribute", &resource)?;
        let key = (lb_id.to_string(), listener.port, listener.protocol);
        let existing = state
            .clb_listeners
            .get_mut(&key)
            .ok_or_else(|| not_found("listener", &resource))?;
        let status = existing.status;
        *existing = listener.clone();
        existing.status = status;
        Ok(())
    }

    async fn delete_clb_listener(&self, lb_id: &str, port: i32, protocol: ClbProtocol) -> Result<()> {
        let mut state = self.state.lock().await;
        let resource = format!("{lb_id}:{protocol}/{port}");
        state.write("DeleteLoadBalancerListener", &resource)?;
        state
            .clb_listeners
            .remove(&(lb_id.to_string(), port, protocol))
            .map(|_| ())
            .ok_or_else(|| not_found("listener", &resource))
    }

    async fn start_clb_listener(&self, lb_id: &str, port: i32, protocol: ClbProtocol) -> Result<()> {
        let mut state = self.state.lock().await;
        let resource = format!("{lb_id}:{protocol}/{port}");
        state.write("StartLoadBalancerListener", &resource)?;
        let listener = state
            .clb_listeners
            .get_mut(&(lb_id.to_string(), port, protocol))
            .ok_or_else(|| not_found("listener", &resource))?;
        listener.status = ListenerStatus::Running;
        Ok(())
    }
}

#[async_trait]
impl NlbProvider for MemoryCloud {
    async fn find_nlb_by_id(&self, id: &str) -> Result<Option<NlbAttributes>> {
        let mut state = self.state.lock().await;
        state.read("GetLoadBalancerAttribute", id);
        Ok(state.nlbs.get(id).cloned())
    }

    async fn find_nlb_by_tags(&self, tags: &[Tag]) -> Result<Option<NlbAttributes>> {
        let mut state = self.state.lock().await;
        state.read("ListLoadBalancers", "tags");
        Ok(state.nlbs.values().find(|a| has_tags(&a.tags, tags)).cloned())
    }

    async fn create_nlb(&self, attrs: &NlbAttributes) -> Result<String> {
        let mut state = self.state.lock().await;
        let name = attrs.name.clone().unwrap_or_default();
        state.write("CreateLoadBalancer", &name)?;
        let id = state.next_id("nlb");
        let mut created = attrs.clone();
        created.load_balancer_id = id.clone();
        created.dns_name = Some(format!("{id}.cn-hangzhou.nlb.aliyuncs.com"));
        state.nlbs.insert(id.clone(), created);
        Ok(id)
    }

    async fn update_nlb(&self, id: &str, update: &NlbAttributeUpdate) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("UpdateLoadBalancerAttribute", id)?;
        let attrs = state.nlbs.get_mut(id).ok_or_else(|| not_found("load balancer", id))?;
        if let Some(name) = &update.name {
            attrs.name = Some(name.clone());
        }
        if let Some(dp) = update.delete_protection {
            attrs.delete_protection = Some(dp);
        }
        if let Some(mp) = update.modification_protection {
            attrs.modification_protection = Some(mp);
        }
        if let Some(zones) = &update.zone_mappings {
            attrs.zone_mappings = zones.clone();
        }
        Ok(state.new_job())
    }

    async fn delete_nlb(&self, id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("DeleteLoadBalancer", id)?;
        let attrs = state.nlbs.get(id).ok_or_else(|| not_found("load balancer", id))?;
        if attrs.delete_protection == Some(true) {
            return Err(Error::cloud(
                "LoadBalancer.DeleteProtectionEnabled",
                format!("load balancer {id} has delete protection on"),
            ));
        }
        state.nlbs.remove(id);
        state.nlb_listeners.retain(|_, (lb, _)| lb != id);
        Ok(state.new_job())
    }

    async fn list_nlb_server_groups(&self, tags: &[Tag]) -> Result<Vec<ServerGroup>> {
        let mut state = self.state.lock().await;
        state.read("ListServerGroups", "tags");
        Ok(state
            .nlb_groups
            .values()
            .filter(|(_, t)| has_tags(t, tags))
            .map(|(g, _)| g.clone())
            .collect())
    }

    async fn get_nlb_server_group(&self, id: &str) -> Result<Option<ServerGroup>> {
        let mut state = self.state.lock().await;
        state.read("ListServerGroups", id);
        Ok(state.nlb_groups.get(id).map(|(g, _)| g.clone()))
    }

    async fn create_nlb_server_group(
        &self,
        group: &ServerGroup,
        _vpc_id: &str,
        tags: &[Tag],
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("CreateServerGroup", &group.name)?;
        let id = state.next_id("sgp");
        let created = ServerGroup {
            id: id.clone(),
            name: group.name.clone(),
            attributes: group.attributes.clone(),
            ..Default::default()
        };
        state.nlb_groups.insert(id.clone(), (created, tags.to_vec()));
        Ok(id)
    }

    async fn update_nlb_server_group(&self, id: &str, attrs: &ServerGroupAttributes) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("UpdateServerGroupAttribute", id)?;
        let (group, _) = state
            .nlb_groups
            .get_mut(id)
            .ok_or_else(|| not_found("server group", id))?;
        group.attributes = attrs.clone();
        Ok(state.new_job())
    }

    async fn delete_nlb_server_group(&self, id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("DeleteServerGroup", id)?;
        if state
            .nlb_listeners
            .values()
            .any(|(_, l)| l.server_group_id == id)
        {
            return Err(Error::cloud(
                "ResourceInUse.ServerGroup",
                format!("server group {id} is still used by a listener"),
            ));
        }
        state
            .nlb_groups
            .remove(id)
            .ok_or_else(|| not_found("server group", id))?;
        Ok(state.new_job())
    }

    async fn add_nlb_servers(&self, group_id: &str, backends: &[Backend]) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("AddServersToServerGroup", group_id)?;
        check_batch(backends, NLB_MAX_BACKENDS_PER_CALL)?;
        let (group, _) = state
            .nlb_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("server group", group_id))?;
        add_backends(group, backends)?;
        Ok(state.new_job())
    }

    async fn remove_nlb_servers(&self, group_id: &str, backends: &[Backend]) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("RemoveServersFromServerGroup", group_id)?;
        check_batch(backends, NLB_MAX_BACKENDS_PER_CALL)?;
        let (group, _) = state
            .nlb_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("server group", group_id))?;
        remove_backends(group, backends);
        Ok(state.new_job())
    }

    async fn update_nlb_servers(&self, group_id: &str, backends: &[Backend]) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("UpdateServerGroupServersAttribute", group_id)?;
        check_batch(backends, NLB_MAX_BACKENDS_PER_CALL)?;
        let (group, _) = state
            .nlb_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("server group", group_id))?;
        update_backends(group, backends)?;
        Ok(state.new_job())
    }

    async fn list_nlb_listeners(&self, lb_id: &str) -> Result<Vec<NlbListener>> {
        let mut state = self.state.lock().await;
        state.read("ListListeners", lb_id);
        Ok(state
            .nlb_listeners
            .values()
            .filter(|(lb, _)| lb == lb_id)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn create_nlb_listener(&self, lb_id: &str, listener: &NlbListener) -> Result<String> {
        let mut state = self.state.lock().await;
        let resource = format!("{lb_id}:{}/{}", listener.protocol, listener.port);
        state.write("CreateListener", &resource)?;
        if !state.nlbs.contains_key(lb_id) {
            return Err(not_found("load balancer", lb_id));
        }
        if !state.nlb_groups.contains_key(&listener.server_group_id) {
            return Err(not_found("server group", &listener.server_group_id));
        }
        if state.nlb_listeners.values().any(|(lb, l)| {
            lb == lb_id && l.port == listener.port && l.protocol == listener.protocol
        }) {
            return Err(Error::cloud(
                "Conflict.Port",
                format!("{} {} is already used on {lb_id}", listener.protocol, listener.port),
            ));
        }
        let id = state.next_id("lsn");
        let mut created = listener.clone();
        created.listener_id = id.clone();
        created.status = ListenerStatus::Running;
        state.nlb_listeners.insert(id, (lb_id.to_string(), created));
        Ok(state.new_job())
    }

    async fn update_nlb_listener(&self, listener: &NlbListener) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("UpdateListenerAttribute", &listener.listener_id)?;
        let (_, existing) = state
            .nlb_listeners
            .get_mut(&listener.listener_id)
            .ok_or_else(|| not_found("listener", &listener.listener_id))?;
        let status = existing.status;
        *existing = listener.clone();
        existing.status = status;
        Ok(state.new_job())
    }

    async fn delete_nlb_listener(&self, listener_id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.write("DeleteListener", listener_id)?;
        state
            .nlb_listeners
            .remove(listener_id)
            .ok_or_else(|| not_found("listener", listener_id))?;
        Ok(state.new_job())
    }

    async fn describe_job(&self, job_id: &str) -> Result<JobStatus> {
        let mut state = self.state.lock().await;
        state.read("GetJobStatus", job_id);
        let remaining = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| not_found("job", job_id))?;
        if *remaining == 0 {
            return Ok(JobStatus::Succeeded);
        }
        *remaining -= 1;
        Ok(JobStatus::Processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_conflict_is_consumed() {
        let cloud = MemoryCloud::new();
        cloud.inject_conflicts("CreateLoadBalancer", 1).await;
        let attrs = ClbAttributes::default();
        assert!(cloud.create_clb(&attrs).await.unwrap_err().is_conflict());
        let id = cloud.create_clb(&attrs).await.unwrap();
        assert!(cloud.clb(&id).await.is_some());
        assert_eq!(cloud.mutating_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_protection_blocks_delete() {
        let cloud = MemoryCloud::new();
        let id = cloud
            .insert_clb(ClbAttributes {
                delete_protection: Some(true),
                ..Default::default()
            })
            .await;
        assert!(cloud.delete_clb(&id).await.is_err());
        cloud
            .update_clb(
                &id,
                &ClbAttributeUpdate {
                    delete_protection: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        cloud.delete_clb(&id).await.unwrap();
        assert_eq!(cloud.clb_count().await, 0);
    }

    #[tokio::test]
    async fn test_backend_batch_limit() {
        let cloud = MemoryCloud::new();
        let lb = cloud.insert_clb(ClbAttributes::default()).await;
        let group = cloud.create_vserver_group(&lb, "g").await.unwrap();
        let too_many: Vec<Backend> = (0..41)
            .map(|i| Backend::instance(format!("i-{i}"), 80, 100))
            .collect();
        assert!(cloud.add_vserver_group_backends(&group, &too_many).await.is_err());
        cloud
            .add_vserver_group_backends(&group, &too_many[..40])
            .await
            .unwrap();
        assert_eq!(cloud.vserver_groups(&lb).await[0].backends.len(), 40);
    }

    #[tokio::test]
    async fn test_jobs_finish_after_polls() {
        let cloud = MemoryCloud::new().with_job_polls(2);
        let lb = cloud.insert_nlb(NlbAttributes::default()).await;
        let job = cloud
            .update_nlb(&lb, &NlbAttributeUpdate::default())
            .await
            .unwrap();
        assert_eq!(cloud.describe_job(&job).await.unwrap(), JobStatus::Processing);
        assert_eq!(cloud.describe_job(&job).await.unwrap(), JobStatus::Processing);
        assert_eq!(cloud.describe_job(&job).await.unwrap(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_eni_lookup() {
        let cloud = MemoryCloud::new().with_eni("10.0.0.5", "eni-5");
        let found = cloud
            .resolve_eni_ids("vpc-1", &["10.0.0.5".to_string(), "10.0.0.6".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("10.0.0.5").map(String::as_str), Some("eni-5"));
    }
}
