//! Structural comparison of local and remote models
//!
//! All three comparators are set differences over the uniqueness keys of
//! the compared items. None of them talks to the cloud; the appliers turn
//! their output into calls.

use std::collections::{HashMap, HashSet};

use crate::model::{
    is_default_tag_key, Backend, BackendKey, ListenerIdentity, NamespacedName, Tag,
    MAX_TAGS_PER_RESOURCE,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendDiff {
    pub add: Vec<Backend>,
    pub delete: Vec<Backend>,
    pub update: Vec<Backend>,
}

impl BackendDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty() && self.update.is_empty()
    }
}

/// Compare the backends of one server group
///
/// Remote backends marked user-managed are never deleted or rewritten, and a
/// local backend whose key matches one of them is dropped. Updates carry the
/// local value.
pub fn diff_backends(remote: &[Backend], local: &[Backend], ignore_weight_update: bool) -> BackendDiff {
    let remote_by_key: HashMap<BackendKey, &Backend> = remote.iter().map(|b| (b.key(), b)).collect();
    let local_keys: HashSet<BackendKey> = local.iter().map(Backend::key).collect();

    let mut diff = BackendDiff::default();
    for r in remote {
        if !r.is_user_managed && !local_keys.contains(&r.key()) {
            diff.delete.push(r.clone());
        }
    }
    for l in local {
        match remote_by_key.get(&l.key()) {
            None => diff.add.push(l.clone()),
            Some(r) if r.is_user_managed => {}
            Some(r) => {
                let weight_changed = !ignore_weight_update && r.weight != l.weight;
                if r.port != l.port || weight_changed || r.description != l.description {
                    diff.update.push(l.clone());
                }
            }
        }
    }
    diff
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerDiff<L> {
    pub create: Vec<L>,
    /// `(remote, local)` pairs matched by port and protocol
    pub update: Vec<(L, L)>,
    pub delete: Vec<L>,
}

impl<L> Default for ListenerDiff<L> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

/// Match listeners by `(port, protocol)`
///
/// Unmatched remote listeners are deleted only when their NamedKey belongs
/// to `svc` in `cluster_id`.
pub fn diff_listeners<L>(
    remote: &[L],
    local: &[L],
    svc: &NamespacedName,
    cluster_id: &str,
) -> ListenerDiff<L>
where
    L: ListenerIdentity + Clone,
{
    let local_by_key: HashMap<L::Key, &L> = local.iter().map(|l| (l.match_key(), l)).collect();
    let remote_keys: HashSet<L::Key> = remote.iter().map(ListenerIdentity::match_key).collect();

    let mut diff = ListenerDiff::default();
    for r in remote {
        match local_by_key.get(&r.match_key()) {
            Some(l) => diff.update.push((r.clone(), (*l).clone())),
            None => {
                let owned = r
                    .named_key()
                    .map(|k| k.is_managed_by(svc, cluster_id))
                    .unwrap_or(false);
                if owned {
                    diff.delete.push(r.clone());
                }
            }
        }
    }
    for l in local {
        if !remote_keys.contains(&l.match_key()) {
            diff.create.push(l.clone());
        }
    }
    diff
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub tag: Vec<Tag>,
    pub untag: Vec<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.tag.is_empty() && self.untag.is_empty()
    }

    pub fn tag_batches(&self) -> impl Iterator<Item = &[Tag]> {
        self.tag.chunks(MAX_TAGS_PER_RESOURCE)
    }

    pub fn untag_batches(&self) -> impl Iterator<Item = &[String]> {
        self.untag.chunks(MAX_TAGS_PER_RESOURCE)
    }
}

/// Tags to add or change and keys to remove, ignoring the default tag set
///
/// Desired tags beyond [`MAX_TAGS_PER_RESOURCE`] are dropped.
pub fn diff_tags(remote: &[Tag], local: &[Tag]) -> TagDiff {
    let remote_by_key: HashMap<&str, &str> = remote
        .iter()
        .filter(|t| !is_default_tag_key(&t.key))
        .map(|t| (t.key.as_str(), t.value.as_str()))
        .collect();
    let local: Vec<&Tag> = local
        .iter()
        .filter(|t| !is_default_tag_key(&t.key))
        .take(MAX_TAGS_PER_RESOURCE)
        .collect();
    let local_keys: HashSet<&str> = local.iter().map(|t| t.key.as_str()).collect();

    let tag = local
        .iter()
        .filter(|t| remote_by_key.get(t.key.as_str()) != Some(&t.value.as_str()))
        .map(|t| (*t).clone())
        .collect();
    let mut untag: Vec<String> = remote_by_key
        .keys()
        .filter(|k| !local_keys.contains(*k))
        .map(|k| k.to_string())
        .collect();
    untag.sort();
    TagDiff { tag, untag }
}
