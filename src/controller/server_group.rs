//! Server group stage shared by the CLB and NLB appliers

use std::collections::HashSet;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::diff::{diff_backends, BackendDiff};
use crate::error::{AggregateError, Error, Result};
use crate::model::{Backend, NamespacedName, ServerGroup};
use crate::retry::{retry_on_conflict, RetryConfig};

use super::executor::{run_bounded, CompletionSender};

/// Cloud calls behind one server group family
#[async_trait]
pub trait ServerGroupOps: Send + Sync {
    /// Most backends a single add/remove/update call may carry
    fn batch_size(&self) -> usize;

    async fn create_group(&self, group: &ServerGroup) -> Result<String>;

    /// Reconcile group-level attributes
    async fn update_attributes(&self, _remote: &ServerGroup, _local: &ServerGroup) -> Result<()> {
        Ok(())
    }

    async fn add_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()>;
    async fn remove_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()>;
    async fn update_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()>;
    async fn delete_group(&self, group_id: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub enum GroupAction {
    Create(ServerGroup),
    Update {
        remote: ServerGroup,
        local: ServerGroup,
    },
}

impl GroupAction {
    pub fn name(&self) -> &str {
        match self {
            GroupAction::Create(g) => &g.name,
            GroupAction::Update { local, .. } => &local.name,
        }
    }
}

/// Pair every local group with its remote counterpart
///
/// User-managed groups are matched by id and must exist; controller groups
/// are matched by name and created when missing.
pub fn plan_group_actions(remote: &[ServerGroup], local: &[ServerGroup]) -> Result<Vec<GroupAction>> {
    let mut actions = Vec::with_capacity(local.len());
    for l in local {
        let matched = if l.is_user_managed {
            let found = remote.iter().find(|r| r.id == l.id);
            if found.is_none() {
                return Err(Error::NotFound(format!(
                    "server group {} from annotation does not exist on the load balancer",
                    l.id
                )));
            }
            found
        } else {
            remote.iter().find(|r| r.name == l.name)
        };

        actions.push(match matched {
            Some(r) => {
                let mut local = l.clone();
                local.id = r.id.clone();
                GroupAction::Update {
                    remote: r.clone(),
                    local,
                }
            }
            None => GroupAction::Create(l.clone()),
        });
    }
    Ok(actions)
}

/// Run the group actions on a bounded pool
///
/// Each creation publishes its id (or failure) on `completions` as soon as
/// it is known; backends are seeded afterwards. The sender is dropped when
/// the stage finishes so listeners waiting on a group nobody creates fail
/// instead of hanging.
pub async fn run_group_stage<O>(
    ops: &O,
    actions: Vec<GroupAction>,
    completions: CompletionSender,
    concurrency: usize,
    retry: &RetryConfig,
) -> AggregateError
where
    O: ServerGroupOps + ?Sized,
{
    let completions = &completions;
    run_bounded(actions, concurrency, |action| {
        apply_group(ops, action, completions, retry)
    })
    .await
}

async fn apply_group<O>(
    ops: &O,
    action: GroupAction,
    completions: &CompletionSender,
    retry: &RetryConfig,
) -> Result<()>
where
    O: ServerGroupOps + ?Sized,
{
    match action {
        GroupAction::Create(local) => {
            let created = retry_on_conflict(retry, "create server group", || {
                ops.create_group(&local)
            })
            .await;
            let id = match created {
                Ok(id) => {
                    info!(group = %local.name, %id, "created server group");
                    completions.send(&local.name, Ok(id.clone())).await;
                    id
                }
                Err(e) => {
                    completions.send(&local.name, Err(e.to_string())).await;
                    return Err(e);
                }
            };
            let diff = diff_backends(&[], &local.backends, local.ignore_weight_update);
            sync_backends(ops, &id, &local.name, diff, retry).await
        }
        GroupAction::Update { remote, local } => {
            retry_on_conflict(retry, "update server group", || {
                ops.update_attributes(&remote, &local)
            })
            .await?;
            let diff = diff_backends(&remote.backends, &local.backends, local.ignore_weight_update);
            sync_backends(ops, &remote.id, &local.name, diff, retry).await
        }
    }
}

/// Add, then update, then remove, in batches
///
/// A failed batch does not stop the remaining ones; failures come back together.
async fn sync_backends<O>(
    ops: &O,
    group_id: &str,
    group_name: &str,
    diff: BackendDiff,
    retry: &RetryConfig,
) -> Result<()>
where
    O: ServerGroupOps + ?Sized,
{
    if diff.is_empty() {
        debug!(group = group_name, "backends up to date");
        return Ok(());
    }
    info!(
        group = group_name,
        add = diff.add.len(),
        update = diff.update.len(),
        delete = diff.delete.len(),
        "syncing backends"
    );

    let size = ops.batch_size().max(1);
    let mut errors = AggregateError::new();
    for batch in diff.add.chunks(size) {
        if let Err(e) =
            retry_on_conflict(retry, "add backends", || ops.add_backends(group_id, batch)).await
        {
            warn!(group = group_name, error = %e, "failed to add backends");
            errors.push(e);
        }
    }
    for batch in diff.update.chunks(size) {
        if let Err(e) =
            retry_on_conflict(retry, "update backends", || ops.update_backends(group_id, batch))
                .await
        {
            warn!(group = group_name, error = %e, "failed to update backends");
            errors.push(e);
        }
    }
    for batch in diff.delete.chunks(size) {
        if let Err(e) =
            retry_on_conflict(retry, "remove backends", || ops.remove_backends(group_id, batch))
                .await
        {
            warn!(group = group_name, error = %e, "failed to remove backends");
            errors.push(e);
        }
    }
    errors.into_result()
}

/// Remove what the Service no longer needs from the remote groups
///
/// Owned groups missing from `local` are deleted unless a listener still
/// points at them (`in_use` holds those ids). Groups the Service does not
/// own only lose the backends it added.
#[allow(clippy::too_many_arguments)]
pub async fn cleanup_groups<O>(
    ops: &O,
    remote: &[ServerGroup],
    local: &[ServerGroup],
    in_use: &HashSet<String>,
    svc: &NamespacedName,
    cluster_id: &str,
    concurrency: usize,
    retry: &RetryConfig,
) -> AggregateError
where
    O: ServerGroupOps + ?Sized,
{
    let wanted_ids: HashSet<&str> = local
        .iter()
        .filter(|g| !g.id.is_empty())
        .map(|g| g.id.as_str())
        .collect();
    let wanted_names: HashSet<&str> = local.iter().map(|g| g.name.as_str()).collect();

    let stale: Vec<&ServerGroup> = remote
        .iter()
        .filter(|r| !wanted_ids.contains(r.id.as_str()) && !wanted_names.contains(r.name.as_str()))
        .collect();

    run_bounded(stale, concurrency, |group| async move {
        if group.is_owned_by(svc, cluster_id) && !group.is_user_managed {
            if in_use.contains(&group.id) {
                warn!(group = %group.name, id = %group.id, "stale server group still bound to a listener, keeping it");
                return Ok(());
            }
            info!(group = %group.name, id = %group.id, "deleting stale server group");
            return retry_on_conflict(retry, "delete server group", || ops.delete_group(&group.id))
                .await;
        }

        let ours: Vec<Backend> = group
            .backends
            .iter()
            .filter(|b| !b.is_user_managed)
            .cloned()
            .collect();
        if ours.is_empty() {
            return Ok(());
        }
        info!(group = %group.name, id = %group.id, count = ours.len(), "releasing backends from foreign server group");
        let diff = BackendDiff {
            delete: ours,
            ..Default::default()
        };
        sync_backends(ops, &group.id, &group.name, diff, retry).await
    })
    .boxed()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::executor::completion_queue;
    use crate::model::NamedKey;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_create: bool,
    }

    #[async_trait]
    impl ServerGroupOps for Recorder {
        fn batch_size(&self) -> usize {
            2
        }

        async fn create_group(&self, group: &ServerGroup) -> Result<String> {
            self.calls.lock().await.push(format!("create {}", group.name));
            if self.fail_create {
                return Err(Error::cloud("QuotaExceeded", "too many groups"));
            }
            Ok(format!("id-{}", group.name))
        }

        async fn add_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
            self.calls
                .lock()
                .await
                .push(format!("add {group_id} {}", backends.len()));
            Ok(())
        }

        async fn remove_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
            self.calls
                .lock()
                .await
                .push(format!("remove {group_id} {}", backends.len()));
            Ok(())
        }

        async fn update_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
            self.calls
                .lock()
                .await
                .push(format!("update {group_id} {}", backends.len()));
            Ok(())
        }

        async fn delete_group(&self, group_id: &str) -> Result<()> {
            self.calls.lock().await.push(format!("delete {group_id}"));
            Ok(())
        }
    }

    fn svc() -> NamespacedName {
        NamespacedName::new("default", "web")
    }

    fn owned_group(port: i32, backends: Vec<Backend>) -> ServerGroup {
        let key = NamedKey::clb(&svc(), "c-1", port);
        ServerGroup {
            name: key.key(),
            named_key: Some(key),
            backends,
            ..Default::default()
        }
    }

    fn instances(n: usize) -> Vec<Backend> {
        (0..n)
            .map(|i| Backend::instance(format!("i-{i}"), 30080, 100))
            .collect()
    }

    #[test]
    fn test_plan_matches_by_name_and_user_id() {
        let mut remote_owned = owned_group(80, vec![]);
        remote_owned.id = "rsp-1".into();
        let user_remote = ServerGroup {
            id: "rsp-user".into(),
            name: "handmade".into(),
            ..Default::default()
        };
        let user_local = ServerGroup {
            id: "rsp-user".into(),
            name: "rsp-user".into(),
            is_user_managed: true,
            ..Default::default()
        };
        let actions = plan_group_actions(
            &[remote_owned, user_remote],
            &[owned_group(80, vec![]), owned_group(443, vec![]), user_local],
        )
        .unwrap();
        assert!(matches!(&actions[0], GroupAction::Update { local, .. } if local.id == "rsp-1"));
        assert!(matches!(&actions[1], GroupAction::Create(_)));
        assert!(matches!(&actions[2], GroupAction::Update { remote, .. } if remote.name == "handmade"));
    }

    #[test]
    fn test_plan_rejects_missing_user_group() {
        let local = ServerGroup {
            id: "rsp-gone".into(),
            is_user_managed: true,
            ..Default::default()
        };
        assert!(plan_group_actions(&[], &[local]).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_publishes_id_and_seeds_in_batches() {
        let ops = Recorder::default();
        let (tx, mut queue) = completion_queue(1);
        let group = owned_group(80, instances(5));
        let name = group.name.clone();

        let errors = run_group_stage(
            &ops,
            vec![GroupAction::Create(group)],
            tx,
            2,
            &RetryConfig::immediate(1),
        )
        .await;
        assert!(errors.is_empty());
        assert_eq!(queue.wait_for(&name).await.unwrap(), format!("id-{name}"));

        let calls = ops.calls.lock().await.clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], format!("create {name}"));
        assert!(calls[1..].iter().all(|c| c.starts_with("add ")));
    }

    #[tokio::test]
    async fn test_failed_create_is_published() {
        let ops = Recorder {
            fail_create: true,
            ..Default::default()
        };
        let (tx, mut queue) = completion_queue(1);
        let group = owned_group(80, instances(1));
        let name = group.name.clone();
        let errors = run_group_stage(
            &ops,
            vec![GroupAction::Create(group)],
            tx,
            1,
            &RetryConfig::immediate(1),
        )
        .await;
        assert_eq!(errors.len(), 1);
        assert!(queue.wait_for(&name).await.is_err());
    }

    #[tokio::test]
    async fn test_update_applies_add_update_remove() {
        let ops = Recorder::default();
        let (tx, _queue) = completion_queue(1);
        let mut remote = owned_group(80, instances(3));
        remote.id = "rsp-1".into();
        let mut local_backends = instances(2);
        local_backends[0].weight = 50;
        local_backends.push(Backend::instance("i-new", 30080, 100));
        let mut local = owned_group(80, local_backends);
        local.id = "rsp-1".into();

        let errors = run_group_stage(
            &ops,
            vec![GroupAction::Update { remote, local }],
            tx,
            1,
            &RetryConfig::immediate(1),
        )
        .await;
        assert!(errors.is_empty());
        assert_eq!(
            *ops.calls.lock().await,
            vec![
                "add rsp-1 1".to_string(),
                "update rsp-1 1".to_string(),
                "remove rsp-1 1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_respects_ownership() {
        let ops = Recorder::default();
        let mut stale = owned_group(81, instances(1));
        stale.id = "rsp-stale".into();
        let mut bound = owned_group(82, vec![]);
        bound.id = "rsp-bound".into();

        let mut ours = Backend::instance("i-ours", 30080, 100);
        ours.description = NamedKey::clb(&svc(), "c-1", 80).key();
        let mut theirs = Backend::instance("i-theirs", 80, 100);
        theirs.is_user_managed = true;
        let foreign = ServerGroup {
            id: "rsp-foreign".into(),
            name: "user-pool".into(),
            backends: vec![ours, theirs],
            ..Default::default()
        };

        let other_svc = NamespacedName::new("default", "other");
        let other_key = NamedKey::clb(&other_svc, "c-1", 80);
        let mut other_backend = Backend::instance("i-other", 30081, 100);
        other_backend.is_user_managed = true;
        let others = ServerGroup {
            id: "rsp-other".into(),
            name: other_key.key(),
            named_key: Some(other_key),
            backends: vec![other_backend],
            ..Default::default()
        };

        let in_use = HashSet::from(["rsp-bound".to_string()]);
        let errors = cleanup_groups(
            &ops,
            &[stale, bound, foreign, others],
            &[],
            &in_use,
            &svc(),
            "c-1",
            1,
            &RetryConfig::immediate(1),
        )
        .await;
        assert!(errors.is_empty());
        assert_eq!(
            *ops.calls.lock().await,
            vec![
                "delete rsp-stale".to_string(),
                "remove rsp-foreign 1".to_string(),
            ]
        );
    }
}
