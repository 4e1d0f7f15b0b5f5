//! Group and listener stages run side by side

use std::collections::HashMap;

use tracing::info;

use crate::diff::diff_listeners;
use crate::error::AggregateError;
use crate::model::ServerGroup;

use super::context::RequestContext;
use super::executor::{completion_queue, run_listener_stage, BoundListener, ListenerOps};
use super::server_group::{plan_group_actions, run_group_stage, GroupAction, ServerGroupOps};

/// Remote and local children of one load balancer
pub struct Children<'a, L> {
    pub remote_groups: &'a [ServerGroup],
    pub local_groups: &'a [ServerGroup],
    pub remote_listeners: &'a [L],
    pub local_listeners: &'a [L],
}

/// Apply server groups and listeners concurrently, collecting every failure
///
/// Group creations hand their ids to the listener stage through a
/// completion queue sized for the number of creations.
pub async fn apply_children<L, G, O>(
    req: &RequestContext,
    groups: &G,
    listeners: &O,
    children: Children<'_, L>,
    skip_listener_updates: bool,
) -> AggregateError
where
    L: BoundListener,
    G: ServerGroupOps + ?Sized,
    O: ListenerOps<L> + ?Sized,
{
    let mut errors = AggregateError::new();

    let actions = match plan_group_actions(children.remote_groups, children.local_groups) {
        Ok(actions) => actions,
        Err(e) => {
            errors.push(e);
            return errors;
        }
    };

    let known: HashMap<String, String> = actions
        .iter()
        .filter_map(|a| match a {
            GroupAction::Update { remote, local } => Some((local.name.clone(), remote.id.clone())),
            GroupAction::Create(_) => None,
        })
        .collect();
    let creations = actions
        .iter()
        .filter(|a| matches!(a, GroupAction::Create(_)))
        .count();

    let diff = diff_listeners(
        children.remote_listeners,
        children.local_listeners,
        &req.name,
        req.cluster_id(),
    );
    info!(
        service = %req.name,
        groups = actions.len(),
        new_groups = creations,
        create_listeners = diff.create.len(),
        update_listeners = if skip_listener_updates { 0 } else { diff.update.len() },
        delete_listeners = diff.delete.len(),
        "applying load balancer children"
    );

    let (tx, queue) = completion_queue(creations);
    let (group_errors, listener_errors) = tokio::join!(
        run_group_stage(
            groups,
            actions,
            tx,
            req.opts.server_group_concurrency,
            &req.opts.conflict_retry,
        ),
        run_listener_stage(listeners, diff, known, queue, skip_listener_updates),
    );
    errors.extend(group_errors.errors);
    errors.extend(listener_errors.errors);
    errors
}
