//! Concurrent apply machinery
//!
//! Server group actions run on a bounded worker pool. Every group creation
//! reports its new id on a [`CompletionQueue`]; the listener stage, running
//! alongside, consumes those ids for listeners that point at groups that
//! did not exist when the reconcile started.
//!
//! Listener actions run in this order:
//! 1. deletions of listeners no other listener forwards to
//! 2. creations and updates whose server group already exists
//! 3. creations and updates waiting on a server group being created
//! 4. creations of forwarding listeners
//! 5. deletions of forward targets

use std::collections::{HashMap, HashSet};
use std::future::Future;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::diff::ListenerDiff;
use crate::error::{AggregateError, Error, Result};
use crate::model::ListenerIdentity;

/// Run `f` over `items` with at most `concurrency` in flight, collecting failures
pub async fn run_bounded<T, F, Fut>(items: Vec<T>, concurrency: usize, f: F) -> AggregateError
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let results: Vec<Result<()>> = stream::iter(items)
        .map(f)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut errors = AggregateError::new();
    errors.extend(results.into_iter().filter_map(Result::err));
    errors
}

/// Outcome of one server group creation
#[derive(Clone, Debug)]
pub struct GroupCompletion {
    pub name: String,
    pub result: std::result::Result<String, String>,
}

/// Producer half, owned by the server group stage
#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<GroupCompletion>,
}

impl CompletionSender {
    pub async fn send(&self, name: &str, result: std::result::Result<String, String>) {
        let completion = GroupCompletion {
            name: name.to_string(),
            result,
        };
        if self.tx.send(completion).await.is_err() {
            debug!(group = name, "listener stage already finished");
        }
    }
}

/// Consumer half, owned by the listener stage
pub struct CompletionQueue {
    rx: mpsc::Receiver<GroupCompletion>,
    done: HashMap<String, std::result::Result<String, String>>,
}

/// Queue sized for `creations` group creations, so producers never block
pub fn completion_queue(creations: usize) -> (CompletionSender, CompletionQueue) {
    let (tx, rx) = mpsc::channel(creations.max(1));
    (
        CompletionSender { tx },
        CompletionQueue {
            rx,
            done: HashMap::new(),
        },
    )
}

impl CompletionQueue {
    /// Wait until the group called `name` has been created
    pub async fn wait_for(&mut self, name: &str) -> Result<String> {
        loop {
            if let Some(result) = self.done.get(name) {
                return result.clone().map_err(|e| {
                    Error::NotFound(format!("server group {name} was not created: {e}"))
                });
            }
            match self.rx.recv().await {
                Some(completion) => {
                    self.done.insert(completion.name, completion.result);
                }
                None => {
                    return Err(Error::NotFound(format!(
                        "server group {name} is neither present nor being created"
                    )))
                }
            }
        }
    }
}

/// Listener shape the stage needs beyond identity
pub trait BoundListener: ListenerIdentity + Clone + Send + Sync {
    /// Server group the listener sends traffic to, `None` when it forwards
    fn group_name(&self) -> Option<&str>;
    fn set_group_id(&mut self, id: &str);
    /// Key of the listener this one redirects to
    fn forward_target(&self) -> Option<Self::Key>;
}

#[async_trait]
pub trait ListenerOps<L>: Send + Sync {
    async fn create(&self, listener: &L) -> Result<()>;
    /// Reconcile attributes; a no-op when nothing material differs
    async fn update(&self, remote: &L, local: &L) -> Result<()>;
    async fn delete(&self, listener: &L) -> Result<()>;
}

enum Pending<L> {
    Create(L),
    Update(L, L),
}

impl<L: BoundListener> Pending<L> {
    fn local(&self) -> &L {
        match self {
            Pending::Create(l) | Pending::Update(_, l) => l,
        }
    }

    fn local_mut(&mut self) -> &mut L {
        match self {
            Pending::Create(l) | Pending::Update(_, l) => l,
        }
    }
}

async fn run_pending<L, O>(ops: &O, mut pending: Pending<L>, group_id: Option<&str>) -> Result<()>
where
    L: BoundListener,
    O: ListenerOps<L> + ?Sized,
{
    if let Some(id) = group_id {
        pending.local_mut().set_group_id(id);
    }
    match &pending {
        Pending::Create(l) => ops.create(l).await,
        Pending::Update(r, l) => ops.update(r, l).await,
    }
}

/// Apply a listener diff in dependency order
///
/// `known_groups` maps names of existing server groups to their ids.
/// With `skip_updates`, matched listeners are left as they are.
pub async fn run_listener_stage<L, O>(
    ops: &O,
    diff: ListenerDiff<L>,
    mut known_groups: HashMap<String, String>,
    mut completions: CompletionQueue,
    skip_updates: bool,
) -> AggregateError
where
    L: BoundListener,
    O: ListenerOps<L> + ?Sized,
{
    let mut errors = AggregateError::new();

    let forward_targets: HashSet<L::Key> = diff
        .update
        .iter()
        .map(|(remote, _)| remote)
        .chain(diff.delete.iter())
        .filter_map(BoundListener::forward_target)
        .collect();
    let (late_deletes, early_deletes): (Vec<L>, Vec<L>) = diff
        .delete
        .into_iter()
        .partition(|l| forward_targets.contains(&l.match_key()));

    for l in &early_deletes {
        if let Err(e) = ops.delete(l).await {
            errors.push(e);
        }
    }

    let mut ready = Vec::new();
    let mut waiting = Vec::new();
    let mut forwarding = Vec::new();
    let pending = diff
        .create
        .into_iter()
        .map(Pending::Create)
        .chain(
            diff.update
                .into_iter()
                .filter(|_| !skip_updates)
                .map(|(r, l)| Pending::Update(r, l)),
        );
    for p in pending {
        match p.local().group_name() {
            None if matches!(p, Pending::Create(_)) => forwarding.push(p),
            None => ready.push(p),
            Some(name) if known_groups.contains_key(name) => ready.push(p),
            Some(_) => waiting.push(p),
        }
    }

    for p in ready {
        let id = p
            .local()
            .group_name()
            .and_then(|n| known_groups.get(n))
            .cloned();
        if let Err(e) = run_pending(ops, p, id.as_deref()).await {
            errors.push(e);
        }
    }

    for p in waiting {
        let Some(name) = p.local().group_name().map(str::to_string) else {
            continue;
        };
        match completions.wait_for(&name).await {
            Ok(id) => {
                known_groups.insert(name, id.clone());
                if let Err(e) = run_pending(ops, p, Some(&id)).await {
                    errors.push(e);
                }
            }
            Err(e) => {
                warn!(group = %name, "listener skipped: {e}");
                errors.push(e);
            }
        }
    }

    for p in forwarding {
        if let Err(e) = run_pending(ops, p, None).await {
            errors.push(e);
        }
    }

    for l in &late_deletes {
        if let Err(e) = ops.delete(l).await {
            errors.push(e);
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NamedKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    struct TestListener {
        port: i32,
        group: Option<String>,
        group_id: String,
        forward_to: Option<i32>,
    }

    impl ListenerIdentity for TestListener {
        type Key = i32;

        fn match_key(&self) -> i32 {
            self.port
        }

        fn named_key(&self) -> Option<&NamedKey> {
            None
        }
    }

    impl BoundListener for TestListener {
        fn group_name(&self) -> Option<&str> {
            self.group.as_deref()
        }

        fn set_group_id(&mut self, id: &str) {
            self.group_id = id.to_string();
        }

        fn forward_target(&self) -> Option<i32> {
            self.forward_to
        }
    }

    fn listener(port: i32, group: Option<&str>, forward_to: Option<i32>) -> TestListener {
        TestListener {
            port,
            group: group.map(str::to_string),
            group_id: String::new(),
            forward_to,
        }
    }

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    #[async_trait]
    impl ListenerOps<TestListener> for Log {
        async fn create(&self, l: &TestListener) -> Result<()> {
            self.0.lock().await.push(format!("create {} {}", l.port, l.group_id));
            Ok(())
        }

        async fn update(&self, _r: &TestListener, l: &TestListener) -> Result<()> {
            self.0.lock().await.push(format!("update {} {}", l.port, l.group_id));
            Ok(())
        }

        async fn delete(&self, l: &TestListener) -> Result<()> {
            self.0.lock().await.push(format!("delete {}", l.port));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_bounded_limits_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let errors = run_bounded((0..10).collect(), 3, |i: i32| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if i == 4 {
                    Err(Error::Conflict("busy".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(errors.len(), 1);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_listener_waits_for_group_creation() {
        let (tx, queue) = completion_queue(1);
        let ops = Log::default();
        let diff = ListenerDiff {
            create: vec![listener(80, Some("new-group"), None)],
            ..Default::default()
        };

        let producer = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send("new-group", Ok("rsp-9".to_string())).await;
        };
        let (_, errors) = tokio::join!(
            producer,
            run_listener_stage(&ops, diff, HashMap::new(), queue, false)
        );
        assert!(errors.is_empty());
        assert_eq!(*ops.0.lock().await, vec!["create 80 rsp-9".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_group_fails_only_its_listener() {
        let (tx, queue) = completion_queue(1);
        let ops = Log::default();
        let diff = ListenerDiff {
            create: vec![
                listener(80, Some("broken"), None),
                listener(81, Some("existing"), None),
            ],
            ..Default::default()
        };
        tx.send("broken", Err("quota exceeded".to_string())).await;
        drop(tx);
        let known = HashMap::from([("existing".to_string(), "rsp-1".to_string())]);
        let errors = run_listener_stage(&ops, diff, known, queue, false).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(*ops.0.lock().await, vec!["create 81 rsp-1".to_string()]);
    }

    #[tokio::test]
    async fn test_ordering_of_deletes_and_forwarding() {
        let (tx, queue) = completion_queue(1);
        drop(tx);
        let ops = Log::default();
        let diff = ListenerDiff {
            create: vec![
                listener(80, None, Some(443)),
                listener(8080, Some("g"), None),
            ],
            update: vec![(listener(81, None, Some(443)), listener(81, None, None))],
            delete: vec![listener(443, Some("g"), None), listener(90, Some("g"), None)],
        };
        let known = HashMap::from([("g".to_string(), "rsp-1".to_string())]);
        let errors = run_listener_stage(&ops, diff, known, queue, false).await;
        assert!(errors.is_empty());
        assert_eq!(
            *ops.0.lock().await,
            vec![
                "delete 90".to_string(),
                "create 8080 rsp-1".to_string(),
                "update 81 ".to_string(),
                "create 80 ".to_string(),
                "delete 443".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_skip_updates() {
        let (_tx, queue) = completion_queue(1);
        let ops = Log::default();
        let diff = ListenerDiff {
            update: vec![(listener(80, None, None), listener(80, None, None))],
            ..Default::default()
        };
        let errors = run_listener_stage(&ops, diff, HashMap::new(), queue, true).await;
        assert!(errors.is_empty());
        assert!(ops.0.lock().await.is_empty());
    }
}
