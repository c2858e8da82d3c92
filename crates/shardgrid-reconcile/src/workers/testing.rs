//! Fleet fixture shared by the worker tests.

use std::cell::Cell;
use std::sync::Arc;

use shardgrid_core::FleetSettings;
use shardgrid_state::*;

use crate::context::ReconcileContext;

pub(crate) const T0: u64 = 1_700_000_000;

pub(crate) struct Fleet {
    pub store: StateStore,
    pub settings: Arc<FleetSettings>,
    next_project: Cell<ProjectId>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut FleetSettings)) -> Self {
        let mut settings = FleetSettings::default();
        configure(&mut settings);
        Self {
            store: StateStore::open_in_memory().unwrap(),
            settings: Arc::new(settings),
            next_project: Cell::new(1_000),
        }
    }

    pub fn ctx(&self) -> ReconcileContext {
        self.ctx_at(T0)
    }

    pub fn ctx_at(&self, now: u64) -> ReconcileContext {
        ReconcileContext::new(self.settings.clone(), self.store.flags().unwrap(), now)
    }

    pub fn node(&self, name: &str, total_bytes: i64) -> Node {
        self.store.insert(Node::new(name, total_bytes, T0)).unwrap()
    }

    pub fn heartbeat(&self, node_id: NodeId, now: u64) {
        self.store
            .bulk_update(&[node_id], |n: &mut Node| n.last_seen_at = now)
            .unwrap();
    }

    pub fn namespace(&self, id: NamespaceId, eligible: bool) -> Namespace {
        let mut ns = Namespace::new(id, format!("group-{id}"), 0, T0);
        ns.eligible = eligible;
        self.store.put(&ns).unwrap();
        ns
    }

    /// The `EnabledNamespace` for `root`, created with its catalogue entry if needed.
    pub fn enabled(&self, root: NamespaceId) -> EnabledNamespace {
        let existing = self
            .store
            .batch(|e: &EnabledNamespace| e.root_namespace_id == root, 1)
            .unwrap();
        match existing.into_iter().next() {
            Some(enabled) => enabled,
            None => {
                if self.store.find::<Namespace>(root).unwrap().is_none() {
                    self.namespace(root, true);
                }
                self.store.enable_namespace(root, T0).unwrap()
            }
        }
    }

    /// A replica plus an index for namespace `root` on `node`.
    pub fn index_on(&self, node: &Node, root: NamespaceId, reserved: i64, state: IndexState) -> Index {
        let enabled = self.enabled(root);
        let replica = self.store.insert(Replica::new(&enabled, node.id, T0)).unwrap();
        let mut index = Index::new(&enabled, node.id, replica.id, reserved, T0);
        index.state = state;
        self.store.insert(index).unwrap()
    }

    pub fn project(&self, namespace_id: NamespaceId, size_bytes: i64) -> Project {
        let id = self.next_project.get();
        self.next_project.set(id + 1);
        let project = Project::new(id, namespace_id, size_bytes, T0);
        self.store.put(&project).unwrap();
        project
    }

    pub fn repos(&self, index: &Index, count: usize, state: RepositoryState) -> Vec<Repository> {
        (0..count)
            .map(|_| {
                let project = self.project(index.namespace_id, 0);
                let mut repo = Repository::new(&project, index, 3, T0);
                repo.state = state;
                self.store.insert(repo).unwrap()
            })
            .collect()
    }

    pub fn task(&self, repo: &Repository, node_id: NodeId, task_type: TaskType) -> Task {
        self.store
            .insert(Task::new(repo, node_id, task_type, T0))
            .unwrap()
    }

    pub fn index(&self, id: IndexId) -> Index {
        self.store.get(id).unwrap()
    }

    pub fn repo(&self, id: RepositoryId) -> Repository {
        self.store.get(id).unwrap()
    }
}
