#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use libhealer::coordination::{child_name, children_prefix, parent_path, validate_path};
use libhealer::{
    Connector, CoordinationError, Coordinator, CreateMode, LaunchCommand, LaunchError, NodeStat,
    ProcessHost, SessionEvent, WorkerLauncher,
};
use tokio::sync::mpsc::UnboundedSender;

pub const NAMESPACE: &str = "/workers";

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    create_revision: i64,
    mod_revision: i64,
}

struct Watch {
    path: String,
    session: u64,
    events: UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Node>,
    revision: i64,
    watches: Vec<Watch>,
    failing_reads: usize,
    failing_creates: usize,
}

impl StoreState {
    fn insert(&mut self, path: &str, data: Vec<u8>, owner: Option<u64>) {
        self.revision += 1;
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                owner,
                create_revision: self.revision,
                mod_revision: self.revision,
            },
        );
        self.fire(path);
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.nodes.remove(path).is_some() {
            self.revision += 1;
            self.fire(path);
            true
        } else {
            false
        }
    }

    /// One-shot: every watch on the parent of `changed` fires and is dropped.
    fn fire(&mut self, changed: &str) {
        let Some(parent) = parent_path(changed) else {
            return;
        };
        self.watches.retain(|w| {
            if w.path == parent {
                let _ = w.events.send(SessionEvent::ChildrenChanged {
                    path: w.path.clone(),
                });
                false
            } else {
                true
            }
        });
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }
}

/// In-memory stand-in for the coordination store, shared by all sessions.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(path: &str) -> Self {
        let store = Self::new();
        store.state.lock().unwrap().insert(path, Vec::new(), None);
        store
    }

    /// Registers a worker the way a worker process would.
    pub fn register_worker(&self, name: &str) {
        let path = format!("{}{name}", children_prefix(NAMESPACE));
        self.state.lock().unwrap().insert(&path, Vec::new(), None);
    }

    pub fn unregister_worker(&self, name: &str) -> bool {
        let path = format!("{}{name}", children_prefix(NAMESPACE));
        self.state.lock().unwrap().remove(&path)
    }

    pub fn delete(&self, path: &str) -> bool {
        self.state.lock().unwrap().remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().unwrap().exists(path)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    pub fn worker_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .keys()
            .filter(|k| child_name(NAMESPACE, k).is_some())
            .count()
    }

    pub fn watch_count(&self, path: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.watches.iter().filter(|w| w.path == path).count()
    }

    /// The next `n` children reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.state.lock().unwrap().failing_reads = n;
    }

    /// The next `n` creates fail as if permission was denied.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().unwrap().failing_creates = n;
    }
}

pub struct MemorySession {
    id: u64,
    store: MemoryStore,
    events: UnboundedSender<SessionEvent>,
    closed: AtomicBool,
    reads: AtomicUsize,
}

impl MemorySession {
    pub fn new(id: u64, store: MemoryStore, events: UnboundedSender<SessionEvent>) -> Self {
        Self {
            id,
            store,
            events,
            closed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Successful children reads made through this session.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), CoordinationError> {
        if self.is_closed() {
            Err(CoordinationError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, CoordinationError> {
        self.check_open()?;
        validate_path(path)?;
        let state = self.store.state.lock().unwrap();
        if path == "/" {
            return Ok(Some(NodeStat {
                create_revision: 0,
                mod_revision: 0,
                version: 0,
                data_length: 0,
            }));
        }
        Ok(state.nodes.get(path).map(|n| NodeStat {
            create_revision: n.create_revision,
            mod_revision: n.mod_revision,
            version: 1,
            data_length: n.data.len(),
        }))
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        self.check_open()?;
        validate_path(path)?;
        let mut state = self.store.state.lock().unwrap();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(CoordinationError::Timeout(Duration::from_secs(3)));
        }
        if state.exists(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        let parent = parent_path(path).unwrap_or("/");
        if !state.exists(parent) {
            return Err(CoordinationError::NoNode(parent.to_string()));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.id),
        };
        state.insert(path, data.to_vec(), owner);
        Ok(path.to_string())
    }

    async fn get_children_with_watch(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.check_open()?;
        validate_path(path)?;
        let mut state = self.store.state.lock().unwrap();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(CoordinationError::Timeout(Duration::from_secs(3)));
        }
        if !state.exists(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let children: Vec<String> = state
            .nodes
            .keys()
            .filter_map(|k| child_name(path, k))
            .map(str::to_string)
            .collect();
        // Re-arming replaces this session's pending watch on the same path.
        let id = self.id;
        state.watches.retain(|w| w.session != id || w.path != path);
        state.watches.push(Watch {
            path: path.to_string(),
            session: self.id,
            events: self.events.clone(),
        });
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(children)
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.store.state.lock().unwrap();
        let id = self.id;
        state.watches.retain(|w| w.session != id);
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            state.remove(&path);
        }
        Ok(())
    }
}

/// Hands out [`MemorySession`]s and keeps their event senders so tests can
/// inject session notifications.
#[derive(Default)]
pub struct MemoryConnector {
    store: MemoryStore,
    senders: Mutex<Vec<UnboundedSender<SessionEvent>>>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    failing_connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            ..Default::default()
        }
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<MemorySession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    /// Sends `event` on the channel of the latest session.
    pub fn inject(&self, event: SessionEvent) {
        let senders = self.senders.lock().unwrap();
        senders
            .last()
            .expect("no session established")
            .send(event)
            .expect("controller stopped listening");
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Coordinator>, CoordinationError> {
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(CoordinationError::Timeout(Duration::from_secs(3)));
        }
        let mut sessions = self.sessions.lock().unwrap();
        let session = Arc::new(MemorySession::new(
            sessions.len() as u64 + 1,
            self.store.clone(),
            events.clone(),
        ));
        let _ = events.send(SessionEvent::Connected);
        sessions.push(session.clone());
        self.senders.lock().unwrap().push(events);
        Ok(session)
    }
}

/// Records launches instead of spawning processes. Optionally registers a
/// membership entry per launch, like a real worker does on startup.
#[derive(Default)]
pub struct RecordingHost {
    launched: Mutex<Vec<LaunchCommand>>,
    failing: AtomicBool,
    next_pid: AtomicU32,
    registers_in: Option<MemoryStore>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn registering(store: MemoryStore) -> Self {
        Self {
            registers_in: Some(store),
            ..Default::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn commands(&self) -> Vec<LaunchCommand> {
        self.launched.lock().unwrap().clone()
    }
}

impl ProcessHost for RecordingHost {
    fn spawn(&self, command: &LaunchCommand) -> Result<u32, LaunchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LaunchError::Spawn {
                command: command.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
        self.launched.lock().unwrap().push(command.clone());
        if let Some(store) = &self.registers_in {
            store.register_worker(&format!("worker_{pid}"));
        }
        Ok(pid)
    }
}

pub fn launcher_with(host: Arc<RecordingHost>) -> WorkerLauncher {
    WorkerLauncher::new(host, vec!["java".to_string(), "-jar".to_string()])
}

/// A program path whose directory exists, so commands resolve.
pub fn worker_program() -> std::path::PathBuf {
    std::env::temp_dir().join("worker.jar")
}

pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
