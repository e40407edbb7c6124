use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions, WatchStream, Watcher,
};
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::XlineConfig;
use crate::coordination::{
    Connector, CoordinationError, Coordinator, CreateMode, NodeStat, SessionEvent, child_name,
    children_prefix, direct_children, parent_path, validate_path,
};

/// Opens [`XlineSession`]s against the configured endpoints.
pub struct XlineConnector {
    cfg: XlineConfig,
}

impl XlineConnector {
    pub fn new(cfg: XlineConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Connector for XlineConnector {
    async fn connect(
        &self,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Coordinator>, CoordinationError> {
        let session = XlineSession::connect(&self.cfg, events).await?;
        Ok(Arc::new(session))
    }
}

/// A session on an etcd-compatible store.
///
/// The session is a client connection plus a lease with the session timeout
/// as TTL. The lease is renewed in the background; ephemeral nodes are keys
/// attached to it, so they vanish when the session ends or expires.
pub struct XlineSession {
    cli: Arc<Mutex<Client>>,
    lease_id: i64,
    events: UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    /// Stop handle of the pending children watch, one per path.
    watches: Mutex<HashMap<String, CancellationToken>>,
}

impl XlineSession {
    pub async fn connect(
        cfg: &XlineConfig,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Self, CoordinationError> {
        let session_timeout = cfg.session_timeout();
        let mut opts = ConnectOptions::new()
            .with_connect_timeout(session_timeout)
            .with_timeout(session_timeout);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts = opts.with_user(user.clone(), pass.clone());
        }

        let mut cli = Client::connect(cfg.endpoints.clone(), Some(opts)).await?;
        let lease = cli.lease_grant(lease_ttl_secs(session_timeout), None).await?;
        let lease_id = lease.id();
        info!(
            "Successfully connected to xline {:?}, session lease {lease_id:x} (ttl {}s)",
            cfg.endpoints,
            lease.ttl()
        );

        let cancel = CancellationToken::new();
        // Sent before any watch can be armed, so it is always the first event.
        let _ = events.send(SessionEvent::Connected);
        tokio::spawn(keep_alive(
            cli.clone(),
            lease_id,
            lease.ttl(),
            session_timeout,
            events.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            cli: Arc::new(Mutex::new(cli)),
            lease_id,
            events,
            cancel,
            watches: Mutex::new(HashMap::new()),
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// Registers a new children watch on `path`, stopping the previous one.
    async fn replace_watch(&self, path: &str) -> CancellationToken {
        let stop = self.cancel.child_token();
        if let Some(previous) = self
            .watches
            .lock()
            .await
            .insert(path.to_string(), stop.clone())
        {
            previous.cancel();
        }
        stop
    }

    async fn cli(&self) -> Result<tokio::sync::MutexGuard<'_, Client>, CoordinationError> {
        if self.cancel.is_cancelled() {
            return Err(CoordinationError::SessionClosed);
        }
        Ok(self.cli.lock().await)
    }
}

#[async_trait]
impl Coordinator for XlineSession {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, CoordinationError> {
        validate_path(path)?;
        let mut cli = self.cli().await?;
        if path == "/" {
            return Ok(Some(NodeStat {
                create_revision: 0,
                mod_revision: 0,
                version: 0,
                data_length: 0,
            }));
        }
        let resp = cli.get(path, None).await?;
        Ok(resp.kvs().first().map(|kv| NodeStat {
            create_revision: kv.create_revision(),
            mod_revision: kv.mod_revision(),
            version: kv.version(),
            data_length: kv.value().len(),
        }))
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        validate_path(path)?;
        let parent = match parent_path(path) {
            Some(parent) => parent,
            None => return Err(CoordinationError::NodeExists(path.to_string())),
        };

        let mut cmps = vec![Compare::version(path, CompareOp::Equal, 0)];
        if parent != "/" {
            cmps.push(Compare::version(parent, CompareOp::Greater, 0));
        }
        let put_opts = match mode {
            CreateMode::Persistent => PutOptions::new(),
            CreateMode::Ephemeral => PutOptions::new().with_lease(self.lease_id),
        };
        let txn = Txn::new()
            .when(cmps)
            .and_then([TxnOp::put(path, data.to_vec(), Some(put_opts))])
            .or_else([TxnOp::get(path, Some(GetOptions::new().with_count_only()))]);

        let resp = self.cli().await?.txn(txn).await?;
        if resp.succeeded() {
            debug!("Created {mode:?} node {path}");
            return Ok(path.to_string());
        }

        let exists = resp
            .op_responses()
            .into_iter()
            .any(|op| matches!(op, TxnOpResponse::Get(get) if get.count() > 0));
        if exists {
            Err(CoordinationError::NodeExists(path.to_string()))
        } else {
            Err(CoordinationError::NoNode(parent.to_string()))
        }
    }

    async fn get_children_with_watch(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        validate_path(path)?;
        let prefix = children_prefix(path);
        // Stopped before the read, so a change is never reported twice.
        let stop = self.replace_watch(path).await;

        let guard = if path == "/" {
            vec![]
        } else {
            vec![Compare::version(path, CompareOp::Greater, 0)]
        };
        let txn = Txn::new().when(guard).and_then([TxnOp::get(
            prefix.clone(),
            Some(GetOptions::new().with_prefix().with_keys_only()),
        )]);

        let mut cli = self.cli().await?;
        let resp = cli.txn(txn).await?;
        if !resp.succeeded() {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let revision = resp.header().map_or(0, |h| h.revision());

        let mut keys = Vec::new();
        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                keys.extend(
                    get.kvs()
                        .iter()
                        .map(|kv| String::from_utf8_lossy(kv.key()).into_owned()),
                );
            }
        }
        let children = direct_children(path, keys.iter().map(String::as_str));

        // Starting right after the read revision: nothing between the read
        // and the watch can be missed.
        let opts = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (watcher, stream) = cli.watch(prefix, Some(opts)).await?;
        drop(cli);

        tokio::spawn(wait_children_changed(
            watcher,
            stream,
            path.to_string(),
            self.events.clone(),
            stop,
        ));

        Ok(children)
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let mut cli = self.cli.lock().await;
        self.cancel.cancel();
        cli.lease_revoke(self.lease_id).await?;
        info!("Closed xline session, lease {:x} revoked", self.lease_id);
        Ok(())
    }
}

impl Drop for XlineSession {
    // The lease is not revoked here; it runs out after its TTL.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Lease TTL for a session timeout, rounded up to whole seconds.
pub fn lease_ttl_secs(session_timeout: Duration) -> i64 {
    session_timeout.as_millis().div_ceil(1000).max(1) as i64
}

async fn keep_alive(
    mut cli: Client,
    lease_id: i64,
    ttl: i64,
    session_timeout: Duration,
    events: UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_millis((ttl.max(1) as u64 * 1000) / 3);
    let mut channel: Option<(LeaseKeeper, LeaseKeepAliveStream)> = None;
    let mut connected = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let renewed = timeout(session_timeout, renew(&mut cli, lease_id, &mut channel))
            .await
            .unwrap_or(Err(CoordinationError::Timeout(session_timeout)));

        let event = match renewed {
            Ok(ttl) if ttl > 0 => {
                if connected {
                    continue;
                }
                connected = true;
                info!("Reconnected to xline, session lease {lease_id:x} renewed");
                SessionEvent::Connected
            }
            Ok(_) => {
                warn!("Session lease {lease_id:x} expired");
                let _ = events.send(SessionEvent::Expired);
                break;
            }
            Err(e) => {
                channel = None;
                if !connected {
                    debug!("Session lease {lease_id:x} still unreachable: {e}");
                    continue;
                }
                connected = false;
                warn!("Disconnected from xline: {e}");
                SessionEvent::Disconnected
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}

async fn renew(
    cli: &mut Client,
    lease_id: i64,
    channel: &mut Option<(LeaseKeeper, LeaseKeepAliveStream)>,
) -> Result<i64, CoordinationError> {
    if channel.is_none() {
        *channel = Some(cli.lease_keep_alive(lease_id).await?);
    }
    let Some((keeper, stream)) = channel.as_mut() else {
        return Err(CoordinationError::SessionClosed);
    };
    keeper.keep_alive().await?;
    match stream.message().await? {
        Some(resp) => Ok(resp.ttl()),
        None => Err(CoordinationError::SessionClosed),
    }
}

async fn wait_children_changed(
    mut watcher: Watcher,
    mut stream: WatchStream,
    path: String,
    events: UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.message() => msg,
        };
        match msg {
            Ok(Some(resp)) => {
                if resp.canceled() {
                    warn!("Children watch on {path} canceled by the server");
                    break;
                }
                let changed = resp
                    .events()
                    .iter()
                    .filter_map(|ev| ev.kv())
                    .filter_map(|kv| std::str::from_utf8(kv.key()).ok())
                    .any(|key| child_name(&path, key).is_some());
                if changed {
                    debug!("Children of {path} changed");
                    let _ = events.send(SessionEvent::ChildrenChanged { path: path.clone() });
                    break;
                }
            }
            Ok(None) => {
                debug!("Children watch stream on {path} closed");
                break;
            }
            Err(e) => {
                warn!("Children watch on {path} failed: {e}");
                break;
            }
        }
    }
    let _ = watcher.cancel().await;
}
