use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordination::{Connector, Coordinator, SessionEvent};
use crate::launcher::WorkerLauncher;
use crate::namespace::ensure_namespace;
use crate::reconciler::Reconciler;
use crate::session::{Directive, SessionTracker};
use crate::xline::XlineConnector;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Stop the controller when the session disconnects instead of waiting
    /// for it to come back.
    pub exit_on_disconnect: bool,
    /// Extra passes scheduled after a failed pass before waiting for the next
    /// event.
    pub reconcile_retries: u32,
    /// Connection attempts made after the session expired. Zero is treated
    /// as a single attempt.
    pub reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            exit_on_disconnect: false,
            reconcile_retries: 3,
            reconnect_attempts: 10,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

type Session = Arc<dyn Coordinator>;

/// Keeps the desired number of workers registered under the namespace.
pub struct Controller {
    connector: Arc<dyn Connector>,
    reconciler: Reconciler,
    options: ControllerOptions,
}

enum Wakeup {
    Shutdown,
    Event(SessionEvent),
    Retry,
    ChannelClosed,
}

/// Pending retry of a failed pass.
struct RetryState {
    attempts: u32,
    backoff: Duration,
    deadline: Option<Instant>,
}

impl RetryState {
    fn new(options: &ControllerOptions) -> Self {
        Self {
            attempts: 0,
            backoff: options.initial_backoff,
            deadline: None,
        }
    }

    fn clear(&mut self, options: &ControllerOptions) {
        *self = Self::new(options);
    }

    fn schedule(&mut self, options: &ControllerOptions) {
        if self.attempts >= options.reconcile_retries {
            warn!("Giving up on retries, waiting for the next membership change");
            self.deadline = None;
            return;
        }
        self.attempts += 1;
        debug!("Retrying pass in {:?} (attempt {})", self.backoff, self.attempts);
        self.deadline = Some(Instant::now() + self.backoff);
        self.backoff = std::cmp::min(self.backoff * 2, options.max_backoff);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Controller {
    pub fn new(
        connector: Arc<dyn Connector>,
        reconciler: Reconciler,
        options: ControllerOptions,
    ) -> Self {
        Self {
            connector,
            reconciler,
            options,
        }
    }

    /// Controller talking to the configured Xline endpoints and launching
    /// real processes.
    pub fn from_config(cfg: &Config) -> Self {
        let launcher = WorkerLauncher::with_os_host(cfg.launch_prefix.clone());
        let reconciler = Reconciler::new(
            cfg.namespace.clone(),
            cfg.workers,
            cfg.program.clone(),
            launcher,
        );
        let options = ControllerOptions {
            exit_on_disconnect: cfg.exit_on_disconnect,
            reconcile_retries: cfg.reconcile_retries,
            reconnect_attempts: cfg.reconnect_attempts,
            ..Default::default()
        };
        Self::new(
            Arc::new(XlineConnector::new(cfg.xline_config.clone())),
            reconciler,
            options,
        )
    }

    /// Connects, initializes the namespace, runs the first pass and then
    /// handles session events until `shutdown` is cancelled.
    ///
    /// Failing to connect or to initialize the namespace is returned as an
    /// error. Once running, failed passes and failed launches are only
    /// logged. The session is closed before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut session = self
            .connector
            .connect(tx)
            .await
            .context("failed to connect to the coordination service")?;

        if let Err(e) = ensure_namespace(session.as_ref(), self.reconciler.namespace()).await {
            close_session(&session).await;
            return Err(e).context("failed to initialize the namespace");
        }

        let mut tracker = SessionTracker::new();
        let mut retry = RetryState::new(&self.options);
        self.reconcile_pass(&session, &mut retry).await;

        let result = loop {
            let wakeup = tokio::select! {
                _ = shutdown.cancelled() => Wakeup::Shutdown,
                event = events.recv() => event.map_or(Wakeup::ChannelClosed, Wakeup::Event),
                _ = sleep_until_opt(retry.deadline) => Wakeup::Retry,
            };

            let event = match wakeup {
                Wakeup::Shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Wakeup::ChannelClosed => {
                    break Err(anyhow!("session event channel closed unexpectedly"));
                }
                Wakeup::Retry => {
                    retry.deadline = None;
                    self.reconcile_pass(&session, &mut retry).await;
                    continue;
                }
                Wakeup::Event(event) => event,
            };

            match tracker.handle(&event) {
                Directive::None => {}
                Directive::Reconcile => {
                    retry.clear(&self.options);
                    self.reconcile_pass(&session, &mut retry).await;
                }
                Directive::WakeIdleWait => {
                    if self.options.exit_on_disconnect {
                        info!("Session disconnected, stopping controller");
                        break Ok(());
                    }
                    info!("Waiting for the session to reconnect");
                }
                Directive::Reestablish => {
                    close_session(&session).await;
                    match self.reestablish(&shutdown).await {
                        Ok(Some((new_session, new_events))) => {
                            session = new_session;
                            events = new_events;
                            tracker.reset();
                            retry.clear(&self.options);
                            self.reconcile_pass(&session, &mut retry).await;
                        }
                        Ok(None) => {
                            info!("Shutdown requested while re-establishing the session");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        };

        close_session(&session).await;
        result
    }

    async fn reconcile_pass(&self, session: &Session, retry: &mut RetryState) {
        match self.reconciler.reconcile(session.as_ref()).await {
            Ok(outcome) => {
                debug!("Pass finished: {outcome:?}");
                retry.clear(&self.options);
            }
            Err(e) => {
                error!("Failed to check running workers: {e}");
                retry.schedule(&self.options);
            }
        }
    }

    /// Opens a new session with a fresh event channel, so nothing queued by
    /// the expired session is handled afterwards. `None` means shutdown was
    /// requested meanwhile.
    async fn reestablish(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<(Session, UnboundedReceiver<SessionEvent>)>> {
        let attempts = self.options.reconnect_attempts.max(1);
        let mut backoff = self.options.initial_backoff;

        for attempt in 1..=attempts {
            info!("Re-establishing session (attempt {attempt}/{attempts})");
            let (tx, rx) = mpsc::unbounded_channel();
            match self.connector.connect(tx).await {
                Ok(session) => {
                    match ensure_namespace(session.as_ref(), self.reconciler.namespace()).await {
                        Ok(_) => return Ok(Some((session, rx))),
                        Err(e) => {
                            warn!("Failed to initialize namespace on new session: {e}");
                            close_session(&session).await;
                        }
                    }
                }
                Err(e) => warn!("Failed to connect: {e}"),
            }

            if attempt == attempts {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, self.options.max_backoff);
        }

        bail!("could not re-establish the session after {attempts} attempts")
    }
}

async fn close_session(session: &Session) {
    if let Err(e) = session.close().await {
        warn!("Failed to close session: {e}");
    }
}
