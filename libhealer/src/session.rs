use log::{debug, info, warn};

use crate::coordination::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    /// The session expired or was shut down. Only `reset` leaves this state.
    Terminated,
}

/// What the controller loop must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    None,
    Reconcile,
    /// Leave the idle wait and decide whether to keep running.
    WakeIdleWait,
    /// The session is gone; a new one must be established.
    Reestablish,
}

/// Tracks the controller's session state and turns events into directives.
#[derive(Debug)]
pub struct SessionTracker {
    state: SessionState,
    ever_connected: bool,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Back to the initial state, for a freshly established session.
    pub fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.ever_connected = false;
    }

    pub fn handle(&mut self, event: &SessionEvent) -> Directive {
        if self.state == SessionState::Terminated {
            debug!("Ignoring {event:?}, session is terminated");
            return Directive::None;
        }
        match event {
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::Disconnected => self.on_disconnected(),
            SessionEvent::Expired => self.on_expired(),
            SessionEvent::ChildrenChanged { path } => self.on_children_changed(path),
        }
    }

    fn on_connected(&mut self) -> Directive {
        if self.state == SessionState::Connected {
            return Directive::None;
        }
        self.state = SessionState::Connected;
        if self.ever_connected {
            // Watches may not have survived the outage.
            info!("Reconnected to the coordination service");
            Directive::Reconcile
        } else {
            self.ever_connected = true;
            info!("Successfully connected to the coordination service");
            Directive::None
        }
    }

    fn on_disconnected(&mut self) -> Directive {
        if self.state != SessionState::Connected {
            return Directive::None;
        }
        self.state = SessionState::Disconnected;
        warn!("Disconnected from the coordination service");
        Directive::WakeIdleWait
    }

    fn on_expired(&mut self) -> Directive {
        self.state = SessionState::Terminated;
        warn!("Coordination session expired");
        Directive::Reestablish
    }

    fn on_children_changed(&mut self, path: &str) -> Directive {
        if self.state != SessionState::Connected {
            debug!("Ignoring children change of {path} while disconnected");
            return Directive::None;
        }
        Directive::Reconcile
    }
}
