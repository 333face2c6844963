//! Registry of forwarded sessions
//!
//! Sessions are registered once the backend connection is up and removed
//! when their [`SessionGuard`] drops. On-demand session counts are published
//! on a `watch` channel for the idle scheduler.

use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

/// What kind of backend a session is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    OnDemand,
    Local,
    Friendly,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client: SocketAddr,
    pub backend: String,
    pub host: String,
    pub kind: SessionKind,
    pub started: Instant,
}

/// On-demand session count plus a running total of arrivals.
///
/// `arrivals` lets the scheduler see a session that came and went between
/// two observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnDemandActivity {
    pub active: usize,
    pub arrivals: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub client: String,
    pub host: String,
    pub backend: String,
    pub kind: SessionKind,
    pub age_secs: u64,
}

pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionInfo>,
    activity: watch::Sender<OnDemandActivity>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        let (activity, _) = watch::channel(OnDemandActivity::default());
        Arc::new(Self {
            sessions: DashMap::new(),
            activity,
        })
    }

    pub fn register(self: &Arc<Self>, info: SessionInfo) -> SessionGuard {
        let id = Uuid::new_v4();
        let kind = info.kind;
        self.sessions.insert(id, info);
        if kind == SessionKind::OnDemand {
            self.activity.send_modify(|a| {
                a.active += 1;
                a.arrivals += 1;
            });
        }
        SessionGuard {
            id,
            kind,
            registry: Arc::clone(self),
        }
    }

    fn deregister(&self, id: Uuid, kind: SessionKind) {
        if self.sessions.remove(&id).is_some() && kind == SessionKind::OnDemand {
            self.activity.send_modify(|a| a.active = a.active.saturating_sub(1));
        }
    }

    /// Watch on-demand activity
    pub fn subscribe(&self) -> watch::Receiver<OnDemandActivity> {
        self.activity.subscribe()
    }

    pub fn on_demand_active(&self) -> usize {
        self.activity.borrow().active
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let info = entry.value();
                SessionSummary {
                    id: *entry.key(),
                    client: info.client.to_string(),
                    host: info.host.clone(),
                    backend: info.backend.clone(),
                    kind: info.kind,
                    age_secs: info.started.elapsed().as_secs(),
                }
            })
            .collect();
        list.sort_by(|a, b| b.age_secs.cmp(&a.age_secs));
        list
    }
}

/// Removes its session from the registry on drop
pub struct SessionGuard {
    id: Uuid,
    kind: SessionKind,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id, self.kind);
    }
}
