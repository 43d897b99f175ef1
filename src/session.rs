//! Sessions batch events across aggregates and release them with a single
//! commit, or discard them with a rollback.
//!
//! Events applied under a session fold into local state immediately but
//! only reach the store at commit time, tagged with the session id so the
//! store keeps them invisible to readers until its own commit lands.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{EventRequest, EventStore};
use crate::error::{Error, FieldErrors, SessionError};
use crate::event::{ApplyKind, DomainEvent, EventDto};

/// What [`SessionManager::start`] does with the session once the scope
/// closure returns.
///
/// The default, [`CommitOnError`](CommitPolicy::CommitOnError), commits
/// the buffered work when the scope returns an error and otherwise leaves
/// the session open, for the caller to commit or roll back explicitly.
/// [`CommitOnSuccess`](CommitPolicy::CommitOnSuccess) commits on success
/// and rolls back on error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    #[default]
    CommitOnError,
    CommitOnSuccess,
}

/// Where a session is in its lifecycle. Committed and rolled-back
/// sessions refuse further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Committed,
    RolledBack,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled back",
        }
    }
}

/// One staged event, kept in append order until commit.
#[derive(Debug, Clone)]
struct BufferedEvent {
    tenant_id: String,
    aggregate_id: String,
    aggregate_type: String,
    kind: ApplyKind,
    dto: EventDto,
}

struct SessionInner {
    state: SessionState,
    buffer: Vec<BufferedEvent>,
}

/// An open unit of work. Pass it to
/// [`AggregateManager::apply_pending`](crate::AggregateManager::apply_pending)
/// to stage events instead of sending them immediately.
pub struct Session {
    session_id: String,
    tenant_id: String,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// The store-visible id events are tagged with at commit.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// How many events are staged right now.
    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    /// Stages one event. Fails once the session is committed or rolled
    /// back.
    pub(crate) async fn buffer(
        &self,
        aggregate_type: &str,
        event: &DomainEvent,
        kind: ApplyKind,
        dto: EventDto,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Active {
            return Err(Error::Session(SessionError::Closed {
                session_id: self.session_id.clone(),
                state: inner.state.as_str(),
            }));
        }
        inner.buffer.push(BufferedEvent {
            tenant_id: event.tenant_id.clone(),
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: aggregate_type.to_owned(),
            kind,
            dto,
        });
        Ok(())
    }
}

/// Opens, commits, and rolls back sessions against one store.
///
/// Obtained from
/// [`AggregateManager::sessions`](crate::AggregateManager::sessions),
/// which binds it to the manager's store and commit policy.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn EventStore>,
    policy: CommitPolicy,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub(crate) fn new(store: Arc<dyn EventStore>, policy: CommitPolicy) -> Self {
        Self { store, policy }
    }

    /// Opens a session for `tenant_id` with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verify`] for a blank tenant id.
    pub fn begin(&self, tenant_id: &str) -> Result<Arc<Session>, Error> {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", tenant_id);
        errors.into_result()?;

        let session = Arc::new(Session {
            session_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_owned(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Active,
                buffer: Vec::new(),
            }),
        });
        debug!(
            session_id = %session.session_id,
            tenant_id = %tenant_id,
            "session opened"
        );
        Ok(session)
    }

    /// Opens a session, runs `scope` with it, and settles it according to
    /// the configured [`CommitPolicy`].
    ///
    /// The scope's own result is returned, except when the settling
    /// commit or rollback itself fails; that error wins.
    pub async fn start<F, Fut>(&self, tenant_id: &str, scope: F) -> Result<(), Error>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let session = self.begin(tenant_id)?;
        let outcome = scope(Arc::clone(&session)).await;

        match (self.policy, &outcome) {
            (CommitPolicy::CommitOnError, Err(error)) => {
                warn!(
                    session_id = %session.session_id,
                    error = %error,
                    "session scope failed; committing buffered work"
                );
                self.commit(&session).await?;
            }
            (CommitPolicy::CommitOnError, Ok(())) => {
                debug!(
                    session_id = %session.session_id,
                    "session scope succeeded; left open for an explicit commit"
                );
            }
            (CommitPolicy::CommitOnSuccess, Ok(())) => {
                self.commit(&session).await?;
            }
            (CommitPolicy::CommitOnSuccess, Err(error)) => {
                warn!(
                    session_id = %session.session_id,
                    error = %error,
                    "session scope failed; rolling back"
                );
                self.rollback(&session).await?;
            }
        }
        outcome
    }

    /// Forwards the buffered events to the store in append order, then
    /// commits the session there.
    ///
    /// The first send failure aborts the remaining events and surfaces as
    /// the error; nothing is rolled back automatically. The session stays
    /// active with its buffer intact, so the caller can still roll back
    /// or retry the commit.
    pub async fn commit(&self, session: &Session) -> Result<(), Error> {
        let mut inner = session.inner.lock().await;
        if inner.state != SessionState::Active {
            return Err(Error::Session(SessionError::Closed {
                session_id: session.session_id.clone(),
                state: inner.state.as_str(),
            }));
        }

        for buffered in &inner.buffer {
            let request = EventRequest {
                tenant_id: buffered.tenant_id.clone(),
                session_id: Some(session.session_id.clone()),
                aggregate_id: buffered.aggregate_id.clone(),
                aggregate_type: buffered.aggregate_type.clone(),
                events: vec![buffered.dto.clone()],
            };
            let ack = self.store.send_event(buffered.kind, request).await?;
            if ack.is_duplicate {
                warn!(
                    session_id = %session.session_id,
                    event_id = %buffered.dto.event_id,
                    "store flagged a duplicate event during commit"
                );
            }
        }

        self.store
            .commit(&session.tenant_id, &session.session_id)
            .await?;

        let forwarded = inner.buffer.len();
        inner.state = SessionState::Committed;
        inner.buffer.clear();
        info!(
            session_id = %session.session_id,
            events = forwarded,
            "session committed"
        );
        Ok(())
    }

    /// Discards the buffer and rolls the session back in the store.
    pub async fn rollback(&self, session: &Session) -> Result<(), Error> {
        let mut inner = session.inner.lock().await;
        if inner.state != SessionState::Active {
            return Err(Error::Session(SessionError::Closed {
                session_id: session.session_id.clone(),
                state: inner.state.as_str(),
            }));
        }

        self.store
            .rollback(&session.tenant_id, &session.session_id)
            .await?;

        inner.state = SessionState::RolledBack;
        inner.buffer.clear();
        info!(session_id = %session.session_id, "session rolled back");
        Ok(())
    }
}
