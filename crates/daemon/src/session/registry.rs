//! Registry of live engine sessions.
//!
//! The registry owns every [`Session`], keyed by id. A session is inserted
//! only after its engine has been spawned, and removed either by an explicit
//! [`remove`](SessionRegistry::remove) or automatically when its engine exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::SessionSummary;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::engine::{Session, SessionError, SessionId, SessionOptions, SessionStatus};
use super::process::{EngineCommand, ProcessEvent, ProcessHandle};
use crate::config::EngineConfig;

/// Result of [`SessionRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The session existed and has been shut down.
    Removed,
    /// No session had that id. Nothing was done.
    NotFound,
}

/// Thread-safe registry of engine sessions.
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    config: EngineConfig,
    /// Start attempts that hold a slot but are not in `sessions` yet.
    starting: AtomicUsize,
}

/// Releases a reserved slot when a start attempt finishes.
struct StartSlot<'a>(&'a AtomicUsize);

impl Drop for StartSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
            starting: AtomicUsize::new(0),
        }
    }

    /// The engine configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts an engine and registers it.
    ///
    /// `engine_path` overrides the configured default engine. The call
    /// returns once the engine has survived the stabilization window.
    pub async fn create(&self, engine_path: Option<&str>) -> Result<Arc<Session>, SessionError> {
        let path = engine_path
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(self.config.default_path.as_str());

        let mut command = EngineCommand::new(path)
            .args(&self.config.args)
            .max_line_length(self.config.max_line_length);
        if let Some(dir) = &self.config.working_dir {
            command = command.working_dir(dir);
        }

        self.create_with(command).await
    }

    /// Starts a session from an explicit command.
    pub async fn create_with(&self, command: EngineCommand) -> Result<Arc<Session>, SessionError> {
        let slot = self.reserve_slot()?;

        let (process, events) =
            ProcessHandle::spawn(&command).map_err(|e| SessionError::SpawnFailed {
                path: command.program.display().to_string(),
                reason: e.to_string(),
            })?;

        let id = Uuid::now_v7().to_string();
        let session = Arc::new(Session::new(
            id.clone(),
            process,
            SessionOptions::from(&self.config),
        ));

        self.sessions.insert(id.clone(), Arc::clone(&session));
        // The map entry now holds the slot.
        drop(slot);
        self.spawn_event_pump(Arc::clone(&session), events);

        tracing::info!(
            session_id = %id,
            engine = %session.engine_path(),
            pid = ?session.pid(),
            "Engine started, waiting for it to stabilize"
        );

        if let Some(status) = session
            .wait_exited(self.config.stabilization_window())
            .await
        {
            self.evict(&id, &session);
            tracing::warn!(session_id = %id, status = %status, "Engine exited during startup");
            return Err(SessionError::EarlyExit {
                session_id: id,
                status,
            });
        }

        tracing::info!(session_id = %id, "Session ready");
        Ok(session)
    }

    fn reserve_slot(&self) -> Result<StartSlot<'_>, SessionError> {
        let max = self.config.max_sessions;
        let starting = self.starting.fetch_add(1, Ordering::SeqCst);
        let slot = StartSlot(&self.starting);

        if self.sessions.len() + starting >= max {
            return Err(SessionError::LimitReached(max));
        }
        Ok(slot)
    }

    /// Feeds process events into the session until the engine ends, then
    /// drops the session from the registry.
    fn spawn_event_pump(&self, session: Arc<Session>, mut events: mpsc::Receiver<ProcessEvent>) {
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            let mut status = SessionStatus::Exited(None);
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Line(line) => session.on_line(line),
                    ProcessEvent::Exit(code) => {
                        status = SessionStatus::Exited(code);
                        break;
                    }
                    ProcessEvent::Error(reason) => {
                        status = SessionStatus::Failed(reason);
                        break;
                    }
                }
            }

            let resolved = session.terminate(status);
            let removed = sessions
                .remove_if(session.id(), |_, current| Arc::ptr_eq(current, &session))
                .is_some();

            tracing::info!(
                session_id = %session.id(),
                status = %session.status(),
                resolved_waiters = resolved,
                removed = removed,
                "Engine process ended"
            );
        });
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Removes a session and stops its engine.
    ///
    /// The entry leaves the registry before the engine is stopped, so no new
    /// command can reach it. An unknown id is not an error.
    ///
    /// The shutdown runs on its own task: dropping the returned future still
    /// stops the engine.
    pub async fn remove(&self, id: &str) -> RemoveOutcome {
        let Some((_, session)) = self.sessions.remove(id) else {
            tracing::debug!(session_id = %id, "Remove requested for unknown session");
            return RemoveOutcome::NotFound;
        };

        let grace = self.config.quit_grace();
        let shutdown = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.shutdown(grace).await }
        });

        if let Err(e) = shutdown.await {
            tracing::error!(session_id = %id, error = %e, "Session shutdown task failed, killing");
            session.kill();
        }

        tracing::info!(session_id = %id, status = %session.status(), "Session removed");
        RemoveOutcome::Removed
    }

    /// Drops `session` from the registry if `id` still refers to it.
    ///
    /// Returns whether an entry was removed.
    pub fn evict(&self, id: &str, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            session.kill();
        }
        removed
    }

    /// Summaries of every session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.sessions.iter().map(|entry| entry.value().summary()).collect();
        // v7 ids sort by creation time.
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Ids of every session.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Returns whether a session exists.
    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops every session. Used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let ids = self.ids();
        if ids.is_empty() {
            return;
        }

        tracing::info!(count = ids.len(), "Stopping all engine sessions");
        let removals = ids.iter().map(|id| self.remove(id));
        futures_util::future::join_all(removals).await;
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("starting", &self.starting.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> EngineConfig {
        EngineConfig {
            default_path: "cat".to_string(),
            stabilization_ms: 200,
            quit_grace_ms: 200,
            ..EngineConfig::default()
        }
    }

    fn silent_engine() -> EngineCommand {
        EngineCommand::new("/bin/sh").args(["-c", "cat > /dev/null"])
    }

    #[tokio::test]
    async fn test_registry_create_session() {
        let registry = SessionRegistry::new(test_config());

        let session = registry.create(None).await.unwrap();
        assert!(session.is_running());
        assert!(session.pid().is_some());
        assert!(registry.exists(session.id()));
        assert_eq!(registry.count(), 1);

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_registry_ids_are_unique() {
        let registry = SessionRegistry::new(test_config());

        let a = registry.create(None).await.unwrap();
        let b = registry.create(None).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.ids(), vec![a.id().clone(), b.id().clone()]);

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_registry_spawn_failure() {
        let registry = SessionRegistry::new(test_config());

        let result = registry.create(Some("/nonexistent/engine")).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed { .. })));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_early_exit() {
        let registry = SessionRegistry::new(EngineConfig {
            stabilization_ms: 1000,
            ..test_config()
        });

        let result = registry
            .create_with(EngineCommand::new("/bin/sh").args(["-c", "sleep 0.1; exit 2"]))
            .await;

        match result {
            Err(SessionError::EarlyExit { status, .. }) => {
                assert_eq!(status, SessionStatus::Exited(Some(2)));
            }
            other => panic!("Expected EarlyExit, got {:?}", other),
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_get_nonexistent() {
        let registry = SessionRegistry::new(test_config());
        let result = registry.get("missing");
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_remove() {
        let registry = SessionRegistry::new(test_config());
        let session = registry.create_with(silent_engine()).await.unwrap();
        let id = session.id().clone();

        assert_eq!(registry.remove(&id).await, RemoveOutcome::Removed);
        assert!(!registry.exists(&id));
        assert!(!session.is_running());

        assert_eq!(registry.remove(&id).await, RemoveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_registry_remove_unknown_is_noop() {
        let registry = SessionRegistry::new(test_config());
        let session = registry.create_with(silent_engine()).await.unwrap();

        assert_eq!(registry.remove("missing").await, RemoveOutcome::NotFound);
        assert_eq!(registry.count(), 1);
        assert!(session.is_running());

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_registry_drops_exited_session() {
        let registry = SessionRegistry::new(EngineConfig {
            stabilization_ms: 0,
            ..test_config()
        });
        let session = registry
            .create_with(EngineCommand::new("/bin/sh").args(["-c", "sleep 0.3"]))
            .await
            .unwrap();
        let id = session.id().clone();
        assert!(registry.exists(&id));

        session.wait_terminated(Duration::from_secs(5)).await.unwrap();
        // The pump removes the entry right after marking the session.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.exists(&id));
    }

    #[tokio::test]
    async fn test_registry_session_limit() {
        let registry = SessionRegistry::new(EngineConfig {
            max_sessions: 1,
            ..test_config()
        });

        let _first = registry.create_with(silent_engine()).await.unwrap();
        let second = registry.create_with(silent_engine()).await;
        assert!(matches!(second, Err(SessionError::LimitReached(1))));
        assert_eq!(registry.count(), 1);

        registry.shutdown_all().await;
        let third = registry.create_with(silent_engine()).await;
        assert!(third.is_ok());

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_registry_starting_session_counted_once() {
        let registry = Arc::new(SessionRegistry::new(EngineConfig {
            max_sessions: 2,
            stabilization_ms: 500,
            ..test_config()
        }));

        let first = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.create_with(silent_engine()).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.count(), 1);

        let second = registry.create_with(silent_engine()).await;
        assert!(second.is_ok(), "second create rejected: {:?}", second);
        assert!(first.await.unwrap().is_ok());
        assert_eq!(registry.count(), 2);

        let third = registry.create_with(silent_engine()).await;
        assert!(matches!(third, Err(SessionError::LimitReached(2))));

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_registry_dropped_remove_still_stops_engine() {
        let registry = SessionRegistry::new(test_config());
        let session = registry.create_with(silent_engine()).await.unwrap();
        let id = session.id().clone();

        // Give up on the removal while the engine is ignoring `quit`.
        let removal = tokio::time::timeout(Duration::from_millis(50), registry.remove(&id)).await;
        assert!(removal.is_err());
        assert!(!registry.exists(&id));

        let status = session.wait_terminated(Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_registry_early_exit_with_stdout_held_open() {
        let registry = SessionRegistry::new(EngineConfig {
            stabilization_ms: 500,
            ..test_config()
        });

        // Exits inside the window while a background child keeps stdout open.
        let result = registry
            .create_with(EngineCommand::new("/bin/sh").args(["-c", "sleep 3 & sleep 0.3; exit 1"]))
            .await;

        match result {
            Err(SessionError::EarlyExit { status, .. }) => {
                assert_eq!(status, SessionStatus::Exited(Some(1)));
            }
            other => panic!("Expected EarlyExit, got {:?}", other),
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_list() {
        let registry = SessionRegistry::new(test_config());
        assert!(registry.list().is_empty());

        let a = registry.create_with(silent_engine()).await.unwrap();
        let b = registry.create_with(silent_engine()).await.unwrap();

        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, *a.id());
        assert_eq!(list[1].id, *b.id());
        assert!(list.iter().all(|s| s.running));

        registry.shutdown_all().await;
        assert_eq!(registry.count(), 0);
    }
}
