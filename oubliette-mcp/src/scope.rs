//! Resolves the `(target, access)` pair an operation is checked against,
//! and enforces it against the caller's `AuthContext`.

use oubliette_core::{Access, AuthContext, Scope, SessionStore, Target};
use uuid::Uuid;

use crate::error::DispatchError;

/// Resolves the project id a call is scoped to, per the four-step
/// algorithm: explicit `project_id`, else the project of `session_id`,
/// else the caller's own session's project (child-session relay), else
/// `target=global`.
pub async fn resolve_target(
    session_store: &dyn SessionStore,
    project_id: Option<Uuid>,
    session_id: Option<&str>,
    relay_project_id: Option<Uuid>,
) -> Result<Target, DispatchError> {
    if let Some(p) = project_id {
        return Ok(Target::Project(p));
    }
    if let Some(sid) = session_id {
        let session = session_store
            .get(sid)
            .await
            .map_err(oubliette_core::Error::from)?
            .ok_or_else(|| oubliette_core::Error::NotFound(format!("session {sid}")))?;
        return Ok(Target::Project(session.project_id));
    }
    if let Some(p) = relay_project_id {
        return Ok(Target::Project(p));
    }
    Ok(Target::Global)
}

/// Checks the permission matrix; `Err(PermissionDenied)` on refusal.
pub fn authorize(auth: &AuthContext, target: Target, access: Access) -> Result<(), DispatchError> {
    if auth.scope.permits(target, access) {
        Ok(())
    } else {
        Err(oubliette_core::Error::PermissionDenied(format!(
            "scope {:?} does not permit {:?} access to {:?}",
            auth.scope, access, target
        ))
        .into())
    }
}

/// Filters a list of scope-carrying items down to what `reader` may see,
/// used by `project.list`/`workspace.list` (schedule listing uses
/// `Schedule::visible_to` directly since it checks against the creator's
/// captured scope rather than a live project match).
pub fn visible_project(reader: &Scope, project_id: Uuid) -> bool {
    reader.permits(Target::Project(project_id), Access::Read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oubliette_core::{Session, SessionError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSessionStore {
        sessions: Mutex<HashMap<String, Session>>,
    }

    #[async_trait]
    impl SessionStore for FakeSessionStore {
        async fn save(&self, session: &Session) -> std::result::Result<(), SessionError> {
            self.sessions
                .lock()
                .unwrap()
                .insert(session.id.clone(), session.clone());
            Ok(())
        }
        async fn get(&self, id: &str) -> std::result::Result<Option<Session>, SessionError> {
            Ok(self.sessions.lock().unwrap().get(id).cloned())
        }
        async fn list(
            &self,
            _project_id: Option<Uuid>,
        ) -> std::result::Result<Vec<Session>, SessionError> {
            Ok(self.sessions.lock().unwrap().values().cloned().collect())
        }
        async fn delete(&self, id: &str) -> std::result::Result<(), SessionError> {
            self.sessions.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolve_target_prefers_explicit_project_id() {
        let store = FakeSessionStore::default();
        let p = Uuid::new_v4();
        let target = resolve_target(&store, Some(p), Some("s1"), None).await.unwrap();
        assert_eq!(target, Target::Project(p));
    }

    #[tokio::test]
    async fn test_resolve_target_falls_back_to_session_project() {
        let store = FakeSessionStore::default();
        let p = Uuid::new_v4();
        let session = Session::new_prime(
            "s1".to_string(),
            p,
            Uuid::new_v4(),
            "claude",
            "admin",
        );
        store.save(&session).await.unwrap();
        let target = resolve_target(&store, None, Some("s1"), None).await.unwrap();
        assert_eq!(target, Target::Project(p));
    }

    #[tokio::test]
    async fn test_resolve_target_defaults_to_global() {
        let store = FakeSessionStore::default();
        let target = resolve_target(&store, None, None, None).await.unwrap();
        assert_eq!(target, Target::Global);
    }

    #[test]
    fn test_authorize_rejects_cross_project_write() {
        let auth = AuthContext {
            token_id: Uuid::new_v4(),
            scope: Scope::Project(Uuid::new_v4()),
        };
        let err = authorize(&auth, Target::Project(Uuid::new_v4()), Access::Write).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::PermissionDenied);
    }
}
