use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::track::{CodecError, TrackGroup};
use crate::user::User;

/// A session is a single track group shared by every user that joins it.
/// The track group is immutable after creation; the user set is the only
/// part that mutates, which is why it gets its own lock rather than sharing
/// the registry's.
#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub tracks: Arc<TrackGroup>,
    users: RwLock<HashMap<String, Arc<User>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("user '{0}' is already present in this session")]
    DuplicateUser(String),
}

impl Session {
    fn new(id: u32, tracks: TrackGroup) -> Self {
        Self {
            id,
            tracks: Arc::new(tracks),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a user under this session. Fails if the uid is already
    /// present, per the one-uid-per-session invariant.
    pub fn add_user(&self, user: Arc<User>) -> Result<(), JoinError> {
        let mut users = self.users.write().expect("session user lock poisoned");
        if users.contains_key(&user.uid) {
            return Err(JoinError::DuplicateUser(user.uid.clone()));
        }
        users.insert(user.uid.clone(), user);
        Ok(())
    }

    pub fn get_user(&self, uid: &str) -> Option<Arc<User>> {
        self.users
            .read()
            .expect("session user lock poisoned")
            .get(uid)
            .cloned()
    }

    pub fn remove_user(&self, uid: &str) {
        self.users
            .write()
            .expect("session user lock poisoned")
            .remove(uid);
    }

    pub fn user_count(&self) -> usize {
        self.users.read().expect("session user lock poisoned").len()
    }

    /// Users whose workers have both fully exited. Sweeping removes these.
    fn reapable_uids(&self) -> Vec<String> {
        self.users
            .read()
            .expect("session user lock poisoned")
            .values()
            .filter(|u| u.state.ws.is_reapable() && u.state.rtc.is_reapable())
            .map(|u| u.uid.clone())
            .collect()
    }
}

/// Process-wide map of session id to session. A session is created lazily
/// on first join and deleted once its last user is reaped.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
    video_codec: String,
    audio_codec: String,
}

impl SessionRegistry {
    pub fn new(video_codec: impl Into<String>, audio_codec: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            video_codec: video_codec.into(),
            audio_codec: audio_codec.into(),
        }
    }

    pub fn get(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session registry lock poisoned")
            .get(&session_id)
            .cloned()
    }

    /// Returns the session for `session_id`, creating it (with a fresh
    /// track group) if it doesn't exist yet.
    pub fn get_or_create(&self, session_id: u32) -> Result<Arc<Session>, CodecError> {
        if let Some(existing) = self.get(session_id) {
            return Ok(existing);
        }

        let mut sessions = self.sessions.write().expect("session registry lock poisoned");
        // Re-check under the write lock: another task may have created the
        // session between our read-lock miss above and acquiring this one.
        if let Some(existing) = sessions.get(&session_id) {
            return Ok(Arc::clone(existing));
        }

        let tracks = TrackGroup::new(&self.video_codec, &self.audio_codec)?;
        let session = Arc::new(Session::new(session_id, tracks));
        sessions.insert(session_id, Arc::clone(&session));
        Ok(session)
    }

    /// Reaps users whose ws and rtc substates have both settled into `Done`
    /// or `Killed`, then deletes any session left with no users. Intended to
    /// run periodically from a background task.
    pub fn sweep(&self) {
        let snapshot: Vec<Arc<Session>> = self
            .sessions
            .read()
            .expect("session registry lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut emptied = Vec::new();
        for session in &snapshot {
            for uid in session.reapable_uids() {
                session.remove_user(&uid);
            }
            if session.user_count() == 0 {
                emptied.push(session.id);
            }
        }

        if emptied.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().expect("session registry lock poisoned");
        for id in emptied {
            // A join may have raced in after we counted zero users; only
            // delete if it's still empty now that we hold the write lock.
            let still_empty = sessions
                .get(&id)
                .map(|s| s.user_count() == 0)
                .unwrap_or(false);
            if still_empty {
                sessions.remove(&id);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("session registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{SubStateValue, User, UserTiming};
    use std::time::Duration;

    fn timing() -> UserTiming {
        UserTiming {
            disconnect_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(2),
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new("video/H264", "audio/opus")
    }

    #[test]
    fn get_or_create_reuses_existing_session() {
        let reg = registry();
        let a = reg.get_or_create(7).unwrap();
        let b = reg.get_or_create(7).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn duplicate_uid_is_rejected() {
        let reg = registry();
        let session = reg.get_or_create(1).unwrap();

        let h1 = User::new(1, "alice".to_string(), timing());
        session.add_user(Arc::clone(&h1.user)).unwrap();

        let h2 = User::new(1, "alice".to_string(), timing());
        let err = session.add_user(h2.user).unwrap_err();
        assert!(matches!(err, JoinError::DuplicateUser(u) if u == "alice"));
    }

    #[test]
    fn sweep_removes_reaped_users_and_empty_sessions() {
        let reg = registry();
        let session = reg.get_or_create(3).unwrap();

        let handles = User::new(3, "bob".to_string(), timing());
        session.add_user(Arc::clone(&handles.user)).unwrap();
        assert_eq!(session.user_count(), 1);

        handles.user.state.ws.kill();
        handles.user.state.rtc.set(SubStateValue::Done);

        reg.sweep();
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn sweep_keeps_users_with_one_substate_still_active() {
        let reg = registry();
        let session = reg.get_or_create(4).unwrap();

        let handles = User::new(4, "carol".to_string(), timing());
        session.add_user(Arc::clone(&handles.user)).unwrap();

        handles.user.state.ws.set(SubStateValue::Done);
        // rtc substate never reached Done or Killed.
        reg.sweep();

        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.get(4).unwrap().user_count(), 1);
    }

    #[test]
    fn invalid_codec_mime_fails_session_creation() {
        let reg = SessionRegistry::new("H264", "audio/opus");
        let err = reg.get_or_create(9).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMimeType(_)));
    }
}
