//! Call-session lookup: the seam between the command surface and whatever
//! owns the calls.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::media::CodecFormat;

// ---------------------------------------------------------------------------
// CallSession / SessionLocator
// ---------------------------------------------------------------------------

/// A live call the DSP can attach to.
pub trait CallSession: Send + Sync {
    /// Unique call-session identifier.
    fn id(&self) -> &str;

    /// Geometry of the call's active read codec, already decoded to linear PCM.
    fn read_format(&self) -> CodecFormat;
}

/// Finds calls by identifier.
pub trait SessionLocator: Send + Sync {
    fn locate(&self, session_id: &str) -> Option<Arc<dyn CallSession>>;

    /// Identifiers of every live call, sorted.
    fn session_ids(&self) -> Vec<String>;
}

// Compile-time assertion: both traits must stay object-safe.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn CallSession>, _: Box<dyn SessionLocator>) {}
};

// ---------------------------------------------------------------------------
// SessionTable
// ---------------------------------------------------------------------------

/// Plain call with a fixed codec format.
#[derive(Debug, Clone)]
pub struct StaticSession {
    id: String,
    format: CodecFormat,
}

impl StaticSession {
    pub fn new(id: impl Into<String>, format: CodecFormat) -> Self {
        Self {
            id: id.into(),
            format,
        }
    }
}

impl CallSession for StaticSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_format(&self) -> CodecFormat {
        self.format
    }
}

/// In-memory [`SessionLocator`].
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<dyn CallSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<dyn CallSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id().to_string(), session);
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<dyn CallSession>> {
        self.sessions.write().unwrap().remove(session_id)
    }
}

impl SessionLocator for SessionTable {
    fn locate(&self, session_id: &str) -> Option<Arc<dyn CallSession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}
