//! Invite tokens for access-controlled rooms.
//!
//! Tokens are either reusable or single-use; single-use tokens are
//! invalidated atomically with the first successful resolution, so two
//! racing resolutions produce exactly one winner.

use crate::error::SessionError;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Invite {
    room_id: String,
    reusable: bool,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InviteManager {
    invites: Mutex<HashMap<String, Invite>>,
}

impl InviteManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a token for a room. `ttl_secs = None` means no expiry.
    pub fn create(&self, room_id: &str, reusable: bool, ttl_secs: Option<u64>) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let expires_at = ttl_secs.map(|secs| Utc::now() + Duration::seconds(secs as i64));

        self.invites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                token.clone(),
                Invite {
                    room_id: room_id.to_string(),
                    reusable,
                    expires_at,
                },
            );
        token
    }

    /// Resolves a token to its room, consuming it if single-use.
    pub fn resolve(&self, token: &str) -> Result<String, SessionError> {
        let mut invites = self.invites.lock().unwrap_or_else(|e| e.into_inner());

        let invite = invites.get(token).ok_or(SessionError::InviteNotFound)?;
        if let Some(expires_at) = invite.expires_at {
            if Utc::now() >= expires_at {
                invites.remove(token);
                return Err(SessionError::InviteExpired);
            }
        }

        let room_id = invite.room_id.clone();
        if !invite.reusable {
            invites.remove(token);
        }
        Ok(room_id)
    }

    /// Drops every invite pointing at a room (called when it is destroyed).
    pub fn remove_room(&self, room_id: &str) {
        self.invites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, invite| invite.room_id != room_id);
    }
}
