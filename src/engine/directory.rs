use dashmap::{DashMap, DashSet};
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::conflict::{authenticate, now_ms};
use super::{Engine, EngineError};

/// Profiles plus the administrators granted at runtime.
#[derive(Default)]
pub(super) struct Directory {
    profiles: DashMap<String, Profile>,
    granted_admins: DashSet<String>,
}

impl Directory {
    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::ProfileCreated { id, created_at } => {
                self.profiles.entry(id.clone()).or_insert_with(|| Profile {
                    id: id.clone(),
                    display_name: None,
                    color: None,
                    created_at: *created_at,
                });
            }
            Event::ProfileUpdated {
                id,
                display_name,
                color,
            } => {
                if let Some(mut profile) = self.profiles.get_mut(id) {
                    profile.display_name = display_name.clone();
                    profile.color = color.clone();
                }
            }
            Event::AdminGranted { id } => {
                self.granted_admins.insert(id.clone());
            }
            Event::AdminRevoked { id } => {
                self.granted_admins.remove(id);
            }
            Event::ReservationCreated { .. }
            | Event::ReservationUpdated { .. }
            | Event::ReservationDeleted { .. } => {}
        }
    }

    pub(super) fn profile(&self, id: &str) -> Option<Profile> {
        self.profiles.get(id).map(|p| p.value().clone())
    }

    pub(super) fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Named profiles first, alphabetically, then the rest by id.
    pub(super) fn profiles(&self) -> Vec<Profile> {
        let mut all: Vec<Profile> = self.profiles.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            let key = |p: &Profile| p.display_name.as_ref().map(|n| n.to_lowercase());
            match (key(a), key(b)) {
                (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.id.cmp(&b.id),
            }
        });
        all
    }

    pub(super) fn is_granted(&self, id: &str) -> bool {
        self.granted_admins.contains(id)
    }

    pub(super) fn granted_admins(&self) -> Vec<String> {
        self.granted_admins.iter().map(|id| id.key().clone()).collect()
    }
}

/// Trim; blank names count as no name.
pub(crate) fn normalize_display_name(name: Option<String>) -> Result<Option<String>, EngineError> {
    let Some(name) = name else { return Ok(None) };
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(EngineError::LimitExceeded("display name too long"));
    }
    Ok(Some(trimmed.to_string()))
}

/// `#RGB` or `#RRGGBB`, stored lowercase.
pub(crate) fn normalize_color(color: Option<String>) -> Result<Option<String>, EngineError> {
    let Some(color) = color else { return Ok(None) };
    let trimmed = color.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let valid = trimmed
        .strip_prefix('#')
        .is_some_and(|hex| matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(EngineError::InvalidColor(color));
    }
    Ok(Some(trimmed.to_ascii_lowercase()))
}

impl Engine {
    /// Profiles come into existence the first time an identity signs in.
    pub async fn ensure_profile(&self, id: &str) -> Result<Profile, EngineError> {
        let id = authenticate(id)?;
        if let Some(profile) = self.directory.profile(id) {
            return Ok(profile);
        }

        let _guard = self.directory_lock.lock().await;
        if let Some(profile) = self.directory.profile(id) {
            return Ok(profile);
        }
        if self.directory.profile_count() >= MAX_PROFILES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many profiles"));
        }

        let event = Event::ProfileCreated {
            id: id.to_string(),
            created_at: now_ms(),
        };
        self.persist_directory_event(&event).await?;
        info!("profile created for {id}");
        self.directory
            .profile(id)
            .ok_or_else(|| EngineError::profile_not_found(id))
    }

    /// The administrative edit path: set or clear display name and color.
    pub async fn update_profile(
        &self,
        caller: &str,
        id: &str,
        patch: ProfilePatch,
    ) -> Result<Profile, EngineError> {
        let caller = authenticate(caller)?;
        if !self.is_admin(caller) {
            return Err(EngineError::NotAdmin);
        }
        let display_name = patch
            .display_name
            .map(normalize_display_name)
            .transpose()?;
        let color = patch.color.map(normalize_color).transpose()?;

        let _guard = self.directory_lock.lock().await;
        let current = self
            .directory
            .profile(id)
            .ok_or_else(|| EngineError::profile_not_found(id))?;

        let event = Event::ProfileUpdated {
            id: current.id.clone(),
            display_name: display_name.unwrap_or(current.display_name),
            color: color.unwrap_or(current.color),
        };
        self.persist_directory_event(&event).await?;
        info!("profile {id} updated by {caller}");
        self.directory
            .profile(id)
            .ok_or_else(|| EngineError::profile_not_found(id))
    }

    /// Returns `false` if `id` already was an administrator.
    pub async fn grant_admin(&self, caller: &str, id: &str) -> Result<bool, EngineError> {
        let caller = authenticate(caller)?;
        let id = authenticate(id)?;
        if !self.is_admin(caller) {
            return Err(EngineError::NotAdmin);
        }
        let _guard = self.directory_lock.lock().await;
        if self.is_admin(id) {
            return Ok(false);
        }
        self.persist_directory_event(&Event::AdminGranted { id: id.to_string() })
            .await?;
        info!("{caller} granted administrator to {id}");
        Ok(true)
    }

    /// Returns `false` if `id` was not a granted administrator.
    pub async fn revoke_admin(&self, caller: &str, id: &str) -> Result<bool, EngineError> {
        let caller = authenticate(caller)?;
        if !self.is_admin(caller) {
            return Err(EngineError::NotAdmin);
        }
        if self.options.admins.contains(id) {
            return Err(EngineError::ConfiguredAdmin(id.to_string()));
        }
        let _guard = self.directory_lock.lock().await;
        if !self.directory.is_granted(id) {
            return Ok(false);
        }
        self.persist_directory_event(&Event::AdminRevoked { id: id.to_string() })
            .await?;
        info!("{caller} revoked administrator from {id}");
        Ok(true)
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.options.admins.contains(id) || self.directory.is_granted(id)
    }
}
