//! Participant name resolution.
//!
//! Maps a user id to a display name via point lookups against the profile
//! collection. Absence, malformed profiles, lookup errors and timeouts all
//! degrade to the configured "unknown user" label; nothing here fails.
//!
//! The cache is readable without awaiting, so snapshot reconciliation can
//! attach known names and leave the rest to background lookups.

use quickchat_core::participant::ParticipantProfile;
use quickchat_core::store::{DocumentStore, StoreLayout};
use quickchat_core::SyncSettings;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct ParticipantResolver {
    store: Arc<dyn DocumentStore>,
    layout: StoreLayout,
    unknown_label: String,
    timeout: Duration,
    /// Successful lookups only; failures are retried on the next snapshot.
    cache: RwLock<HashMap<String, String>>,
}

impl ParticipantResolver {
    pub fn new(store: Arc<dyn DocumentStore>, settings: &SyncSettings) -> Self {
        Self {
            store,
            layout: StoreLayout::new(settings),
            unknown_label: settings.unknown_user_label.clone(),
            timeout: settings.resolve_timeout(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn unknown_label(&self) -> &str {
        &self.unknown_label
    }

    /// A previously resolved name, without touching the store.
    pub fn cached_name(&self, user_id: &str) -> Option<String> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .cloned()
    }

    /// Resolves `user_id` to a display name, or the unknown-user label.
    pub async fn resolve_name(&self, user_id: &str) -> String {
        if let Some(name) = self.cached_name(user_id) {
            return name;
        }

        match self.lookup_name(user_id).await {
            Some(name) => {
                self.cache
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(user_id.to_string(), name.clone());
                name
            }
            None => self.unknown_label.clone(),
        }
    }

    async fn lookup_name(&self, user_id: &str) -> Option<String> {
        let path = self.layout.user(user_id);
        let doc = match tokio::time::timeout(self.timeout, self.store.get(&path)).await {
            Ok(Ok(Some(doc))) => doc,
            Ok(Ok(None)) => {
                tracing::warn!("[ParticipantResolver] No profile for user {}", user_id);
                return None;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    "[ParticipantResolver] Profile lookup failed for user {}: {}",
                    user_id,
                    e
                );
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    "[ParticipantResolver] Profile lookup for user {} timed out after {:?}",
                    user_id,
                    self.timeout
                );
                return None;
            }
        };

        match ParticipantProfile::from_document(&doc) {
            Ok(profile) if !profile.display_name.trim().is_empty() => Some(profile.display_name),
            Ok(_) => {
                tracing::warn!("[ParticipantResolver] Profile {} has no display name", user_id);
                None
            }
            Err(e) => {
                tracing::warn!("[ParticipantResolver] Malformed profile {}: {}", user_id, e);
                None
            }
        }
    }

    /// Forgets every cached name (used when the signed-in identity changes).
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickchat_core::ChatError;
    use quickchat_core::store::WriteData;
    use quickchat_infrastructure::InMemoryDocumentStore;

    async fn store_with_profile(id: &str, name: &str) -> Arc<InMemoryDocumentStore> {
        let store = Arc::new(InMemoryDocumentStore::new());
        store
            .merge(
                &StoreLayout::default().user(id),
                WriteData::new()
                    .set("email", format!("{}@example.com", id))
                    .set("displayName", name),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_resolves_display_name() {
        let store = store_with_profile("u2", "Bob").await;
        let resolver = ParticipantResolver::new(store, &SyncSettings::default());
        assert_eq!(resolver.resolve_name("u2").await, "Bob");
    }

    #[tokio::test]
    async fn test_missing_profile_falls_back() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let resolver = ParticipantResolver::new(store, &SyncSettings::default());
        assert_eq!(resolver.resolve_name("ghost").await, "Unknown User");
    }

    #[tokio::test]
    async fn test_failed_lookup_falls_back_and_is_not_cached() {
        let store = store_with_profile("u2", "Bob").await;
        let path = StoreLayout::default().user("u2");
        store.fail_reads(path, ChatError::data_access("unreachable"));
        let resolver = ParticipantResolver::new(store.clone(), &SyncSettings::default());

        assert_eq!(resolver.resolve_name("u2").await, "Unknown User");
        assert_eq!(resolver.cached_name("u2"), None);

        store.clear_faults();
        assert_eq!(resolver.resolve_name("u2").await, "Bob");
    }

    #[tokio::test]
    async fn test_successful_lookup_is_cached() {
        let store = store_with_profile("u2", "Bob").await;
        let resolver = ParticipantResolver::new(store.clone(), &SyncSettings::default());
        assert_eq!(resolver.cached_name("u2"), None);
        assert_eq!(resolver.resolve_name("u2").await, "Bob");
        assert_eq!(resolver.cached_name("u2").as_deref(), Some("Bob"));

        store.fail_reads(
            StoreLayout::default().user("u2"),
            ChatError::data_access("unreachable"),
        );
        assert_eq!(resolver.resolve_name("u2").await, "Bob");

        resolver.clear_cache();
        assert_eq!(resolver.resolve_name("u2").await, "Unknown User");
    }

    #[tokio::test]
    async fn test_blank_display_name_uses_custom_label() {
        let store = store_with_profile("u2", "   ").await;
        let settings = SyncSettings {
            unknown_user_label: "Someone".to_string(),
            ..SyncSettings::default()
        };
        let resolver = ParticipantResolver::new(store, &settings);
        assert_eq!(resolver.resolve_name("u2").await, "Someone");
    }
}
