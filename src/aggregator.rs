//! Runtime profile aggregation.
//!
//! Writers for one user are serialized by that user's async mutex slot;
//! writers for different users never contend. Each applied event is
//! written through to the [`ProfileStore`] as a [`ProfileDelta`] and the
//! profile is then published as an `Arc<UserProfile>` snapshot, so readers
//! take a read lock for a clone of the `Arc` and never wait on a writer.
//!
//! [`ProfileDelta`]: rapport_core::profile::ProfileDelta

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};

use rapport_core::models::{
    CanonicalEvent, EventKind, EventPayload, OrderingKey, UserProfile, UNATTRIBUTED,
};
use rapport_core::profile::{ApplyOutcome, ProfileSettings, ProfileState};
use rapport_core::signals::mentioned_users;
use rapport_core::store::ProfileStore;
use rapport_core::topics::TopicExtractor;

type Slot = Arc<tokio::sync::Mutex<Option<ProfileState>>>;

pub struct ProfileAggregator {
    store: Arc<dyn ProfileStore>,
    extractor: Arc<dyn TopicExtractor>,
    settings: ProfileSettings,
    slots: Mutex<HashMap<String, Slot>>,
    snapshots: RwLock<HashMap<String, Arc<UserProfile>>>,
}

impl ProfileAggregator {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        extractor: Arc<dyn TopicExtractor>,
        settings: ProfileSettings,
    ) -> Self {
        Self {
            store,
            extractor,
            settings,
            slots: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Apply `event` to every profile it concerns: the actor's, the
    /// reacted message's author, and users a message mentions. Returns how
    /// many profiles changed.
    pub async fn apply(&self, event: &CanonicalEvent) -> Result<usize> {
        let mut changed = 0;
        for user_id in affected_users(event) {
            if self.apply_to(&user_id, event).await? == ApplyOutcome::Applied {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn apply_to(&self, user_id: &str, event: &CanonicalEvent) -> Result<ApplyOutcome> {
        let slot = self.slot(user_id);
        let mut guard = slot.lock().await;
        let state = self.loaded(user_id, &mut guard).await?;

        let (outcome, delta) =
            state.apply_tracked(event, self.extractor.as_ref(), &self.settings);
        if let Some(delta) = delta {
            if let Err(e) = self.store.save_delta(&state.profile, &delta).await {
                // Cached state is ahead of the store; reload on next use.
                *guard = None;
                return Err(e);
            }
            self.publish(&state.profile);
            tracing::debug!(
                user = user_id,
                event_id = %event.event_id,
                kind = event.kind.as_str(),
                "profile updated"
            );
        }
        Ok(outcome)
    }

    /// Latest committed profile. Never waits on writers.
    pub fn get_profile(&self, user_id: &str) -> Option<Arc<UserProfile>> {
        self.snapshots.read().get(user_id).cloned()
    }

    /// Like [`get_profile`](Self::get_profile), falling back to the store
    /// for users not touched since startup.
    pub async fn profile(&self, user_id: &str) -> Result<Option<Arc<UserProfile>>> {
        if let Some(p) = self.get_profile(user_id) {
            return Ok(Some(p));
        }
        match self.store.load_profile(user_id).await? {
            Some(state) => {
                let mut snapshots = self.snapshots.write();
                let entry = snapshots
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(state.profile));
                Ok(Some(Arc::clone(entry)))
            }
            None => Ok(None),
        }
    }

    /// Where the ordering gate for `key` should resume.
    pub async fn resume_point(&self, key: &OrderingKey) -> Result<(Option<u64>, Vec<String>)> {
        if key.user_id == UNATTRIBUTED {
            return Ok((None, Vec::new()));
        }
        let slot = self.slot(&key.user_id);
        let mut guard = slot.lock().await;
        let state = self.loaded(&key.user_id, &mut guard).await?;
        Ok((
            state
                .profile
                .highest_applied_sequence
                .get(&key.channel_id)
                .copied(),
            state.applied_posts_in(&key.channel_id),
        ))
    }

    fn slot(&self, user_id: &str) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(user_id.to_string()).or_default())
    }

    async fn loaded<'a>(
        &self,
        user_id: &str,
        guard: &'a mut Option<ProfileState>,
    ) -> Result<&'a mut ProfileState> {
        if guard.is_none() {
            let state = self
                .store
                .load_profile(user_id)
                .await?
                .unwrap_or_else(|| ProfileState::new(user_id));
            *guard = Some(state);
        }
        Ok(guard.get_or_insert_with(|| ProfileState::new(user_id)))
    }

    fn publish(&self, profile: &UserProfile) {
        self.snapshots
            .write()
            .insert(profile.user_id.clone(), Arc::new(profile.clone()));
    }
}

fn affected_users(event: &CanonicalEvent) -> Vec<String> {
    let mut users = Vec::new();
    let mut add = |user: &str| {
        if user != UNATTRIBUTED && !users.iter().any(|u| u == user) {
            users.push(user.to_string());
        }
    };
    add(&event.user_id);
    if let EventPayload::Reaction {
        item_user: Some(owner),
        ..
    } = &event.payload
    {
        add(owner);
    }
    if matches!(event.kind, EventKind::Post | EventKind::Edit) {
        if let Some(text) = event.text() {
            for user in mentioned_users(text) {
                add(&user);
            }
        }
    }
    users
}
