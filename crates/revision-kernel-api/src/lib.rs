use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use revision_kernel_core::{
    apply_snapshot, decode_snapshot, discriminator_value, encode_changes, encode_snapshot,
    merge_metadata, state_before_change, ActorContext, AttributeMap, ChangeSet, ItemId,
    NewRevision, RecordState, Revision, RevisionEvent, RevisionId, TrackingConfig, TypeRegistry,
    VersionedRecord,
};
use revision_kernel_store_sqlite::RevisionStore;
use time::{Duration, OffsetDateTime};

/// Default lookback window, in seconds, for single-valued association
/// reconstruction. A heuristic, not a guarantee: without knowing which parent
/// and child mutations were committed together there is no exact boundary to
/// find, so we approximate "the state the user was looking at".
pub const DEFAULT_LOOKBACK_SECONDS: f64 = 3.0;

/// Strategy for single-valued associations during reification.
#[derive(Debug, Clone, Copy, Default)]
pub enum HasOne {
    /// Leave associations pointing at their live current state.
    #[default]
    Live,
    /// Restore each time-traversable association to its state at
    /// `revision timestamp - lookback`.
    Lookback(Duration),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReifyOptions {
    pub has_one: HasOne,
}

impl ReifyOptions {
    #[must_use]
    pub fn lookback_seconds(seconds: f64) -> Self {
        Self { has_one: HasOne::Lookback(Duration::seconds_f64(seconds)) }
    }

    #[must_use]
    pub fn default_lookback() -> Self {
        Self::lookback_seconds(DEFAULT_LOOKBACK_SECONDS)
    }
}

/// Shared capture switches: one process-wide flag plus per-type flags.
///
/// The handle is explicitly threaded through engines rather than kept as
/// process-global state; independent handles never interfere. Clones share
/// state, so a suspension scope on a handle is visible to everything holding
/// a clone of that handle.
#[derive(Clone, Default)]
pub struct CaptureControl {
    inner: Arc<Mutex<ControlState>>,
}

#[derive(Debug, Default)]
struct ControlState {
    disabled_globally: bool,
    disabled_types: BTreeSet<String>,
}

impl CaptureControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_enabled(&self, item_type: &str) -> bool {
        let state = self.lock();
        !state.disabled_globally && !state.disabled_types.contains(item_type)
    }

    pub fn disable_all(&self) {
        self.lock().disabled_globally = true;
    }

    pub fn enable_all(&self) {
        self.lock().disabled_globally = false;
    }

    pub fn disable_type(&self, item_type: &str) {
        self.lock().disabled_types.insert(item_type.to_string());
    }

    pub fn enable_type(&self, item_type: &str) {
        self.lock().disabled_types.remove(item_type);
    }

    /// Disable capture for one type until the returned guard drops. The prior
    /// state is restored on drop, on normal and on unwinding exits alike.
    #[must_use]
    pub fn suspend(&self, item_type: &str) -> SuspendGuard {
        let was_disabled = !self.lock().disabled_types.insert(item_type.to_string());
        SuspendGuard { control: self.clone(), item_type: item_type.to_string(), was_disabled }
    }
}

pub struct SuspendGuard {
    control: CaptureControl,
    item_type: String,
    was_disabled: bool,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if !self.was_disabled {
            self.control.lock().disabled_types.remove(&self.item_type);
        }
    }
}

/// Orchestrates revision capture for one tracked record type. Hosts invoke
/// the `record_*` hooks from their create/update/destroy lifecycle, inside
/// the same unit of work as the primary mutation; a failed append fails the
/// whole event.
pub struct CaptureEngine<R> {
    config: TrackingConfig<R>,
    control: CaptureControl,
}

impl<R: VersionedRecord> CaptureEngine<R> {
    /// Build an engine with its own capture control.
    ///
    /// # Errors
    /// Returns a configuration error when tracking was requested but the
    /// ignore/skip/only sets leave nothing trackable.
    pub fn new(config: TrackingConfig<R>) -> Result<Self> {
        Self::with_control(config, CaptureControl::new())
    }

    /// Build an engine sharing an existing capture control.
    ///
    /// # Errors
    /// Returns a configuration error when the config is not viable.
    pub fn with_control(config: TrackingConfig<R>, control: CaptureControl) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, control })
    }

    #[must_use]
    pub fn control(&self) -> &CaptureControl {
        &self.control
    }

    #[must_use]
    pub fn config(&self) -> &TrackingConfig<R> {
        &self.config
    }

    fn capture_allowed(&self, record: &R, event: RevisionEvent) -> bool {
        self.control.is_enabled(record.item_type())
            && self.config.tracks_event(event)
            && self.config.gates_pass(record)
    }

    /// Capture a creation. The revision has no `object`: no prior state
    /// exists for a creation event.
    ///
    /// # Errors
    /// Returns an error when the append fails.
    pub fn record_create(
        &self,
        store: &mut RevisionStore,
        record: &R,
        actor: &ActorContext,
    ) -> Result<Option<Revision>> {
        if !self.capture_allowed(record, RevisionEvent::Create) {
            return Ok(None);
        }

        let revision = store.append(&NewRevision {
            item_type: record.item_type().to_string(),
            item_id: record.item_id(),
            event: RevisionEvent::Create,
            recorded_at: OffsetDateTime::now_utc(),
            object: None,
            object_changes: None,
            whodunnit: actor.whodunnit.clone(),
            metadata: merge_metadata(&self.config.meta, record, actor),
        })?;
        Ok(Some(revision))
    }

    /// Capture an update: snapshot the pre-update state, and the notable
    /// diff when the deployment has a changes column. An update with no
    /// notable change records nothing and has no side effect.
    ///
    /// # Errors
    /// Returns an error when encoding or the append fails.
    pub fn record_update(
        &self,
        store: &mut RevisionStore,
        record: &R,
        changes: &ChangeSet,
        actor: &ActorContext,
    ) -> Result<Option<Revision>> {
        if !self.capture_allowed(record, RevisionEvent::Update) {
            return Ok(None);
        }

        let changed: Vec<String> = changes.keys().cloned().collect();
        let notable: BTreeSet<String> = self.config.notably_changed(&changed).into_iter().collect();
        if notable.is_empty() {
            return Ok(None);
        }

        let before = state_before_change(record, changes);
        let object = encode_snapshot(&before, &self.config.skipped)?;
        let object_changes = if store.has_changes_column() {
            let notable_changes: ChangeSet = changes
                .iter()
                .filter(|(name, _)| notable.contains(name.as_str()))
                .map(|(name, change)| (name.clone(), change.clone()))
                .collect();
            Some(encode_changes(&notable_changes)?)
        } else {
            None
        };

        let revision = store.append(&NewRevision {
            item_type: record.item_type().to_string(),
            item_id: record.item_id(),
            event: RevisionEvent::Update,
            recorded_at: OffsetDateTime::now_utc(),
            object: Some(object),
            object_changes,
            whodunnit: actor.whodunnit.clone(),
            metadata: merge_metadata(&self.config.meta, record, actor),
        })?;
        Ok(Some(revision))
    }

    /// Capture a destruction with the full final living state. Transient
    /// records that were never persisted record nothing. The returned
    /// revision is the trail's new tail; callers holding a cached trail for
    /// this item must re-read it.
    ///
    /// # Errors
    /// Returns an error when encoding or the append fails.
    pub fn record_destroy(
        &self,
        store: &mut RevisionStore,
        record: &R,
        actor: &ActorContext,
    ) -> Result<Option<Revision>> {
        if !record.persisted() || !self.capture_allowed(record, RevisionEvent::Destroy) {
            return Ok(None);
        }

        let object = encode_snapshot(&record.attributes(), &self.config.skipped)?;
        let revision = store.append(&NewRevision {
            item_type: record.item_type().to_string(),
            item_id: record.item_id(),
            event: RevisionEvent::Destroy,
            recorded_at: OffsetDateTime::now_utc(),
            object: Some(object),
            object_changes: None,
            whodunnit: actor.whodunnit.clone(),
            metadata: merge_metadata(&self.config.meta, record, actor),
        })?;
        Ok(Some(revision))
    }
}

/// A record type whose state can be read back at an arbitrary point in time.
/// `HasOneChild` values returned by registered association resolvers opt in
/// through this trait; the reification engine refuses to guess at types that
/// do not.
pub trait TimeTraversable {
    /// The record's attribute state as of `at`: the live attributes when no
    /// revision follows `at`, the decoded pre-change snapshot of the first
    /// following revision otherwise, and `None` when the record did not yet
    /// exist at `at`.
    ///
    /// # Errors
    /// Returns an error when the store read or snapshot decode fails.
    fn state_at(&self, store: &RevisionStore, at: OffsetDateTime) -> Result<Option<AttributeMap>>;
}

impl TimeTraversable for revision_kernel_core::HasOneChild {
    fn state_at(&self, store: &RevisionStore, at: OffsetDateTime) -> Result<Option<AttributeMap>> {
        let following = store.following(&self.item_type, &self.item_id, at)?;
        let Some(revision) = following.first() else {
            return Ok(Some(self.attributes.clone()));
        };
        let Some(raw) = revision.object.as_deref() else {
            // The first revision after `at` is the create: no state yet.
            return Ok(None);
        };

        let historical = decode_snapshot(raw)?;
        let mut merged = self.attributes.clone();
        for (name, value) in historical {
            // Overlay in place: only attributes the live child still carries.
            if merged.contains_key(&name) {
                merged.insert(name, value);
            }
        }
        Ok(Some(merged))
    }
}

/// A reconstructed historical record: the typed instance, the revision it
/// came from, and - under a lookback strategy - the approximate state of its
/// single-valued associations (`None` value = association did not exist yet).
pub struct Reified {
    pub record: Box<dyn RecordState>,
    pub source_revision: RevisionId,
    pub has_ones: BTreeMap<String, Option<AttributeMap>>,
}

impl Reified {
    /// Reified instances are historical by construction; only records
    /// fetched from the live store are live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        false
    }
}

/// Reconstructs typed historical records from stored snapshots.
pub struct ReificationEngine<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> ReificationEngine<'a> {
    #[must_use]
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Reify one revision. Yields `None` for create revisions: there is no
    /// "before" state for a creation event.
    ///
    /// # Errors
    /// Returns a decode error for malformed snapshots and a type-resolution
    /// error for unknown discriminators; neither is retried.
    pub fn reify(
        &self,
        store: &RevisionStore,
        revision: &Revision,
        options: ReifyOptions,
    ) -> Result<Option<Reified>> {
        let Some(raw) = revision.object.as_deref() else {
            return Ok(None);
        };

        let attributes = decode_snapshot(raw)?;
        let discriminator = discriminator_value(&attributes, self.registry.discriminator());
        let entry = self.registry.resolve(discriminator, &revision.item_type)?;

        let mut record = entry.instantiate();
        apply_snapshot(record.as_mut(), &attributes);

        let mut has_ones = BTreeMap::new();
        if let HasOne::Lookback(lookback) = options.has_one {
            let target_at = revision.recorded_at - lookback;
            for resolver in entry.has_one_resolvers() {
                let Some(child) = resolver(record.as_ref()) else {
                    continue;
                };
                let state = child.state_at(store, target_at)?;
                has_ones.insert(child.name.clone(), state);
            }
        }

        Ok(Some(Reified { record, source_revision: revision.id, has_ones }))
    }

    /// The state the record had just before the one `reified` captures.
    ///
    /// # Errors
    /// Returns an error when store reads or reification fail.
    pub fn previous_state(
        &self,
        store: &RevisionStore,
        reified: &Reified,
        options: ReifyOptions,
    ) -> Result<Option<Reified>> {
        let Some(source) = store.get(reified.source_revision)? else {
            return Ok(None);
        };
        let Some(previous) = store.previous(&source)? else {
            return Ok(None);
        };
        self.reify(store, &previous, options)
    }

    /// The state the record moved to next. `None` past the end of the trail.
    ///
    /// # Errors
    /// Returns an error when store reads or reification fail.
    pub fn next_state(
        &self,
        store: &RevisionStore,
        reified: &Reified,
        options: ReifyOptions,
    ) -> Result<Option<Reified>> {
        let Some(source) = store.get(reified.source_revision)? else {
            return Ok(None);
        };
        let Some(next) = store.next(&source)? else {
            return Ok(None);
        };
        self.reify(store, &next, options)
    }
}

/// Outcome of a point-in-time query: the item did not exist yet, existed in
/// the reconstructed historical state, or is best represented by its live
/// current state.
pub enum RecordAt {
    Absent,
    Historical(Reified),
    Live,
}

/// Query facade over one item's trail.
pub struct ItemHistory<'a> {
    store: &'a RevisionStore,
    item_type: String,
    item_id: ItemId,
}

impl<'a> ItemHistory<'a> {
    pub fn new(store: &'a RevisionStore, item_type: impl Into<String>, item_id: ItemId) -> Self {
        Self { store, item_type: item_type.into(), item_id }
    }

    pub fn for_record<R: VersionedRecord>(store: &'a RevisionStore, record: &R) -> Self {
        Self::new(store, record.item_type().to_string(), record.item_id())
    }

    /// All revisions for the item, ordered `(timestamp, id)` ascending.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn revisions(&self) -> Result<Vec<Revision>> {
        self.store.for_item(&self.item_type, &self.item_id)
    }

    /// Who put the item into its current state.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn originator(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .last_for_item(&self.item_type, &self.item_id)?
            .and_then(|revision| revision.whodunnit))
    }

    /// The item as it was at `at`. A revision stores the state *before* its
    /// change, so the first revision after `at` holds the state as of `at`;
    /// with no such revision the live state stands.
    ///
    /// # Errors
    /// Returns an error when store reads or reification fail.
    pub fn revision_at(
        &self,
        engine: &ReificationEngine<'_>,
        at: OffsetDateTime,
        options: ReifyOptions,
    ) -> Result<RecordAt> {
        let following = self.store.following(&self.item_type, &self.item_id, at)?;
        let Some(revision) = following.first() else {
            return Ok(RecordAt::Live);
        };
        match engine.reify(self.store, revision, options)? {
            Some(reified) => Ok(RecordAt::Historical(reified)),
            None => Ok(RecordAt::Absent),
        }
    }

    /// The item's states across the exclusive `(start, end)` window, one per
    /// revision recorded inside it.
    ///
    /// # Errors
    /// Returns an error when store reads or reification fail.
    pub fn revisions_between(
        &self,
        engine: &ReificationEngine<'_>,
        start: OffsetDateTime,
        end: OffsetDateTime,
        options: ReifyOptions,
    ) -> Result<Vec<RecordAt>> {
        let mut states = Vec::new();
        for revision in self.store.between(&self.item_type, &self.item_id, start, end)? {
            states.push(self.revision_at(engine, revision.recorded_at, options)?);
        }
        Ok(states)
    }

    /// The item as it was most recently before its current state.
    ///
    /// # Errors
    /// Returns an error when store reads or reification fail.
    pub fn previous_state(
        &self,
        engine: &ReificationEngine<'_>,
        options: ReifyOptions,
    ) -> Result<Option<Reified>> {
        match self.store.last_for_item(&self.item_type, &self.item_id)? {
            Some(revision) => engine.reify(self.store, &revision, options),
            None => Ok(None),
        }
    }
}

/// Who put the item into the state stored in `revision`: the whodunnit of
/// the revision before it.
///
/// # Errors
/// Returns an error when the adjacency read fails.
pub fn revision_originator(store: &RevisionStore, revision: &Revision) -> Result<Option<String>> {
    Ok(store.previous(revision)?.and_then(|previous| previous.whodunnit))
}
