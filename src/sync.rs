use std::{
    fmt::Display,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::{debug, trace};

use crate::{
    clock::{self, Clock, RotationWindow},
    mode::{ModeSwitch, PresentationMode},
    store::{SecretEntry, SecretStore},
    totp, Decoration, OtpCode, OtpError,
};

/// Opaque handle for a rendered entry.
///
/// Ids are never reused, so an id from an older structural generation
/// simply stops resolving after a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEntry {
    pub id: EntryId,
    pub label: String,
    pub code: Result<OtpCode, OtpError>,
    pub position: usize,
    pub decoration: Decoration,
}

impl RenderedEntry {
    /// The line shown in the menu, e.g. `github: 123456`.
    pub fn title(&self) -> String {
        match &self.code {
            Ok(code) => format!("{}: {code}", self.label),
            Err(e) => format!("{}: ⚠ {e}", self.label),
        }
    }
}

/// A freshly derived code, computed outside any lock.
#[derive(Debug, Clone)]
pub struct DerivedCode {
    pub label: String,
    pub code: Result<OtpCode, OtpError>,
}

/// Derives every code in `snapshot`. One bad secret only fails its own entry.
pub fn derive_all(snapshot: &[SecretEntry], now: u64) -> Vec<DerivedCode> {
    snapshot
        .iter()
        .map(|entry| DerivedCode {
            label: entry.label.clone(),
            code: totp::derive(&entry.secret, now),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Codes updated in place; ids, positions and decorations kept.
    Incremental,
    /// Entries discarded and recreated.
    Structural,
}

#[derive(Debug)]
pub struct CodeList {
    entries: Vec<RenderedEntry>,
    mode: PresentationMode,
    generation: u64,
    next_id: u64,
    epoch: Option<u64>,
    stale: bool,
}

impl Default for CodeList {
    fn default() -> Self {
        // Never built yet, so the first refresh is always structural.
        Self {
            entries: Vec::new(),
            mode: PresentationMode::default(),
            generation: 0,
            next_id: 0,
            epoch: None,
            stale: true,
        }
    }
}

impl CodeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RenderedEntry] {
        &self.entries
    }

    pub fn mode(&self) -> PresentationMode {
        self.mode
    }

    /// Epoch the codes were last derived for.
    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Number of structural rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn resolve(&self, id: EntryId) -> Option<&RenderedEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Forces the next refresh to rebuild, whatever the labels look like.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn needs_refresh(&self, window: RotationWindow) -> bool {
        self.stale || clock::boundary_crossed(self.epoch, window)
    }

    /// Re-derives `snapshot` at `now` and folds the result into the list.
    pub fn refresh(&mut self, snapshot: &[SecretEntry], now: u64) -> Refresh {
        self.apply(derive_all(snapshot, now), RotationWindow::at(now))
    }

    /// Folds already derived codes into the list.
    ///
    /// Same labels in the same order update codes in place. Anything else
    /// rebuilds every entry with fresh ids and the current decoration.
    pub fn apply(&mut self, derived: Vec<DerivedCode>, window: RotationWindow) -> Refresh {
        let unchanged = !self.stale
            && self.entries.len() == derived.len()
            && self
                .entries
                .iter()
                .zip(&derived)
                .all(|(entry, fresh)| entry.label == fresh.label);

        self.epoch = Some(window.epoch);
        self.stale = false;

        if unchanged {
            for (entry, fresh) in self.entries.iter_mut().zip(derived) {
                entry.code = fresh.code;
            }
            trace!(epoch = window.epoch, "codes refreshed in place");

            return Refresh::Incremental;
        }

        let decoration = self.mode.decoration();
        let mut entries = Vec::with_capacity(derived.len());
        for (position, fresh) in derived.into_iter().enumerate() {
            entries.push(RenderedEntry {
                id: EntryId(self.next_id),
                label: fresh.label,
                code: fresh.code,
                position,
                decoration,
            });
            self.next_id += 1;
        }
        self.entries = entries;
        self.generation += 1;
        debug!(
            generation = self.generation,
            count = self.entries.len(),
            "code list rebuilt"
        );

        Refresh::Structural
    }

    /// Flips the mode and redecorates every entry in place.
    pub fn toggle_mode(&mut self) -> ModeSwitch {
        self.mode = self.mode.toggled();
        for entry in &mut self.entries {
            self.mode.decorate(entry);
        }

        ModeSwitch::to(self.mode)
    }
}

/// A point-in-time copy of the code list.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub window: RotationWindow,
    pub mode: PresentationMode,
    pub generation: u64,
    pub entries: Vec<RenderedEntry>,
}

impl ViewSnapshot {
    pub fn code_for(&self, label: &str) -> Option<&Result<OtpCode, OtpError>> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| &e.code)
    }
}

#[derive(Debug, Default)]
struct Tracked {
    list: CodeList,
    revision: Option<u64>,
}

/// The one synchronized view of the secret store.
pub struct CodeView {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    state: RwLock<Tracked>,
}

impl CodeView {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            state: RwLock::new(Tracked::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub fn window(&self) -> RotationWindow {
        self.clock.window()
    }

    /// Brings the list up to date with the clock and the store.
    ///
    /// Returns `None` when nothing needed doing. Derivation runs outside the
    /// lock; the result is swapped in under a single write.
    pub fn poll(&self) -> Option<Refresh> {
        self.poll_at(self.clock.now())
    }

    /// Polls, then copies the list out.
    pub fn snapshot(&self) -> ViewSnapshot {
        let now = self.clock.now();
        self.poll_at(now);

        self.read(|tracked| {
            let window = match tracked.list.epoch() {
                // A concurrent poll installed a later window than ours.
                Some(epoch) if epoch > now / clock::WINDOW_SECONDS => self.clock.window(),
                _ => RotationWindow::at(now),
            };

            ViewSnapshot {
                window,
                mode: tracked.list.mode(),
                generation: tracked.list.generation(),
                entries: tracked.list.entries().to_vec(),
            }
        })
    }

    pub fn resolve(&self, id: EntryId) -> Option<RenderedEntry> {
        self.read(|tracked| tracked.list.resolve(id).cloned())
    }

    pub fn mode(&self) -> PresentationMode {
        self.read(|tracked| tracked.list.mode())
    }

    pub fn toggle_mode(&self) -> ModeSwitch {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .toggle_mode()
    }

    /// Marks the list stale so the next poll rebuilds it.
    pub fn invalidate(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .invalidate();
    }

    fn poll_at(&self, now: u64) -> Option<Refresh> {
        let window = RotationWindow::at(now);
        // Read before listing so a concurrent mutation is caught next poll.
        let revision = self.store.revision();

        if !self.read(|tracked| Self::is_outdated(tracked, window, revision)) {
            return None;
        }

        let derived = derive_all(&self.store.list(), now);

        let mut tracked = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if Self::is_superseded(&tracked, window, revision) {
            trace!(revision, epoch = window.epoch, "dropping superseded poll");
            return None;
        }
        if !Self::is_outdated(&tracked, window, revision) {
            return None;
        }
        if tracked.revision.is_some_and(|seen| seen != revision) {
            tracked.list.invalidate();
        }
        tracked.revision = Some(revision);

        Some(tracked.list.apply(derived, window))
    }

    /// True when a slower poll would overwrite a newer store listing or a
    /// later window.
    fn is_superseded(tracked: &Tracked, window: RotationWindow, revision: u64) -> bool {
        match tracked.revision {
            Some(seen) if seen > revision => true,
            Some(seen) if seen == revision => {
                tracked.list.epoch().is_some_and(|epoch| epoch > window.epoch)
            }
            _ => false,
        }
    }

    fn is_outdated(tracked: &Tracked, window: RotationWindow, revision: u64) -> bool {
        tracked.revision != Some(revision) || tracked.list.needs_refresh(window)
    }

    fn read<R>(&self, f: impl FnOnce(&Tracked) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }
}
