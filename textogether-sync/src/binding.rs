//! Glue between a replica and an editor surface.
//!
//! User edits are routed through the binding, which applies them to the
//! surface and to the replica under its own origin tag. [`EditorBinding::pump`]
//! applies every other change to the surface and keeps remote cursor
//! decorations in step with the awareness store. Changes carrying the
//! binding's own tag are skipped, so an edit never bounces back into the
//! editor that produced it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, trace};

use textogether_types::ClientId;

use crate::awareness::{Awareness, AwarenessChange, CursorRange, PresenceState, PresenceUpdate};
use crate::doc::{SharedText, TextChange, TextEdit};
use crate::error::Result;

/// Decoration for another participant's cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub display_name: String,
    pub color: String,
    pub range: Option<CursorRange>,
}

impl From<&PresenceState> for RemoteCursor {
    fn from(state: &PresenceState) -> Self {
        Self {
            display_name: state.display_name.clone(),
            color: state.color.clone(),
            range: state.cursor,
        }
    }
}

/// What a binding needs from an editor widget.
pub trait EditorSurface {
    /// Replace the whole content.
    fn reset(&mut self, text: &str);

    fn apply_edit(&mut self, edit: &TextEdit);

    fn set_remote_cursor(&mut self, client: ClientId, cursor: &RemoteCursor);

    fn remove_remote_cursor(&mut self, client: ClientId);
}

pub struct EditorBinding<S> {
    doc: Arc<SharedText>,
    awareness: Arc<Awareness>,
    surface: S,
    origin: String,
    changes: Receiver<TextChange>,
    presence: Receiver<AwarenessChange>,
    decorated: HashSet<ClientId>,
}

impl<S: EditorSurface> EditorBinding<S> {
    /// Bind `surface`, loading the current text and remote cursors into it.
    pub fn new(doc: Arc<SharedText>, awareness: Arc<Awareness>, mut surface: S) -> Self {
        let changes = doc.subscribe_changes();
        let presence = awareness.subscribe();
        surface.reset(&doc.text());

        let mut binding = Self {
            doc,
            awareness,
            surface,
            origin: format!("binding-{}", uuid::Uuid::new_v4().simple()),
            changes,
            presence,
            decorated: HashSet::new(),
        };
        binding.refresh_cursors();
        binding
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    /// Insert typed text at `index`.
    ///
    /// Pending remote changes are applied first so `index` refers to the
    /// same content in the surface and the replica. Imports wait until the
    /// edit has reached both.
    pub fn local_insert(&mut self, index: usize, text: &str) -> Result<()> {
        let doc = self.doc.clone();
        let _edits = doc.lock_edits();
        self.pump();
        doc.insert_with_origin(index, text, &self.origin)?;
        self.surface.apply_edit(&TextEdit::insert(index, text));
        Ok(())
    }

    pub fn local_delete(&mut self, index: usize, len: usize) -> Result<()> {
        let doc = self.doc.clone();
        let _edits = doc.lock_edits();
        self.pump();
        doc.delete_with_origin(index, len, &self.origin)?;
        self.surface.apply_edit(&TextEdit::delete(index, len));
        Ok(())
    }

    /// Publish the local selection.
    pub fn set_cursor(&self, range: Option<CursorRange>) {
        self.awareness
            .set_local_state(PresenceUpdate::new().cursor(range));
    }

    /// Apply pending replica and awareness changes to the surface.
    ///
    /// Returns the number of text changes applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.changes.try_recv() {
                Ok(change) if change.is_tagged(&self.origin) => {
                    trace!(origin = %self.origin, "skipping own change");
                }
                Ok(change) => {
                    for edit in change.edits.iter().filter(|e| !e.is_noop()) {
                        self.surface.apply_edit(edit);
                    }
                    applied += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    debug!(missed, "binding fell behind, reloading surface");
                    self.changes = self.changes.resubscribe();
                    self.surface.reset(&self.doc.text());
                    applied += 1;
                    break;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        loop {
            match self.presence.try_recv() {
                Ok(change) => self.apply_presence(&change),
                Err(TryRecvError::Lagged(_)) => {
                    self.presence = self.presence.resubscribe();
                    self.refresh_cursors();
                    break;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        applied
    }

    fn apply_presence(&mut self, change: &AwarenessChange) {
        let local = self.awareness.client_id();
        let states = self.awareness.get_states();
        for client in change.added.iter().chain(&change.updated) {
            if *client == local {
                continue;
            }
            if let Some(state) = states.get(client) {
                self.surface
                    .set_remote_cursor(*client, &RemoteCursor::from(state));
                self.decorated.insert(*client);
            }
        }
        for client in &change.removed {
            if self.decorated.remove(client) {
                self.surface.remove_remote_cursor(*client);
            }
        }
    }

    /// Rebuild every decoration from the awareness store.
    fn refresh_cursors(&mut self) {
        let local = self.awareness.client_id();
        let states = self.awareness.get_states();
        for client in std::mem::take(&mut self.decorated) {
            if !states.contains_key(&client) {
                self.surface.remove_remote_cursor(client);
            }
        }
        for (client, state) in states.iter().filter(|(id, _)| **id != local) {
            self.surface
                .set_remote_cursor(*client, &RemoteCursor::from(state));
            self.decorated.insert(*client);
        }
    }
}

/// Surface backed by a plain `String`.
#[derive(Debug, Clone, Default)]
pub struct PlainTextSurface {
    text: String,
    cursors: BTreeMap<ClientId, RemoteCursor>,
}

impl PlainTextSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn cursors(&self) -> &BTreeMap<ClientId, RemoteCursor> {
        &self.cursors
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.text
            .char_indices()
            .nth(chars)
            .map_or(self.text.len(), |(offset, _)| offset)
    }
}

impl EditorSurface for PlainTextSurface {
    fn reset(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn apply_edit(&mut self, edit: &TextEdit) {
        let start = self.byte_offset(edit.index);
        if edit.delete > 0 {
            let end = self.byte_offset(edit.index + edit.delete);
            self.text.replace_range(start..end, "");
        }
        self.text.insert_str(start, &edit.insert);
    }

    fn set_remote_cursor(&mut self, client: ClientId, cursor: &RemoteCursor) {
        self.cursors.insert(client, cursor.clone());
    }

    fn remove_remote_cursor(&mut self, client: ClientId) {
        self.cursors.remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::DEFAULT_TIMEOUT;
    use crate::error::SyncError;
    use textogether_types::Identity;

    fn replica() -> (Arc<SharedText>, Arc<Awareness>) {
        let awareness = Arc::new(Awareness::new(ClientId::random(), DEFAULT_TIMEOUT));
        awareness.set_local_state(PresenceUpdate::new().identity(&Identity::new("u1", "Ada")));
        (Arc::new(SharedText::new()), awareness)
    }

    #[test]
    fn test_surface_starts_with_document_text() {
        let (doc, awareness) = replica();
        doc.insert(0, "\\documentclass{article}").unwrap();
        let binding = EditorBinding::new(doc, awareness, PlainTextSurface::new());
        assert_eq!(binding.surface().text(), "\\documentclass{article}");
    }

    #[test]
    fn test_own_edits_are_not_reapplied() {
        let (doc, awareness) = replica();
        let mut binding = EditorBinding::new(doc.clone(), awareness, PlainTextSurface::new());

        binding.local_insert(0, "abc").unwrap();
        binding.local_delete(1, 1).unwrap();
        assert_eq!(binding.pump(), 0);
        assert_eq!(binding.surface().text(), "ac");
        assert_eq!(doc.text(), "ac");
    }

    #[test]
    fn test_other_changes_reach_surface() {
        let (doc, awareness) = replica();
        let mut binding = EditorBinding::new(doc.clone(), awareness, PlainTextSurface::new());

        let peer = SharedText::new();
        peer.insert(0, "héllo wörld").unwrap();
        doc.apply_update(&peer.encode_state_as_update().unwrap())
            .unwrap();
        doc.delete(5, 1).unwrap();

        assert_eq!(binding.pump(), 2);
        assert_eq!(binding.surface().text(), doc.text());
        assert_eq!(binding.surface().text(), "héllowörld");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_typing_during_imports_keeps_surface_in_step() {
        let (doc, awareness) = replica();

        let peer = SharedText::new();
        let mut updates = Vec::new();
        for i in 0..300 {
            let seen = peer.encode_state_vector();
            peer.insert(i, "R").unwrap();
            updates.push(peer.encode_update_since(&seen).unwrap());
        }

        let binding = EditorBinding::new(doc.clone(), awareness, PlainTextSurface::new());
        let importer = {
            let doc = doc.clone();
            tokio::spawn(async move {
                for update in updates {
                    doc.apply_update(&update).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let typist = tokio::task::spawn_blocking(move || {
            let mut binding = binding;
            for _ in 0..300 {
                let end = binding.surface().text().chars().count();
                binding.local_insert(end, "L").unwrap();
            }
            binding
        });

        importer.await.unwrap();
        let mut binding = typist.await.unwrap();
        binding.pump();
        let text = doc.text();
        assert_eq!(binding.surface().text(), text);
        assert_eq!(text.matches('L').count(), 300);
        assert_eq!(text.matches('R').count(), 300);
    }

    #[test]
    fn test_invalid_local_edit_leaves_surface_untouched() {
        let (doc, awareness) = replica();
        let mut binding = EditorBinding::new(doc, awareness, PlainTextSurface::new());
        binding.local_insert(0, "ab").unwrap();

        assert!(matches!(
            binding.local_delete(1, 5),
            Err(SyncError::InvalidRange { .. })
        ));
        assert_eq!(binding.surface().text(), "ab");
    }

    #[test]
    fn test_remote_cursors_follow_awareness() {
        let (doc, awareness) = replica();
        let mut binding = EditorBinding::new(doc, awareness.clone(), PlainTextSurface::new());

        let peer = Awareness::new(ClientId::random(), DEFAULT_TIMEOUT);
        peer.set_local_state(
            PresenceUpdate::new()
                .identity(&Identity::new("u2", "Grace"))
                .cursor(Some(CursorRange { anchor: 1, head: 4 })),
        );
        awareness
            .apply_update(&peer.encode_local_update().unwrap())
            .unwrap();
        binding.set_cursor(Some(CursorRange::caret(0)));
        binding.pump();

        let cursors = binding.surface().cursors();
        assert_eq!(cursors.len(), 1);
        let cursor = &cursors[&peer.client_id()];
        assert_eq!(cursor.display_name, "Grace");
        assert_eq!(cursor.range, Some(CursorRange { anchor: 1, head: 4 }));

        peer.remove_local_state();
        awareness
            .apply_update(&peer.encode_local_update().unwrap())
            .unwrap();
        binding.pump();
        assert!(binding.surface().cursors().is_empty());
    }

    #[test]
    fn test_plain_surface_edits_use_char_offsets() {
        let mut surface = PlainTextSurface::new();
        surface.reset("a∑b");
        surface.apply_edit(&TextEdit {
            index: 1,
            delete: 1,
            insert: "+".into(),
        });
        assert_eq!(surface.text(), "a+b");
        surface.apply_edit(&TextEdit::insert(3, "!"));
        assert_eq!(surface.text(), "a+b!");
    }
}
