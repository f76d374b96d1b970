//! Character Cards
//!
//! One card per displayed character. The controller drives cards only through
//! the semantic operations of [`CardRegistry`], so it never deals with how a
//! card is drawn. [`InMemoryCardRegistry`] is the model that front ends render
//! from; it broadcasts every change as a [`CardUpdate`].

use crate::{models::Character, voice::MessageSource};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Label shown on the talk button of the active card.
pub const END_CONVERSATION_LABEL: &str = "End Conversation";

/// Identifies a mounted card. Ids are handed out in mount order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CardId(pub usize);

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptLine {
    pub source: MessageSource,
    pub text: String,
}

/// Presentation state of a single card.
#[derive(Debug, Clone, Serialize)]
pub struct CardUiState {
    pub id: CardId,
    pub character: Character,
    pub label: String,
    pub enabled: bool,
    pub active: bool,
    pub speaking: bool,
    pub failed: bool,
    pub intensity: f32,
    pub transcript: Vec<TranscriptLine>,
}

impl CardUiState {
    fn new(id: CardId, character: Character) -> Self {
        let mut card = Self {
            id,
            label: String::new(),
            character,
            enabled: true,
            active: false,
            speaking: false,
            failed: false,
            intensity: 0.0,
            transcript: Vec::new(),
        };
        card.label = card.default_label();
        card
    }

    pub fn default_label(&self) -> String {
        format!("Talk to {}", self.character.first_name())
    }

    pub fn is_default(&self) -> bool {
        self.enabled
            && !self.active
            && !self.speaking
            && !self.failed
            && self.label == self.default_label()
    }

    fn reset(&mut self) {
        self.label = self.default_label();
        self.enabled = true;
        self.active = false;
        self.speaking = false;
        self.failed = false;
        self.intensity = 0.0;
    }
}

/// A change to the card model, broadcast to renderers.
#[derive(Debug, Clone, PartialEq)]
pub enum CardUpdate {
    Mounted(CardId),
    Cleared,
    Label { card: CardId, label: String, enabled: bool },
    Active { card: CardId, active: bool },
    Speaking { card: CardId, speaking: bool },
    Transcript { card: CardId, line: TranscriptLine },
    FocusMode(bool),
}

/// Semantic operations on the card model. All updates are idempotent and
/// ignore unknown cards.
pub trait CardRegistry: Send + Sync {
    fn mount(&self, character: Character) -> CardId;
    fn unmount_all(&self);
    fn card(&self, card: CardId) -> Option<CardUiState>;
    fn cards(&self) -> Vec<CardUiState>;

    /// Shows an advisory busy label and disables the talk button.
    fn set_busy(&self, card: CardId, label: &str);
    /// Shows a failure status with the button enabled for retry.
    fn set_failed(&self, card: CardId, label: &str);
    /// Marks a card active; at most one card is active at a time.
    fn set_active(&self, card: CardId, active: bool);
    fn set_speaking(&self, card: CardId, speaking: bool);
    fn set_intensity(&self, card: CardId, intensity: f32);
    fn append_transcript(&self, card: CardId, line: TranscriptLine);
    fn reset_to_default(&self, card: CardId);
    fn reset_all(&self);

    fn active_card(&self) -> Option<CardId>;
    fn set_focus_mode(&self, on: bool);
    fn focus_mode(&self) -> bool;
}

#[derive(Default)]
struct Cards {
    cards: Vec<CardUiState>,
    focus_mode: bool,
}

pub struct InMemoryCardRegistry {
    inner: Mutex<Cards>,
    updates: broadcast::Sender<CardUpdate>,
}

impl Default for InMemoryCardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCardRegistry {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Cards::default()),
            updates,
        }
    }

    /// Subscribes to card changes. Intensity updates are not broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<CardUpdate> {
        self.updates.subscribe()
    }

    fn with_cards<R>(&self, f: impl FnOnce(&mut Cards) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn with_card(&self, card: CardId, f: impl FnOnce(&mut CardUiState) -> Option<CardUpdate>) {
        let update = self.with_cards(|state| match state.cards.get_mut(card.0) {
            Some(c) => f(c),
            None => {
                debug!(%card, "Ignoring update for unknown card");
                None
            }
        });
        if let Some(update) = update {
            self.publish(update);
        }
    }

    fn publish(&self, update: CardUpdate) {
        // No renderer attached is fine.
        let _ = self.updates.send(update);
    }
}

fn label_update(c: &CardUiState) -> CardUpdate {
    CardUpdate::Label {
        card: c.id,
        label: c.label.clone(),
        enabled: c.enabled,
    }
}

impl CardRegistry for InMemoryCardRegistry {
    fn mount(&self, character: Character) -> CardId {
        let id = self.with_cards(|state| {
            let id = CardId(state.cards.len());
            state.cards.push(CardUiState::new(id, character));
            id
        });
        self.publish(CardUpdate::Mounted(id));
        id
    }

    fn unmount_all(&self) {
        self.with_cards(|state| state.cards.clear());
        self.publish(CardUpdate::Cleared);
    }

    fn card(&self, card: CardId) -> Option<CardUiState> {
        self.with_cards(|state| state.cards.get(card.0).cloned())
    }

    fn cards(&self) -> Vec<CardUiState> {
        self.with_cards(|state| state.cards.clone())
    }

    fn set_busy(&self, card: CardId, label: &str) {
        self.with_card(card, |c| {
            c.label = label.to_string();
            c.enabled = false;
            c.failed = false;
            Some(label_update(c))
        });
    }

    fn set_failed(&self, card: CardId, label: &str) {
        self.with_card(card, |c| {
            c.label = label.to_string();
            c.enabled = true;
            c.failed = true;
            c.active = false;
            c.speaking = false;
            c.intensity = 0.0;
            Some(label_update(c))
        });
    }

    fn set_active(&self, card: CardId, active: bool) {
        let mut deactivated = Vec::new();
        let changed = self.with_cards(|state| {
            if card.0 >= state.cards.len() {
                return false;
            }
            if active {
                for other in state.cards.iter_mut().filter(|o| o.id != card && o.active) {
                    other.reset();
                    deactivated.push(other.id);
                }
            }
            let c = &mut state.cards[card.0];
            c.active = active;
            c.failed = false;
            if active {
                c.label = END_CONVERSATION_LABEL.to_string();
                c.enabled = true;
            } else {
                c.speaking = false;
                c.intensity = 0.0;
            }
            true
        });
        for other in deactivated {
            self.publish(CardUpdate::Active {
                card: other,
                active: false,
            });
        }
        if changed {
            self.publish(CardUpdate::Active { card, active });
            if let Some(c) = self.card(card) {
                self.publish(label_update(&c));
            }
        }
    }

    fn set_speaking(&self, card: CardId, speaking: bool) {
        self.with_card(card, |c| {
            if c.speaking == speaking {
                return None;
            }
            c.speaking = speaking;
            Some(CardUpdate::Speaking { card, speaking })
        });
    }

    fn set_intensity(&self, card: CardId, intensity: f32) {
        self.with_card(card, |c| {
            c.intensity = intensity.clamp(0.0, 1.0);
            None
        });
    }

    fn append_transcript(&self, card: CardId, line: TranscriptLine) {
        self.with_card(card, |c| {
            c.transcript.push(line.clone());
            Some(CardUpdate::Transcript { card, line })
        });
    }

    fn reset_to_default(&self, card: CardId) {
        self.with_card(card, |c| {
            let was_active = c.active;
            c.reset();
            if was_active {
                Some(CardUpdate::Active {
                    card,
                    active: false,
                })
            } else {
                Some(label_update(c))
            }
        });
    }

    fn reset_all(&self) {
        let ids: Vec<_> = self.with_cards(|state| state.cards.iter().map(|c| c.id).collect());
        for id in ids {
            self.reset_to_default(id);
        }
    }

    fn active_card(&self) -> Option<CardId> {
        self.with_cards(|state| state.cards.iter().find(|c| c.active).map(|c| c.id))
    }

    fn set_focus_mode(&self, on: bool) {
        let changed = self.with_cards(|state| std::mem::replace(&mut state.focus_mode, on) != on);
        if changed {
            self.publish(CardUpdate::FocusMode(on));
        }
    }

    fn focus_mode(&self) -> bool {
        self.with_cards(|state| state.focus_mode)
    }
}

/// Removes embedded markup (`<tags>`) from a transcript message and collapses
/// the remaining whitespace.
pub fn strip_markup(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_tag = false;
    for ch in message.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(name: &str) -> Character {
        Character {
            name: name.to_string(),
            description: format!("{name} from the book"),
            assigned_voice_id: "voice".to_string(),
            system_prompt: format!("You are {name}."),
        }
    }

    fn registry_with(names: &[&str]) -> (InMemoryCardRegistry, Vec<CardId>) {
        let registry = InMemoryCardRegistry::new();
        let ids = names.iter().map(|n| registry.mount(character(n))).collect();
        (registry, ids)
    }

    #[test]
    fn test_mount_sets_default_label() {
        let (registry, ids) = registry_with(&["Elizabeth Bennet"]);
        let card = registry.card(ids[0]).unwrap();
        assert_eq!(card.label, "Talk to Elizabeth");
        assert!(card.is_default());
    }

    #[test]
    fn test_only_one_card_is_active() {
        let (registry, ids) = registry_with(&["Elizabeth", "Darcy"]);
        registry.set_active(ids[0], true);
        registry.set_active(ids[1], true);

        assert_eq!(registry.active_card(), Some(ids[1]));
        assert!(registry.card(ids[0]).unwrap().is_default());
        assert_eq!(registry.card(ids[1]).unwrap().label, END_CONVERSATION_LABEL);
    }

    #[test]
    fn test_busy_then_reset() {
        let (registry, ids) = registry_with(&["Elizabeth"]);
        registry.set_busy(ids[0], "Connecting...");
        let card = registry.card(ids[0]).unwrap();
        assert!(!card.enabled);
        assert_eq!(card.label, "Connecting...");

        registry.reset_to_default(ids[0]);
        registry.reset_to_default(ids[0]);
        assert!(registry.card(ids[0]).unwrap().is_default());
    }

    #[test]
    fn test_failed_card_is_enabled_for_retry() {
        let (registry, ids) = registry_with(&["Elizabeth"]);
        registry.set_failed(ids[0], "Connection Failed");
        let card = registry.card(ids[0]).unwrap();
        assert!(card.enabled);
        assert!(card.failed);
    }

    #[test]
    fn test_transcript_preserves_order() {
        let (registry, ids) = registry_with(&["Elizabeth"]);
        for text in ["one", "two", "three"] {
            registry.append_transcript(
                ids[0],
                TranscriptLine {
                    source: MessageSource::Agent,
                    text: text.into(),
                },
            );
        }
        let lines: Vec<_> = registry
            .card(ids[0])
            .unwrap()
            .transcript
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_unknown_card_is_ignored() {
        let (registry, _) = registry_with(&["Elizabeth"]);
        registry.set_busy(CardId(7), "x");
        registry.set_active(CardId(7), true);
        assert_eq!(registry.active_card(), None);
    }

    #[test]
    fn test_updates_are_broadcast() {
        let (registry, ids) = registry_with(&["Elizabeth"]);
        let mut rx = registry.subscribe();
        registry.set_focus_mode(true);
        registry.set_focus_mode(true);
        registry.set_speaking(ids[0], true);

        assert_eq!(rx.try_recv().unwrap(), CardUpdate::FocusMode(true));
        assert_eq!(
            rx.try_recv().unwrap(),
            CardUpdate::Speaking {
                card: ids[0],
                speaking: true
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_intensity_is_clamped() {
        let (registry, ids) = registry_with(&["Elizabeth"]);
        registry.set_intensity(ids[0], 3.0);
        assert_eq!(registry.card(ids[0]).unwrap().intensity, 1.0);
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(
            strip_markup("<b>Good</b> morning,<br/>Mr. Darcy"),
            "Good morning, Mr. Darcy"
        );
        assert_eq!(strip_markup("plain text"), "plain text");
        assert_eq!(strip_markup("a > b"), "a > b");
    }
}
