//! Plain-text rendering of the stage, the sidebar and card changes.

use fourthwall_core::{
    card::{CardId, CardRegistry, CardUiState, CardUpdate},
    sidebar::SidebarModel,
    voice::MessageSource,
};
use std::sync::Arc;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::warn;

const METER_WIDTH: usize = 10;

pub fn render_sidebar(sidebar: &SidebarModel) -> String {
    if sidebar.is_empty() {
        return "No books yet. Try `books` or `upload <path>`.".to_string();
    }
    sidebar
        .entries()
        .iter()
        .enumerate()
        .map(|(i, entry)| format!("{:>3}. {} ({})", i + 1, entry.title, entry.book_id))
        .collect::<Vec<_>>()
        .join("\n")
}

fn meter(intensity: f32) -> String {
    let filled = ((intensity.clamp(0.0, 1.0) * METER_WIDTH as f32).round()) as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(METER_WIDTH - filled))
}

pub fn render_card(card: &CardUiState) -> String {
    let mut line = format!("[{}] {:<24} <{}>", card.id, card.character.name, card.label);
    if !card.enabled {
        line.push_str(" (busy)");
    }
    if card.active {
        if card.speaking {
            line.push_str(" speaking");
        } else {
            line.push_str(&format!(" listening [{}]", meter(card.intensity)));
        }
    }
    if !card.character.description.is_empty() {
        line.push_str(&format!("\n      {}", card.character.description));
    }
    line
}

/// The stage: title plus every mounted card. Other cards are dimmed while a
/// conversation holds focus.
pub fn render_stage(title: &str, cards: &[CardUiState], focus_mode: bool) -> String {
    let mut out = vec![format!("== {title} ==")];
    if cards.is_empty() {
        out.push("(no cast loaded)".to_string());
    }
    for card in cards {
        let rendered = render_card(card);
        if focus_mode && !card.active {
            out.push(format!("   {}", rendered.replace('\n', "\n   ")));
        } else {
            out.push(rendered);
        }
    }
    out.join("\n")
}

/// One line describing a card change, or `None` for changes not worth printing.
pub fn describe_update(update: &CardUpdate, registry: &dyn CardRegistry) -> Option<String> {
    let name = |card: CardId| {
        registry
            .card(card)
            .map(|c| c.character.first_name().to_string())
            .unwrap_or_else(|| card.to_string())
    };
    match update {
        CardUpdate::Label { card, label, .. } => Some(format!("[{card}] {label}")),
        CardUpdate::Active { card, active: true } => {
            Some(format!("[{card}] {} is listening.", name(*card)))
        }
        CardUpdate::Speaking {
            card,
            speaking: true,
        } => Some(format!("[{card}] {} is speaking...", name(*card))),
        CardUpdate::Transcript { card, line } => {
            let who = match line.source {
                MessageSource::User => "you".to_string(),
                MessageSource::Agent => name(*card),
            };
            Some(format!("[{card}] {who}: {}", line.text))
        }
        CardUpdate::Mounted(_)
        | CardUpdate::Cleared
        | CardUpdate::Active { .. }
        | CardUpdate::Speaking { .. }
        | CardUpdate::FocusMode(_) => None,
    }
}

/// Prints card changes as they happen.
pub fn spawn_update_printer(
    mut updates: broadcast::Receiver<CardUpdate>,
    registry: Arc<dyn CardRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if let Some(line) = describe_update(&update, registry.as_ref()) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Console fell behind on card updates.");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
