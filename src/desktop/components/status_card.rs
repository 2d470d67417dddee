//! Status card showing the recognition backend

use egui::{Color32, RichText, Rounding, Vec2};

use crate::desktop::theme::ThemeColors;
use crate::inference::{WorkerState, WorkerStatus};

/// A card with a colored status dot, a title and a value line
pub struct StatusCard {
    pub title: String,
    pub value: String,
    pub status: CardStatus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CardStatus {
    Ready,
    Working,
    Error,
}

impl CardStatus {
    pub fn color(&self) -> Color32 {
        match self {
            CardStatus::Ready => ThemeColors::STATUS_READY,
            CardStatus::Working => ThemeColors::ACCENT_WARNING,
            CardStatus::Error => ThemeColors::STATUS_ERROR,
        }
    }
}

impl StatusCard {
    pub fn new(title: impl Into<String>, value: impl Into<String>, status: CardStatus) -> Self {
        Self {
            title: title.into(),
            value: value.into(),
            status,
        }
    }

    /// Card describing the local inference worker
    pub fn for_worker(status: &WorkerStatus) -> Self {
        let (label, card) = match status.state {
            WorkerState::Loading => ("Loading model", CardStatus::Working),
            WorkerState::Idle => ("Ready", CardStatus::Ready),
            WorkerState::Busy => ("Recognizing", CardStatus::Working),
            WorkerState::Failed => ("Model unavailable", CardStatus::Error),
        };
        let value = if status.device.is_empty() {
            label.to_string()
        } else {
            format!("{} · {} on {}", label, status.precision.label(), status.device)
        };
        Self::new("Local model", value, card)
    }

    /// Card for a remote recognition service
    pub fn for_server(url: &str) -> Self {
        Self::new("Recognition service", url, CardStatus::Ready)
    }

    pub fn show(&self, ui: &mut egui::Ui) {
        egui::Frame::none()
            .fill(ThemeColors::BG_MEDIUM)
            .rounding(Rounding::same(8.0))
            .inner_margin(12.0)
            .show(ui, |ui| {
                ui.set_min_width(ui.available_width());

                ui.horizontal(|ui| {
                    let dot = ui.cursor().left_top() + Vec2::new(5.0, 9.0);
                    ui.painter().circle_filled(dot, 4.0, self.status.color());
                    ui.add_space(14.0);

                    ui.vertical(|ui| {
                        ui.label(RichText::new(&self.title).size(12.0).color(ThemeColors::TEXT_MUTED));
                        ui.label(RichText::new(&self.value).color(ThemeColors::TEXT_PRIMARY).strong());
                    });
                });
            });
    }
}
