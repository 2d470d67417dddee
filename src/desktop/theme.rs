//! Desktop theme and styling
//!
//! Compact dark theme for the control window.

use egui::{Color32, FontFamily, FontId, Rounding, Stroke, TextStyle, Visuals};

/// Dark color palette
pub struct ThemeColors;

impl ThemeColors {
    pub const BG_DARK: Color32 = Color32::from_rgb(22, 24, 30);
    pub const BG_MEDIUM: Color32 = Color32::from_rgb(32, 35, 43);
    pub const BG_LIGHT: Color32 = Color32::from_rgb(44, 48, 58);
    pub const BG_HOVER: Color32 = Color32::from_rgb(56, 61, 74);

    pub const ACCENT: Color32 = Color32::from_rgb(98, 176, 242);
    pub const ACCENT_WARNING: Color32 = Color32::from_rgb(240, 190, 60);

    pub const TEXT_PRIMARY: Color32 = Color32::from_rgb(236, 238, 244);
    pub const TEXT_MUTED: Color32 = Color32::from_rgb(120, 126, 140);

    pub const BORDER: Color32 = Color32::from_rgb(58, 63, 76);

    pub const STATUS_READY: Color32 = Color32::from_rgb(72, 199, 116);
    pub const STATUS_ERROR: Color32 = Color32::from_rgb(226, 84, 72);
}

/// Apply the theme to egui
pub fn apply_theme(ctx: &egui::Context) {
    let mut style = (*ctx.style()).clone();
    let mut visuals = Visuals::dark();

    visuals.window_fill = ThemeColors::BG_MEDIUM;
    visuals.panel_fill = ThemeColors::BG_DARK;
    visuals.faint_bg_color = ThemeColors::BG_LIGHT;
    visuals.extreme_bg_color = ThemeColors::BG_DARK;

    let rounding = Rounding::same(5.0);
    for (widget, fill) in [
        (&mut visuals.widgets.noninteractive, ThemeColors::BG_MEDIUM),
        (&mut visuals.widgets.inactive, ThemeColors::BG_LIGHT),
        (&mut visuals.widgets.hovered, ThemeColors::BG_HOVER),
        (&mut visuals.widgets.active, ThemeColors::ACCENT),
        (&mut visuals.widgets.open, ThemeColors::BG_HOVER),
    ] {
        widget.bg_fill = fill;
        widget.fg_stroke = Stroke::new(1.0, ThemeColors::TEXT_PRIMARY);
        widget.rounding = rounding;
    }

    visuals.selection.bg_fill = color_with_alpha(ThemeColors::ACCENT, 77);
    visuals.selection.stroke = Stroke::new(1.0, ThemeColors::ACCENT);
    visuals.hyperlink_color = ThemeColors::ACCENT;

    visuals.window_rounding = Rounding::same(8.0);
    visuals.window_shadow.blur = 8.0;
    visuals.window_stroke = Stroke::new(1.0, ThemeColors::BORDER);

    style.visuals = visuals;

    style.spacing.item_spacing = egui::vec2(8.0, 8.0);
    style.spacing.button_padding = egui::vec2(10.0, 5.0);
    style.spacing.window_margin = egui::Margin::same(14.0);

    style.text_styles = [
        (TextStyle::Small, FontId::new(12.0, FontFamily::Proportional)),
        (TextStyle::Body, FontId::new(15.0, FontFamily::Proportional)),
        (TextStyle::Monospace, FontId::new(14.0, FontFamily::Monospace)),
        (TextStyle::Button, FontId::new(15.0, FontFamily::Proportional)),
        (TextStyle::Heading, FontId::new(19.0, FontFamily::Proportional)),
    ]
    .into();

    ctx.set_style(style);
}

pub fn color_with_alpha(color: Color32, alpha: u8) -> Color32 {
    Color32::from_rgba_unmultiplied(color.r(), color.g(), color.b(), alpha)
}
