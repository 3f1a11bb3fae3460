use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::quotes::{QuoteSeries, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Candlestick,
}

impl Default for ChartKind {
    fn default() -> Self {
        ChartKind::Line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeName {
    Dark,
    Light,
}

impl Default for ThemeName {
    fn default() -> Self {
        ThemeName::Dark
    }
}

/// Resolved palette for one render.
#[derive(Debug, Clone, Copy)]
pub struct Theme {
    pub background: Rgb<u8>,
    pub grid: Rgb<u8>,
    pub up: Rgb<u8>,
    pub down: Rgb<u8>,
    pub marker: Rgb<u8>,
}

impl Theme {
    pub fn resolve(name: ThemeName) -> Self {
        match name {
            ThemeName::Dark => Self {
                background: Rgb([16, 18, 24]),
                grid: Rgb([58, 62, 74]),
                up: Rgb([38, 166, 91]),
                down: Rgb([214, 69, 65]),
                marker: Rgb([236, 240, 241]),
            },
            ThemeName::Light => Self {
                background: Rgb([245, 246, 248]),
                grid: Rgb([205, 208, 214]),
                up: Rgb([24, 128, 56]),
                down: Rgb([176, 32, 41]),
                marker: Rgb([33, 33, 33]),
            },
        }
    }
}

/// Immutable description of one render. Snapshotted from the settings when a
/// job starts, so a settings edit mid-cycle cannot tear a chart.
#[derive(Debug, Clone)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub range: TimeRange,
    pub theme: ThemeName,
    pub show_grid: bool,
    pub width: u32,
    pub height: u32,
}

/// Pure rendering boundary: series in, encoded image bytes out. Deterministic
/// for identical inputs; no side effects.
pub trait Renderer: Send + Sync {
    fn render(&self, series: &[QuoteSeries], spec: &ChartSpec) -> Result<Vec<u8>>;
}

const PANEL_MARGIN: i64 = 24;
const ACCENT_WIDTH: i64 = 6;
const MARKER_RADIUS: i64 = 4;

/// Built-in renderer: one horizontal panel per symbol, stacked top to
/// bottom, with a trend-colored accent bar and a last-price marker in place
/// of a text title.
#[derive(Default)]
pub struct ChartRenderer;

impl ChartRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl Renderer for ChartRenderer {
    fn render(&self, series: &[QuoteSeries], spec: &ChartSpec) -> Result<Vec<u8>> {
        let populated: Vec<&QuoteSeries> = series.iter().filter(|s| !s.points.is_empty()).collect();
        if populated.is_empty() {
            return Err(AppError::message("no series with data points to render"));
        }

        let theme = Theme::resolve(spec.theme);
        let mut canvas = RgbImage::from_pixel(spec.width, spec.height, theme.background);

        let panel_height = spec.height as i64 / populated.len() as i64;
        for (index, entry) in populated.iter().enumerate() {
            let top = index as i64 * panel_height;
            draw_panel(&mut canvas, entry, spec, &theme, top, panel_height);
        }

        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(canvas).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
        Ok(bytes)
    }
}

fn draw_panel(
    canvas: &mut RgbImage,
    series: &QuoteSeries,
    spec: &ChartSpec,
    theme: &Theme,
    panel_top: i64,
    panel_height: i64,
) {
    let plot_left = PANEL_MARGIN + ACCENT_WIDTH + 2;
    let plot_right = spec.width as i64 - PANEL_MARGIN;
    let plot_top = panel_top + PANEL_MARGIN;
    let plot_bottom = panel_top + panel_height - PANEL_MARGIN;
    if plot_right <= plot_left || plot_bottom <= plot_top {
        return;
    }

    let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
    for point in &series.points {
        min = min.min(point.low);
        max = max.max(point.high);
    }
    if !min.is_finite() || !max.is_finite() {
        return;
    }
    if (max - min).abs() < f64::EPSILON {
        // Flat series still gets a visible band to draw into.
        max += 1.0;
        min -= 1.0;
    }

    let trend_up = series
        .latest_quote()
        .map(|quote| quote.is_gain())
        .unwrap_or(true);
    let trend = if trend_up { theme.up } else { theme.down };

    fill_rect(
        canvas,
        PANEL_MARGIN,
        plot_top,
        PANEL_MARGIN + ACCENT_WIDTH,
        plot_bottom,
        trend,
    );

    if spec.show_grid {
        for quarter in 1..4 {
            let y = plot_top + (plot_bottom - plot_top) * quarter / 4;
            draw_segment(canvas, (plot_left, y), (plot_right, y), theme.grid);
        }
    }

    let scale_y = |value: f64| -> i64 {
        let ratio = (value - min) / (max - min);
        plot_bottom - (ratio * (plot_bottom - plot_top) as f64).round() as i64
    };

    let count = series.points.len() as i64;
    let slot = (plot_right - plot_left) as f64 / count as f64;
    let x_at = |index: usize| -> i64 { plot_left + (slot * (index as f64 + 0.5)).round() as i64 };

    match spec.kind {
        ChartKind::Line => {
            for (index, pair) in series.points.windows(2).enumerate() {
                let from = (x_at(index), scale_y(pair[0].close));
                let to = (x_at(index + 1), scale_y(pair[1].close));
                draw_segment(canvas, from, to, trend);
            }
        }
        ChartKind::Candlestick => {
            let body_half = ((slot * 0.3).round() as i64).max(1);
            for (index, point) in series.points.iter().enumerate() {
                let x = x_at(index);
                let color = if point.close >= point.open {
                    theme.up
                } else {
                    theme.down
                };
                draw_segment(canvas, (x, scale_y(point.high)), (x, scale_y(point.low)), color);
                let body_top = scale_y(point.open.max(point.close));
                let body_bottom = scale_y(point.open.min(point.close));
                fill_rect(canvas, x - body_half, body_top, x + body_half, body_bottom.max(body_top + 1), color);
            }
        }
    }

    if let Some(last) = series.points.last() {
        let x = x_at(series.points.len() - 1);
        let y = scale_y(last.close);
        fill_rect(
            canvas,
            x - MARKER_RADIUS,
            y - MARKER_RADIUS,
            x + MARKER_RADIUS,
            y + MARKER_RADIUS,
            theme.marker,
        );
    }
}

fn put_pixel_clamped(canvas: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

fn fill_rect(canvas: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    for y in y0.min(y1)..=y0.max(y1) {
        for x in x0.min(x1)..=x0.max(x1) {
            put_pixel_clamped(canvas, x, y, color);
        }
    }
}

/// Bresenham line between two points, clamped to the canvas.
fn draw_segment(canvas: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let (x1, y1) = to;
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put_pixel_clamped(canvas, x, y, color);
        if x == x1 && y == y1 {
            break;
        }
        let doubled = 2 * err;
        if doubled >= dy {
            err += dy;
            x += sx;
        }
        if doubled <= dx {
            err += dx;
            y += sy;
        }
    }
}
