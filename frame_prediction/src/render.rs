use crate::inference_service::{FramePrediction, BASE_FRAMES, WINDOW_FRAMES};
use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView2, Axis};
use std::path::Path;
use thiserror::Error;

const GRID_COLUMNS: u32 = WINDOW_FRAMES as u32;
const GRID_ROWS: u32 = 2;
const PANEL_MIN_SIZE: u32 = 160;
const PANEL_PADDING: u32 = 10;
const BACKGROUND: [u8; 3] = [255, 255, 255];

/// Light gray to orange, 100 bins.
const GRADIENT_FROM: [f32; 3] = [0.8, 0.8, 0.8];
const GRADIENT_TO: [f32; 3] = [1.0, 0.5, 0.0];
const GRADIENT_BINS: usize = 100;

const VIRIDIS: [[u8; 3]; 9] = [
    [68, 1, 84],
    [72, 40, 120],
    [62, 73, 137],
    [49, 104, 142],
    [38, 130, 142],
    [31, 158, 137],
    [53, 183, 121],
    [110, 206, 88],
    [253, 231, 37],
];

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Frame cannot be drawn: {0}")]
    Shape(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy)]
pub enum Colormap {
    Gradient,
    Viridis,
}

impl Colormap {
    /// Colour for `value`, clamped to `[0, 1]`.
    pub fn color(&self, value: f32) -> Rgb<u8> {
        let v = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        match self {
            Colormap::Gradient => {
                let bin = ((v * GRADIENT_BINS as f32) as usize).min(GRADIENT_BINS - 1);
                let t = bin as f32 / (GRADIENT_BINS - 1) as f32;
                let mix = |i: usize| {
                    let c = GRADIENT_FROM[i] + (GRADIENT_TO[i] - GRADIENT_FROM[i]) * t;
                    (c * 255.0).round() as u8
                };
                Rgb([mix(0), mix(1), mix(2)])
            }
            Colormap::Viridis => {
                let pos = v * (VIRIDIS.len() - 1) as f32;
                let lo = (pos.floor() as usize).min(VIRIDIS.len() - 1);
                let hi = (lo + 1).min(VIRIDIS.len() - 1);
                let t = pos - lo as f32;
                let mix = |i: usize| {
                    let a = VIRIDIS[lo][i] as f32;
                    let b = VIRIDIS[hi][i] as f32;
                    (a + (b - a) * t).round() as u8
                };
                Rgb([mix(0), mix(1), mix(2)])
            }
        }
    }
}

/// 1 where the frame exceeds half of its own maximum, else 0.
pub fn threshold_relative(frame: ArrayView2<'_, f32>) -> Array2<f32> {
    let max = frame.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let cutoff = max * 0.5;
    frame.mapv(|v| if v > cutoff { 1.0 } else { 0.0 })
}

/// Draws the 2x5 comparison grid.
///
/// Top row: the five window frames. Bottom row: the four base frames and the
/// thresholded prediction.
pub fn render_comparison(prediction: &FramePrediction) -> Result<RgbImage, RenderError> {
    let (height, width) = prediction.predicted_frame.dim();
    if height == 0 || width == 0 {
        return Err(RenderError::Shape(format!(
            "empty frame of shape [{}, {}]",
            height, width
        )));
    }

    let frames = window_frames(prediction, height, width)?;
    let binary = threshold_relative(prediction.predicted_frame.view());

    let mut panels: Vec<(ArrayView2<'_, f32>, Colormap)> = frames
        .iter()
        .map(|frame| (frame.view(), Colormap::Gradient))
        .collect();
    panels.extend(
        frames
            .iter()
            .take(BASE_FRAMES)
            .map(|frame| (frame.view(), Colormap::Gradient)),
    );
    panels.push((binary.view(), Colormap::Viridis));

    let scale = (PANEL_MIN_SIZE / height.max(width) as u32).max(1);
    let panel_w = width as u32 * scale;
    let panel_h = height as u32 * scale;
    let mut canvas = RgbImage::from_pixel(
        GRID_COLUMNS * panel_w + (GRID_COLUMNS + 1) * PANEL_PADDING,
        GRID_ROWS * panel_h + (GRID_ROWS + 1) * PANEL_PADDING,
        Rgb(BACKGROUND),
    );

    for (i, (frame, colormap)) in panels.iter().enumerate() {
        let col = i as u32 % GRID_COLUMNS;
        let row = i as u32 / GRID_COLUMNS;
        let x0 = PANEL_PADDING + col * (panel_w + PANEL_PADDING);
        let y0 = PANEL_PADDING + row * (panel_h + PANEL_PADDING);
        draw_panel(&mut canvas, frame, *colormap, x0, y0, scale);
    }

    Ok(canvas)
}

/// Renders the comparison grid and writes it as PNG, replacing any previous file.
pub fn save_comparison(prediction: &FramePrediction, path: &Path) -> Result<(), RenderError> {
    let canvas = render_comparison(prediction)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    canvas.save_with_format(path, image::ImageFormat::Png)?;

    tracing::info!("Saved prediction figure to {:?}", path);
    Ok(())
}

fn window_frames(
    prediction: &FramePrediction,
    height: usize,
    width: usize,
) -> Result<Vec<Array2<f32>>, RenderError> {
    prediction
        .window
        .axis_iter(Axis(0))
        .map(|frame| {
            frame
                .to_shape((height, width))
                .map(|f| f.into_owned())
                .map_err(|e| RenderError::Shape(e.to_string()))
        })
        .collect()
}

fn draw_panel(
    canvas: &mut RgbImage,
    frame: &ArrayView2<'_, f32>,
    colormap: Colormap,
    x0: u32,
    y0: u32,
    scale: u32,
) {
    for ((y, x), &value) in frame.indexed_iter() {
        let color = colormap.color(value);
        for dy in 0..scale {
            for dx in 0..scale {
                canvas.put_pixel(x0 + x as u32 * scale + dx, y0 + y as u32 * scale + dy, color);
            }
        }
    }
}
