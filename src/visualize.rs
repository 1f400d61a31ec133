//! PNG rendering of BEV outputs: instance masks with detection boxes, and
//! per-timestep occupancy heatmaps.

use candle_core::{DType, Result, Tensor};
use image::{Rgb, RgbImage};

const BACKGROUND: Rgb<u8> = Rgb([24, 24, 24]);

const CLASS_COLORS: [[u8; 3]; 10] = [
    [255, 99, 71],   // tomato
    [60, 179, 113],  // sea green
    [65, 105, 225],  // royal blue
    [255, 215, 0],   // gold
    [238, 130, 238], // violet
    [0, 206, 209],   // turquoise
    [255, 140, 0],   // dark orange
    [154, 205, 50],  // yellow green
    [220, 20, 60],   // crimson
    [176, 196, 222], // steel
];

fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(CLASS_COLORS[class_id % CLASS_COLORS.len()])
}

fn blend(pixel: Rgb<u8>, color: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    Rgb([0, 1, 2].map(|c| {
        ((1.0 - alpha) * pixel.0[c] as f32 + alpha * color.0[c] as f32) as u8
    }))
}

/// Render one frame: mask overlays for each detection, then its rotated box
///
/// * `masks` - optional instance mask logits [Q, H, W] indexed by `query_index`
/// * `grid` - BEV grid (H, W); every cell becomes `scale x scale` pixels
pub fn render_detections(
    detections: &[crate::detection::BevDetection],
    masks: Option<&Tensor>,
    grid: (usize, usize),
    scale: u32,
) -> Result<RgbImage> {
    let (h, w) = grid;
    let scale = scale.max(1);
    let mut img = RgbImage::from_pixel(w as u32 * scale, h as u32 * scale, BACKGROUND);

    if let Some(masks) = masks {
        let (_, mh, mw) = masks.dims3()?;
        if (mh, mw) != grid {
            candle_core::bail!("mask grid {:?} != BEV grid {:?}", (mh, mw), grid);
        }
        let masks = masks.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        for det in detections {
            let Some(mask) = masks.get(det.query_index) else {
                continue;
            };
            let color = class_color(det.class_id);
            for (y, row) in mask.iter().enumerate() {
                for (x, &logit) in row.iter().enumerate() {
                    if logit <= 0.0 {
                        continue;
                    }
                    for py in 0..scale {
                        for px in 0..scale {
                            let (ix, iy) = (x as u32 * scale + px, y as u32 * scale + py);
                            let pixel = *img.get_pixel(ix, iy);
                            img.put_pixel(ix, iy, blend(pixel, color, 0.4));
                        }
                    }
                }
            }
        }
    }

    for det in detections {
        let color = class_color(det.class_id);
        let corners = det.corners().map(|[x, y]| (x * scale as f32, y * scale as f32));
        for i in 0..corners.len() {
            let next = corners[(i + 1) % corners.len()];
            imageproc::drawing::draw_line_segment_mut(&mut img, corners[i], next, color);
        }
    }
    Ok(img)
}

/// Render occupancy logits [T, H, W] as a horizontal strip of heatmaps
pub fn render_occupancy(occupancy: &Tensor, scale: u32) -> Result<RgbImage> {
    let (horizon, h, w) = occupancy.dims3()?;
    let scale = scale.max(1);
    let probs = candle_nn::ops::sigmoid(&occupancy.to_dtype(DType::F32)?)?.to_vec3::<f32>()?;

    let tile_w = w as u32 * scale;
    let gap = scale;
    let width = horizon as u32 * tile_w + (horizon as u32).saturating_sub(1) * gap;
    let mut img = RgbImage::from_pixel(width.max(1), h as u32 * scale, BACKGROUND);

    for (t, frame) in probs.iter().enumerate() {
        let x0 = t as u32 * (tile_w + gap);
        for (y, row) in frame.iter().enumerate() {
            for (x, &p) in row.iter().enumerate() {
                let v = (p.clamp(0.0, 1.0) * 255.0) as u8;
                let color = Rgb([v, (v as u16 * 3 / 4) as u8, 255 - v]);
                for py in 0..scale {
                    for px in 0..scale {
                        img.put_pixel(x0 + x as u32 * scale + px, y as u32 * scale + py, color);
                    }
                }
            }
        }
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BevDetection;
    use candle_core::Device;

    #[test]
    fn test_render_detections() {
        let device = Device::Cpu;
        let det = BevDetection {
            query_index: 1,
            class_id: 0,
            score: 0.8,
            center: [2.0, 2.0],
            size: [2.0, 2.0],
            yaw: 0.0,
            elevation: None,
            velocity: None,
        };
        let mut masks = vec![-1f32; 2 * 4 * 6];
        // query 1, cell (y=3, x=5)
        masks[4 * 6 + 3 * 6 + 5] = 2.0;
        let masks = Tensor::from_vec(masks, (2, 4, 6), &device).unwrap();

        let img = render_detections(&[det], Some(&masks), (4, 6), 3).unwrap();
        assert_eq!(img.dimensions(), (18, 12));
        assert_ne!(*img.get_pixel(16, 10), BACKGROUND);
        assert_eq!(*img.get_pixel(0, 11), BACKGROUND);
        // box edge x = 1 cell -> pixel 3
        assert_eq!(*img.get_pixel(3, 6), class_color(0));

        let wrong = Tensor::zeros((2, 3, 6), DType::F32, &device).unwrap();
        assert!(render_detections(&[], Some(&wrong), (4, 6), 3).is_err());
    }

    #[test]
    fn test_render_occupancy_strip() {
        let occupancy = Tensor::zeros((3, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let img = render_occupancy(&occupancy, 2).unwrap();
        assert_eq!(img.dimensions(), (3 * 10 + 2 * 2, 8));
        // gap column stays background
        assert_eq!(*img.get_pixel(10, 0), BACKGROUND);
        assert_ne!(*img.get_pixel(0, 0), BACKGROUND);
    }
}
