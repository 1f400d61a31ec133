//! Decoded BEV detections
//!
//! Turns raw detection-head outputs `[class logits | box params | ...]` into
//! `BevDetection` records in BEV grid coordinates.

use std::fmt;

use candle_core::{DType, Result, Tensor, D};
use serde::Serialize;

use crate::config::{BOX_PARAMS_2D, BOX_PARAMS_3D};
use crate::model::detection_head::DetectionHead;

/// A single decoded object on the BEV plane
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BevDetection {
    /// Position of the query inside the query set
    pub query_index: usize,
    pub class_id: usize,
    /// Best class probability (0.0 to 1.0)
    pub score: f32,
    /// Box centre (x, y) in grid cells
    pub center: [f32; 2],
    /// Box extent (width along x, length along y) in grid cells
    pub size: [f32; 2],
    /// Heading in radians
    pub yaw: f32,
    /// (z, height), 3-D boxes only
    pub elevation: Option<[f32; 2]>,
    /// (vx, vy), 3-D boxes only
    pub velocity: Option<[f32; 2]>,
}

impl BevDetection {
    /// Box corners in grid cells, counter-clockwise starting at the front-left
    pub fn corners(&self) -> [[f32; 2]; 4] {
        let (sin, cos) = self.yaw.sin_cos();
        let (hw, hl) = (self.size[0] / 2.0, self.size[1] / 2.0);
        let [cx, cy] = self.center;
        [(-hw, hl), (-hw, -hl), (hw, -hl), (hw, hl)].map(|(dx, dy)| {
            [cx + dx * cos - dy * sin, cy + dx * sin + dy * cos]
        })
    }
}

impl fmt::Display for BevDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BevDetection {{ query: {}, class_id: {}, score: {:.2}, center: [{:.1}, {:.1}], size: [{:.1}, {:.1}], yaw: {:.2} }}",
            self.query_index,
            self.class_id,
            self.score,
            self.center[0],
            self.center[1],
            self.size[0],
            self.size[1],
            self.yaw
        )
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode a detection tensor [N, Q, D] produced by `head` into per-batch lists sorted
/// by score
///
/// Box parameters follow the head layout: 3-D `(cx, cy, cz, w, l, h, sin, cos, vx, vy)`,
/// 2-D `(cx, cy, w, l, sin, cos)`. Centre and extent are predicted as fractions of the
/// grid and scaled by `bev_shape`. Trailing channels past the box parameters are
/// ignored. Queries whose `valid_mask` entry is 0 are skipped.
pub fn decode_detections(
    detections: &Tensor,
    head: &DetectionHead,
    bev_shape: (usize, usize),
    score_threshold: f32,
    valid_mask: Option<&Tensor>,
) -> Result<Vec<Vec<BevDetection>>> {
    let (batch_size, num_queries, width) = detections.dims3()?;
    let num_classes = head.num_classes();
    let num_box_params = head.num_box_params();
    let det_3d = match num_box_params {
        BOX_PARAMS_3D => true,
        BOX_PARAMS_2D => false,
        n => candle_core::bail!("cannot decode boxes with {} parameters", n),
    };
    if width < num_classes + num_box_params {
        candle_core::bail!(
            "detection width {} too small for {} classes and {} box params",
            width,
            num_classes,
            num_box_params
        );
    }
    let valid = match valid_mask {
        Some(mask) => {
            if mask.dims() != [batch_size, num_queries] {
                candle_core::bail!(
                    "valid mask shape {:?} != [{}, {}]",
                    mask.dims(),
                    batch_size,
                    num_queries
                );
            }
            Some(mask.to_dtype(DType::U8)?.to_vec2::<u8>()?)
        }
        None => None,
    };

    let detections = detections.to_dtype(DType::F32)?;
    let logits = head.class_logits(&detections)?;
    let boxes = head.box_params(&detections)?.to_vec3::<f32>()?;
    let best = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
    let best_logit = logits.max(D::Minus1)?.to_vec2::<f32>()?;

    let (h, w) = (bev_shape.0 as f32, bev_shape.1 as f32);
    let mut results = Vec::with_capacity(batch_size);
    for b in 0..batch_size {
        let mut frame = Vec::new();
        for q in 0..num_queries {
            if valid.as_ref().is_some_and(|v| v[b][q] == 0) {
                continue;
            }
            let score = sigmoid(best_logit[b][q]);
            if score < score_threshold {
                continue;
            }
            let p = &boxes[b][q];
            let (size, trig, elevation, velocity) = if det_3d {
                (
                    [p[3], p[4]],
                    [p[6], p[7]],
                    Some([p[2], p[5]]),
                    Some([p[8], p[9]]),
                )
            } else {
                ([p[2], p[3]], [p[4], p[5]], None, None)
            };
            frame.push(BevDetection {
                query_index: q,
                class_id: best[b][q] as usize,
                score,
                center: [sigmoid(p[0]) * w, sigmoid(p[1]) * h],
                size: [sigmoid(size[0]) * w, sigmoid(size[1]) * h],
                yaw: trig[0].atan2(trig[1]),
                elevation,
                velocity,
            });
        }
        frame.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.push(frame);
    }
    Ok(results)
}
