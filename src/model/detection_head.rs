//! Per-query detection projection
//!
//! Output layout along the last axis: `[class logits | box params | seg coeffs]`.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use crate::model::layers::Mlp;

/// Projects decoder queries to class logits, box parameters and optional
/// segmentation coefficients
#[derive(Debug, Clone)]
pub struct DetectionHead {
    class_embed: Linear,
    bbox_embed: Mlp,
    coeff_embed: Option<Linear>,
    num_classes: usize,
    num_box_params: usize,
    num_seg_coeffs: usize,
}

impl DetectionHead {
    pub fn load(
        embed_dim: usize,
        num_classes: usize,
        num_box_params: usize,
        num_seg_coeffs: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let class_embed = linear(embed_dim, num_classes, vb.pp("class_embed"))?;
        let bbox_embed = Mlp::load(embed_dim, embed_dim, num_box_params, 3, vb.pp("bbox_embed"))?;
        let coeff_embed = if num_seg_coeffs > 0 {
            Some(linear(embed_dim, num_seg_coeffs, vb.pp("coeff_embed"))?)
        } else {
            None
        };
        Ok(Self {
            class_embed,
            bbox_embed,
            coeff_embed,
            num_classes,
            num_box_params,
            num_seg_coeffs,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_box_params(&self) -> usize {
        self.num_box_params
    }

    pub fn num_seg_coeffs(&self) -> usize {
        self.num_seg_coeffs
    }

    /// Class logits slice of a detection tensor
    pub fn class_logits(&self, detections: &Tensor) -> Result<Tensor> {
        detections.narrow(D::Minus1, 0, self.num_classes)
    }

    /// Box parameter slice of a detection tensor
    pub fn box_params(&self, detections: &Tensor) -> Result<Tensor> {
        detections.narrow(D::Minus1, self.num_classes, self.num_box_params)
    }

    /// Segmentation coefficient slice, `None` when the head predicts none
    pub fn seg_coeffs(&self, detections: &Tensor) -> Result<Option<Tensor>> {
        if self.num_seg_coeffs == 0 {
            return Ok(None);
        }
        detections
            .narrow(
                D::Minus1,
                self.num_classes + self.num_box_params,
                self.num_seg_coeffs,
            )
            .map(Some)
    }
}

impl Module for DetectionHead {
    fn forward(&self, queries: &Tensor) -> Result<Tensor> {
        let logits = self.class_embed.forward(queries)?;
        let boxes = self.bbox_embed.forward(queries)?;
        match &self.coeff_embed {
            Some(coeff_embed) => {
                let coeffs = coeff_embed.forward(queries)?;
                Tensor::cat(&[&logits, &boxes, &coeffs], D::Minus1)
            }
            None => Tensor::cat(&[&logits, &boxes], D::Minus1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_detection_layout() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = DetectionHead::load(16, 3, 6, 4, vb).unwrap();

        let queries = Tensor::randn(0f32, 1.0, (2, 5, 16), &device).unwrap();
        let detections = head.forward(&queries).unwrap();
        assert_eq!(detections.dims(), &[2, 5, 13]);
        assert_eq!(head.class_logits(&detections).unwrap().dims(), &[2, 5, 3]);
        assert_eq!(head.box_params(&detections).unwrap().dims(), &[2, 5, 6]);
        assert_eq!(
            head.seg_coeffs(&detections).unwrap().unwrap().dims(),
            &[2, 5, 4]
        );
    }

    #[test]
    fn test_detection_without_coeffs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = DetectionHead::load(8, 2, 10, 0, vb).unwrap();

        let queries = Tensor::randn(0f32, 1.0, (1, 4, 8), &device).unwrap();
        let detections = head.forward(&queries).unwrap();
        assert_eq!(detections.dims(), &[1, 4, 12]);
        assert!(head.seg_coeffs(&detections).unwrap().is_none());
    }
}
