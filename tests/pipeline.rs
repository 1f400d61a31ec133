use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_bev_perception::pipeline::{
    BevPerception, PerceptionState, TiledMotionQueries, TrackState,
};
use candle_bev_perception::PerceptionConfig;

/// Tiny preset with every real query confirmed (or none when `threshold` is 1)
fn config(threshold: f32) -> PerceptionConfig {
    let mut config = PerceptionConfig::tiny();
    config.trackformer.track_threshold = threshold;
    config.mapformer.trackformer.track_threshold = threshold;
    config
}

fn bev(batch_size: usize, device: &Device) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch_size, 64, 16), device).unwrap()
}

fn motion() -> TiledMotionQueries {
    TiledMotionQueries {
        num_modes: 3,
        jitter: 0.1,
    }
}

#[test]
fn test_tracks_accumulate_across_frames() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = BevPerception::load(&config(0.0), vb).unwrap();
    let motion = motion();

    let mut state = PerceptionState::default();
    for (frame, expected_queries) in [6usize, 12, 18].into_iter().enumerate() {
        let (output, next) = model
            .step(&bev(2, &device), &state, Some(&motion), false)
            .unwrap();
        assert_eq!(next.frame, frame + 1);
        assert_eq!(output.tracks.num_queries().unwrap(), expected_queries);
        assert_eq!(output.map.masks.dims(), &[2, expected_queries, 8, 8]);

        // every real query is confirmed and forecast
        let agents = output.agents.as_ref().unwrap();
        assert_eq!(agents.num_agents().unwrap(), expected_queries);
        let occupancy = output.occupancy.as_ref().unwrap();
        assert_eq!(
            occupancy.occupancies.dims(),
            &[2, expected_queries, 2, 8, 8]
        );
        assert!(occupancy.attn_masks.is_none());

        let confirmed = next.agents.as_ref().unwrap().num_confirmed().unwrap();
        assert_eq!(confirmed, vec![expected_queries; 2]);
        state = next;
    }
}

#[test]
fn test_unconfirmed_tracks_are_dropped() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = BevPerception::load(&config(1.0), vb).unwrap();
    let motion = motion();

    let (output, state) = model
        .step(&bev(1, &device), &PerceptionState::default(), Some(&motion), false)
        .unwrap();
    assert!(output.agents.is_none());
    assert!(output.occupancy.is_none());

    let (output, _) = model
        .step(&bev(1, &device), &state, Some(&motion), false)
        .unwrap();
    assert_eq!(output.tracks.num_queries().unwrap(), 6);
    assert_eq!(output.map.masks.dims(), &[1, 6, 8, 8]);
}

#[test]
fn test_no_motion_source_skips_forecast() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = BevPerception::load(&config(0.0), vb).unwrap();

    let (output, next) = model
        .step(&bev(1, &device), &PerceptionState::default(), None, false)
        .unwrap();
    assert!(output.occupancy.is_none());
    assert!(next.agents.is_some());
    assert!(next.map.is_some());
}

#[test]
fn test_agents_truncated_to_capacity() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut config = config(0.0);
    config.occformer.max_num_agents = 4;
    let model = BevPerception::load(&config, vb).unwrap();

    let (output, _) = model
        .step(&bev(1, &device), &PerceptionState::default(), Some(&motion()), false)
        .unwrap();
    let agents = output.agents.unwrap();
    assert_eq!(agents.num_agents().unwrap(), 4);
    assert_eq!(agents.query_indices, vec![vec![0, 1, 2, 3]]);
    assert_eq!(output.occupancy.unwrap().occupancies.dims(), &[1, 4, 2, 8, 8]);
}

#[test]
fn test_confirmed_agents_are_padded_per_batch() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = BevPerception::load(&config(0.5), vb).unwrap();

    let state = TrackState {
        queries: Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap(),
        mask: Tensor::new(&[[0u8, 1, 1], [1, 0, 0]], &device).unwrap(),
    };
    let agents = model.confirmed_agents(&state).unwrap().unwrap();
    assert_eq!(agents.queries.dims(), &[2, 2, 16]);
    assert_eq!(
        agents.pad_mask.to_vec2::<u8>().unwrap(),
        vec![vec![1, 1], vec![1, 0]]
    );
    assert_eq!(agents.query_indices, vec![vec![1, 2], vec![0]]);

    let empty = TrackState {
        mask: Tensor::zeros((2, 3), DType::U8, &device).unwrap(),
        ..state
    };
    assert!(model.confirmed_agents(&empty).unwrap().is_none());
}

#[test]
fn test_training_step_outputs() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = BevPerception::load(&config(0.0), vb).unwrap();

    let (output, _) = model
        .step(&bev(2, &device), &PerceptionState::default(), Some(&motion()), true)
        .unwrap();
    assert_eq!(
        output.tracks.layers_detections.unwrap().dims(),
        &[2, 2, 6, 3 + 10]
    );
    // 3 classes + 6 box params + 4 coefficients
    assert_eq!(
        output.map.layers_detections.unwrap().dims(),
        &[2, 2, 6, 13]
    );
    let attn_masks = output.occupancy.unwrap().attn_masks.unwrap();
    // BEV 8x8, dense 4x4, attention 2x2
    assert_eq!(attn_masks.dims(), &[2, 6, 2, 2, 2]);
}

#[test]
fn test_wrong_bev_shape_is_rejected() {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = BevPerception::load(&config(0.5), vb).unwrap();

    let bev = Tensor::randn(0f32, 1.0, (1, 63, 16), &device).unwrap();
    assert!(model
        .step(&bev, &PerceptionState::default(), None, false)
        .is_err());
}
