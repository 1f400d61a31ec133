//! Multi-frame driver
//!
//! Runs the agent tracker (TrackFormer), the map instance head (MapFormer) and the
//! occupancy forecaster (OccFormer) on one BEV frame at a time, carrying each head's
//! confirmed track queries to the next frame.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::PerceptionConfig;
use crate::model::mapformer::{MapFormer, MapFormerOutput};
use crate::model::occformer::{OccFormer, OccFormerOutput};
use crate::model::trackformer::{TrackFormer, TrackFormerOutput, TrackPadding};

/// Queries and confirmation mask handed from one frame to the next
#[derive(Debug, Clone)]
pub struct TrackState {
    /// [N, Q, E]
    pub queries: Tensor,
    /// [N, Q] u8
    pub mask: Tensor,
}

impl TrackState {
    /// Confirmed tracks per batch element
    pub fn num_confirmed(&self) -> Result<Vec<usize>> {
        Ok(self
            .mask
            .to_dtype(candle_core::DType::U8)?
            .to_vec2::<u8>()?
            .iter()
            .map(|row| row.iter().filter(|&&v| v != 0).count())
            .collect())
    }
}

/// Per-sequence recurrent state
#[derive(Debug, Clone, Default)]
pub struct PerceptionState {
    pub agents: Option<TrackState>,
    pub map: Option<TrackState>,
    /// Frames processed so far
    pub frame: usize,
}

/// Confirmed agents gathered into a rectangular batch for forecasting
#[derive(Debug, Clone)]
pub struct AgentSet {
    /// [N, A, E]
    pub queries: Tensor,
    /// [N, A] u8, 0 for padding
    pub pad_mask: Tensor,
    /// Query-set position of every gathered agent, per batch element
    pub query_indices: Vec<Vec<usize>>,
}

impl AgentSet {
    pub fn num_agents(&self) -> Result<usize> {
        let (_, num_agents, _) = self.queries.dims3()?;
        Ok(num_agents)
    }
}

/// Supplies [N, A, num_modes, E] motion queries for a set of agents
///
/// Motion forecasting lives outside this crate; implementors bridge to it.
pub trait MotionQueryProvider {
    fn motion_queries(&self, agents: &AgentSet) -> Result<Tensor>;
}

/// Stand-in motion source: each agent's track query repeated over the modes,
/// plus Gaussian jitter of standard deviation `jitter`
#[derive(Debug, Clone, Copy)]
pub struct TiledMotionQueries {
    pub num_modes: usize,
    pub jitter: f64,
}

impl MotionQueryProvider for TiledMotionQueries {
    fn motion_queries(&self, agents: &AgentSet) -> Result<Tensor> {
        let tiled = agents
            .queries
            .unsqueeze(2)?
            .repeat((1, 1, self.num_modes, 1))?;
        if self.jitter == 0.0 {
            return Ok(tiled);
        }
        let noise = tiled.randn_like(0.0, self.jitter)?;
        tiled + noise
    }
}

/// Everything produced for one frame
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub tracks: TrackFormerOutput,
    /// Confirmation mask of `tracks` [N, Q]
    pub track_mask: Tensor,
    pub map: MapFormerOutput,
    pub agents: Option<AgentSet>,
    pub occupancy: Option<OccFormerOutput>,
}

#[derive(Debug, Clone)]
pub struct BevPerception {
    config: PerceptionConfig,
    trackformer: TrackFormer,
    mapformer: MapFormer,
    occformer: OccFormer,
}

impl BevPerception {
    pub fn load(config: &PerceptionConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            trackformer: TrackFormer::load(&config.trackformer, vb.pp("trackformer"))?,
            mapformer: MapFormer::load(&config.mapformer, vb.pp("mapformer"))?,
            occformer: OccFormer::load(&config.occformer, vb.pp("occformer"))?,
        })
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    pub fn trackformer(&self) -> &TrackFormer {
        &self.trackformer
    }

    pub fn mapformer(&self) -> &MapFormer {
        &self.mapformer
    }

    /// Gather the confirmed entries of `state`, at most `max_num_agents` per batch element
    ///
    /// Returns `None` when no batch element has a confirmed track.
    pub fn confirmed_agents(&self, state: &TrackState) -> Result<Option<AgentSet>> {
        let plan = TrackPadding::from_mask(&state.mask)?;
        if plan.max_valid() == 0 {
            return Ok(None);
        }
        let mut queries = plan.gather(&state.queries)?;
        let mut pad_mask = plan.mask().clone();
        let mut query_indices = plan.source_positions();

        let limit = self.config.occformer.max_num_agents;
        if plan.max_valid() > limit {
            tracing::warn!(
                confirmed = plan.max_valid(),
                limit,
                "too many confirmed agents, keeping the first {}",
                limit
            );
            queries = queries.narrow(1, 0, limit)?;
            pad_mask = pad_mask.narrow(1, 0, limit)?.contiguous()?;
            for indices in query_indices.iter_mut() {
                indices.truncate(limit);
            }
        }
        Ok(Some(AgentSet {
            queries,
            pad_mask,
            query_indices,
        }))
    }

    /// Process one frame
    ///
    /// Runs TrackFormer and MapFormer with the carried state, recomputes the
    /// confirmation masks, and forecasts occupancy for the confirmed agents when a
    /// motion source is given.
    pub fn step(
        &self,
        bev_features: &Tensor,
        state: &PerceptionState,
        motion: Option<&dyn MotionQueryProvider>,
        train: bool,
    ) -> Result<(FrameOutput, PerceptionState)> {
        let tracks = self.trackformer.forward_t(
            bev_features,
            state.agents.as_ref().map(|s| &s.queries),
            state.agents.as_ref().map(|s| &s.mask),
            train,
        )?;
        let track_mask = self.trackformer.track_mask(&tracks)?;

        let map = self.mapformer.forward_t(
            bev_features,
            state.map.as_ref().map(|s| &s.queries),
            state.map.as_ref().map(|s| &s.mask),
            train,
        )?;

        let agent_state = TrackState {
            queries: tracks.queries.clone(),
            mask: track_mask.clone(),
        };
        let map_state = TrackState {
            queries: map.queries.clone(),
            mask: map.track_mask.clone(),
        };

        let (agents, occupancy) = match motion {
            Some(motion) => match self.confirmed_agents(&agent_state)? {
                Some(agents) => {
                    let motion_queries = motion.motion_queries(&agents)?;
                    let occupancy = self.occformer.forward_t(
                        bev_features,
                        &agents.queries,
                        &motion_queries,
                        Some(&agents.pad_mask),
                        train,
                    )?;
                    (Some(agents), Some(occupancy))
                }
                None => (None, None),
            },
            None => (None, None),
        };

        let agent_queries = tracks.num_queries()?;
        let confirmed_agents = agent_state.num_confirmed()?;
        let confirmed_map = map_state.num_confirmed()?;
        tracing::info!(
            frame = state.frame,
            agent_queries,
            ?confirmed_agents,
            ?confirmed_map,
            forecast = occupancy.is_some(),
            "processed frame"
        );

        let next = PerceptionState {
            agents: Some(agent_state),
            map: Some(map_state),
            frame: state.frame + 1,
        };
        Ok((
            FrameOutput {
                tracks,
                track_mask,
                map,
                agents,
                occupancy,
            },
            next,
        ))
    }
}
