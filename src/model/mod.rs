pub mod attention;
pub mod detection_head;
pub mod layers;
pub mod mapformer;
pub mod occformer;
pub mod trackformer;

pub use detection_head::DetectionHead;
pub use mapformer::{MapFormer, MapFormerOutput, ProtoSegModule};
pub use occformer::{pool_modes, OccFormer, OccFormerDecoderLayer, OccFormerOutput};
pub use trackformer::{TrackFormer, TrackFormerDecoderLayer, TrackFormerOutput, TrackPadding};
