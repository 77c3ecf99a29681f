pub mod config;
pub mod lights;
pub mod mesh;
pub mod renderer;
pub mod scene;

pub use config::LightingParams;
pub use lights::{Light, LightId, LightKind, LightTable, ShadowFilter, ShadowUpdateMode};
pub use mesh::{GpuMesh, MeshHandle, MeshRegistry, MeshVertex};
pub use renderer::{
    NormalizedRect, ShadowAtlas, ShadowFrameMetrics, ShadowFrameParams, ShadowFramePass,
    SplitPolicy,
};
pub use scene::{
    BoundingSphere, InstanceFlags, InstanceHandle, LayerComposition, MeshInstance, RenderLayer,
    Scene,
};
