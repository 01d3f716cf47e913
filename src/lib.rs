pub mod backend;
pub mod camera;
pub mod clusters;
pub mod commands;
pub mod config;
pub mod error;
pub mod globals;
pub mod light_packer;
pub mod pipeline;
pub mod renderer;
pub mod scene;
pub mod shadows;

pub use backend::{DeviceCaps, HostContext, RenderContext, WgpuContext};
pub use camera::{Camera, CameraId, CullingParameters};
pub use config::{LightingConfig, LightingConfigOverrides};
pub use error::LightingError;
pub use pipeline::{FrameReport, LightingPipeline};
pub use renderer::{CameraFrameReport, CameraRenderer, RendererKind};
pub use scene::{CullingSource, SceneQuery, SceneSnapshot, VisibleLight};
