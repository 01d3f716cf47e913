use anyhow::Result;

use super::CameraFrameReport;
use crate::backend::RenderContext;
use crate::commands::CommandList;
use crate::config::LightingConfig;
use crate::globals::ShaderProperty;
use crate::light_packer::{LightPacker, PackedLights, MAX_PER_OBJECT_LIGHTS};
use crate::scene::SceneQuery;

const SAMPLE: &str = "Deferred Lighting";

/// Publishes up to eight lights for a full-screen lighting pass. No shadows, no
/// per-object index map.
pub struct DeferredRenderer {
    packer: LightPacker,
    packed: PackedLights,
    commands: CommandList,
}

impl DeferredRenderer {
    pub fn new(_config: &LightingConfig) -> Self {
        Self {
            packer: LightPacker::new(MAX_PER_OBJECT_LIGHTS),
            packed: PackedLights::zeroed(MAX_PER_OBJECT_LIGHTS),
            commands: CommandList::new(SAMPLE),
        }
    }

    pub fn packed(&self) -> &PackedLights {
        &self.packed
    }

    pub fn render(&mut self, ctx: &mut dyn RenderContext, scene: &dyn SceneQuery) -> Result<CameraFrameReport> {
        let lights = scene.visible_lights();
        self.packed.clear();
        let packed = self.packer.pack(lights, &mut self.packed);

        let commands = &mut self.commands;
        commands.begin_sample(SAMPLE);
        commands.set_global_int(ShaderProperty::VisibleLightCount, packed as i32);
        commands.set_global_vector_array(ShaderProperty::VisibleLightColors, &self.packed.colors);
        commands.set_global_vector_array(
            ShaderProperty::VisibleLightDirectionsOrPositions,
            &self.packed.directions_or_positions,
        );
        commands.set_global_vector_array(ShaderProperty::VisibleLightAttenuations, &self.packed.attenuations);
        commands.set_global_vector_array(ShaderProperty::VisibleLightSpotDirections, &self.packed.spot_directions);
        commands.end_sample(SAMPLE);

        let executed = ctx.execute(commands).and_then(|()| ctx.submit());
        if executed.is_err() {
            commands.clear();
        }
        executed?;

        Ok(CameraFrameReport { visible_lights: lights.len(), packed_lights: packed, ..CameraFrameReport::default() })
    }

    pub fn abort(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostContext;
    use crate::camera::{Camera, CameraId};
    use crate::scene::{CulledScene, VisibleLight};
    use glam::{Vec3, Vec4};
    use winit::dpi::PhysicalSize;

    #[test]
    fn publishes_at_most_eight_lights_and_their_count() {
        let params = Camera::new(
            CameraId(9),
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            1.0,
            0.1,
            50.0,
            PhysicalSize::new(320, 240),
        )
        .culling_parameters(20.0)
        .unwrap();
        let lights: Vec<VisibleLight> =
            (0..11).map(|i| VisibleLight::point(Vec3::new(i as f32, 0.0, 0.0), Vec3::ONE, 2.0)).collect();
        let scene = CulledScene::new(params, lights, Vec::new());
        let mut renderer = DeferredRenderer::new(&LightingConfig::default());
        let mut ctx = HostContext::new();
        let report = renderer.render(&mut ctx, &scene).unwrap();

        assert_eq!((report.visible_lights, report.packed_lights), (11, 8));
        assert_eq!(ctx.globals().int(ShaderProperty::VisibleLightCount), Some(8));
        let positions = ctx.globals().vector_array(ShaderProperty::VisibleLightDirectionsOrPositions).unwrap();
        assert_eq!(positions.len(), 8);
        assert_eq!(positions[7], Vec4::new(7.0, 0.0, 0.0, 1.0));
        assert_eq!(ctx.submit_count(), 1);
    }
}
