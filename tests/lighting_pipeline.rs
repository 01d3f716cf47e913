use glam::Vec3;
use kestrel_lighting::backend::{HostContext, RenderContext};
use kestrel_lighting::camera::{Camera, CameraId};
use kestrel_lighting::config::{LightingConfig, RenderPath, ShadowCascades, ShadowMapSize};
use kestrel_lighting::globals::ShaderProperty;
use kestrel_lighting::pipeline::LightingPipeline;
use kestrel_lighting::renderer::RendererKind;
use kestrel_lighting::scene::{Aabb, LightShadows, SceneSnapshot, VisibleLight};
use std::io::Write;
use tempfile::NamedTempFile;
use winit::dpi::PhysicalSize;

fn camera(id: u32, position: Vec3) -> Camera {
    Camera::new(CameraId(id), position, Vec3::ZERO, 1.0, 0.3, 100.0, PhysicalSize::new(320, 180))
}

fn snapshot() -> SceneSnapshot {
    let mut snapshot = SceneSnapshot::new();
    snapshot
        .push_light(VisibleLight::directional(Vec3::new(0.2, -1.0, 0.3), Vec3::ONE).with_shadows(LightShadows::Soft, 0.8))
        .push_light(
            VisibleLight::spot(Vec3::new(0.0, 4.0, 0.0), Vec3::NEG_Y, Vec3::ONE, 10.0, 45.0)
                .with_shadows(LightShadows::Hard, 1.0),
        )
        .push_light(VisibleLight::point(Vec3::new(2.0, 1.0, 0.0), Vec3::new(1.0, 0.5, 0.2), 3.0))
        .push_caster(Aabb::from_center_extents(Vec3::ZERO, Vec3::new(8.0, 0.5, 8.0)));
    snapshot
}

#[test]
fn config_file_selects_the_renderer_and_shadow_setup() {
    let mut temp = NamedTempFile::new().expect("temp lighting config");
    write!(temp, r#"{{"shadow_map_size":2048,"shadow_cascades":2,"forward_plus":false,"shadow_distance":50}}"#)
        .expect("write lighting config");

    let config = LightingConfig::load(temp.path()).expect("load config");
    assert_eq!(config.shadow_map_size, ShadowMapSize::S2048);
    assert_eq!(config.shadow_cascades, ShadowCascades::Two);
    assert_eq!(config.renderer_kind(), RendererKind::Forward);

    let mut pipeline = LightingPipeline::new(config);
    let mut ctx = HostContext::new();
    let report = pipeline.render_frame(&mut ctx, &[camera(0, Vec3::new(0.0, 5.0, 12.0))], &mut snapshot()).expect("frame");
    let frame = &report.cameras[0];
    assert_eq!(frame.cascades.map(|cascades| cascades.cascades), Some(2));
    assert!(frame.clusters.is_none());
    assert_eq!(ctx.globals().vector(ShaderProperty::GlobalShadowData).map(|data| data.y), Some(2500.0));
    assert_eq!(
        ctx.globals().vector(ShaderProperty::CascadedShadowMapSize).map(|size| size.z),
        Some(2048.0)
    );
}

#[test]
fn malformed_config_falls_back_to_defaults() {
    let mut temp = NamedTempFile::new().expect("temp lighting config");
    write!(temp, r#"{{"shadow_cascades":3}}"#).expect("write lighting config");
    assert!(LightingConfig::load(temp.path()).is_err());
    let config = LightingConfig::load_or_default(temp.path());
    assert_eq!(config.cascade_count(), 4);
    assert_eq!(config.renderer_kind(), RendererKind::Clustered);
}

#[test]
fn zero_cluster_tile_in_a_config_file_is_rejected() {
    let mut temp = NamedTempFile::new().expect("temp lighting config");
    write!(temp, r#"{{"cluster":{{"tile_size":0}}}}"#).expect("write lighting config");
    let err = LightingConfig::load(temp.path()).expect_err("zero tile size");
    assert!(format!("{err:?}").contains("nonzero"), "{err:?}");
    assert_eq!(LightingConfig::load_or_default(temp.path()).cluster.tile_size, 32);
}

#[test]
fn degenerate_camera_is_skipped_and_the_rest_render() {
    let mut ctx = HostContext::new();
    let mut pipeline = LightingPipeline::new(LightingConfig::default());
    let mut stuck = camera(1, Vec3::new(0.0, 5.0, 12.0));
    stuck.target = stuck.position;
    let cameras = [stuck, camera(2, Vec3::new(0.0, 5.0, 12.0))];
    let report = pipeline.render_frame(&mut ctx, &cameras, &mut snapshot()).expect("frame");

    assert_eq!(report.skipped, vec![CameraId(1)]);
    assert_eq!(report.cameras.len(), 1);
    assert_eq!(report.cameras[0].camera, Some(CameraId(2)));
    assert!(pipeline.renderer(CameraId(1)).is_none());
    assert_eq!(ctx.submit_count(), 1);
}

#[test]
fn each_camera_owns_its_cluster_buffers() {
    let mut ctx = HostContext::new();
    let mut pipeline = LightingPipeline::new(LightingConfig::default());
    let mut scene = snapshot();
    let cameras = [camera(1, Vec3::new(0.0, 5.0, 12.0)), camera(2, Vec3::new(10.0, 3.0, -6.0))];

    pipeline.render_frame(&mut ctx, &cameras, &mut scene).expect("frame");
    assert_eq!(pipeline.renderer_count(), 2);
    assert_eq!(ctx.live_buffers(), 10);
    assert_eq!(ctx.live_shadow_maps(), 0);

    pipeline.render_frame(&mut ctx, &cameras[1..], &mut scene).expect("frame");
    assert_eq!(pipeline.renderer_count(), 1);
    assert_eq!(ctx.live_buffers(), 5);

    pipeline.release_all(&mut ctx).expect("release");
    assert_eq!(ctx.live_buffers(), 0);
}

#[test]
fn deferred_path_publishes_the_light_count_only() {
    let config = LightingConfig { render_path: RenderPath::Deferred, ..LightingConfig::default() };
    let mut pipeline = LightingPipeline::new(config);
    let mut ctx = HostContext::new();
    let report = pipeline.render_frame(&mut ctx, &[camera(4, Vec3::new(0.0, 5.0, 12.0))], &mut snapshot()).expect("frame");

    assert_eq!(report.cameras[0].packed_lights, 3);
    assert_eq!(ctx.globals().int(ShaderProperty::VisibleLightCount), Some(3));
    assert!(ctx.shadow_draws().is_empty());
    assert!(ctx.globals().texture(ShaderProperty::ShadowMap).is_none());
}

#[test]
fn clustered_frames_rebuild_the_grid_only_on_resize() {
    let mut ctx = HostContext::new();
    let mut pipeline = LightingPipeline::new(LightingConfig::default());
    let mut scene = snapshot();
    let mut view = camera(5, Vec3::new(0.0, 5.0, 12.0));

    let first = pipeline.render_frame(&mut ctx, &[view.clone()], &mut scene).expect("frame");
    let second = pipeline.render_frame(&mut ctx, &[view.clone()], &mut scene).expect("frame");
    view.pixel_size = PhysicalSize::new(640, 360);
    let third = pipeline.render_frame(&mut ctx, &[view], &mut scene).expect("frame");

    let rebuilt: Vec<bool> = [first, second, third]
        .iter()
        .map(|report| report.cameras[0].clusters.map(|metrics| metrics.grid_rebuilt).unwrap_or_default())
        .collect();
    assert_eq!(rebuilt, vec![true, false, true]);
}
