use glam::{Vec3, Vec4};
use kestrel_lighting::backend::{DeviceCaps, HostContext, RenderContext};
use kestrel_lighting::camera::{Camera, CameraId, CullingParameters};
use kestrel_lighting::config::{LightingConfig, ShadowCascades};
use kestrel_lighting::globals::{ShaderKeywords, ShaderProperty};
use kestrel_lighting::renderer::ForwardRenderer;
use kestrel_lighting::scene::{Aabb, CulledScene, LightShadows, SceneQuery, VisibleLight};
use winit::dpi::PhysicalSize;

fn params() -> CullingParameters {
    Camera::new(
        CameraId(0),
        Vec3::new(0.0, 6.0, 16.0),
        Vec3::ZERO,
        60.0_f32.to_radians(),
        0.3,
        120.0,
        PhysicalSize::new(1280, 720),
    )
    .culling_parameters(60.0)
    .expect("camera")
}

fn ground() -> Vec<Aabb> {
    vec![Aabb::from_center_extents(Vec3::ZERO, Vec3::new(12.0, 0.5, 12.0))]
}

fn shadowed_spot(x: f32) -> VisibleLight {
    VisibleLight::spot(Vec3::new(x, 5.0, 0.0), Vec3::NEG_Y, Vec3::ONE, 12.0, 50.0).with_shadows(LightShadows::Soft, 0.9)
}

fn sun() -> VisibleLight {
    VisibleLight::directional(Vec3::new(-0.3, -1.0, -0.4), Vec3::splat(1.2)).with_shadows(LightShadows::Hard, 1.0)
}

#[test]
fn only_eight_of_twenty_lights_reach_the_per_object_arrays() {
    let lights: Vec<VisibleLight> =
        (0..20).map(|i| VisibleLight::point(Vec3::new(i as f32 - 10.0, 1.0, 0.0), Vec3::ONE, 2.0)).collect();
    let mut scene = CulledScene::new(params(), lights, ground());
    let config = LightingConfig { forward_plus: false, ..LightingConfig::default() };
    let mut renderer = ForwardRenderer::new(&config);
    let mut ctx = HostContext::new();
    let report = renderer.render(&mut ctx, &params(), &mut scene).expect("render");

    assert_eq!(report.visible_lights, 20);
    assert_eq!(report.packed_lights, 8);
    let map = scene.light_index_map().expect("overflow produces an index map");
    assert_eq!(map.len(), 20);
    assert_eq!(&map[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(map[8..].iter().all(|index| *index == -1));

    let positions = ctx.globals().vector_array(ShaderProperty::VisibleLightDirectionsOrPositions).expect("positions");
    assert_eq!(positions.len(), 8);
    assert_eq!(positions[7], Vec4::new(-3.0, 1.0, 0.0, 1.0));
    assert_eq!(ctx.globals().vector(ShaderProperty::LightData), Some(Vec4::new(0.0, 8.0, 0.0, 0.0)));
    assert!(ctx.globals().keywords().is_empty());
}

#[test]
fn sun_cascades_and_spot_tiles_share_the_frame() {
    let mut lights = vec![sun()];
    lights.extend((0..5).map(|i| shadowed_spot(i as f32 * 2.0 - 4.0)));
    let mut scene = CulledScene::new(params(), lights, ground());
    let mut renderer = ForwardRenderer::new(&LightingConfig::default());
    let mut ctx = HostContext::new();
    let report = renderer.render(&mut ctx, &params(), &mut scene).expect("render");

    assert!(report.main_light_cascaded);
    let cascades = report.cascades.expect("cascades");
    assert_eq!(cascades.cascades, 4);
    let atlas = report.atlas.expect("atlas");
    assert_eq!((atlas.split, atlas.tiles), (3, 5));
    assert!(atlas.soft && !atlas.hard);
    assert_ne!(atlas.map, cascades.map);

    assert_eq!(ctx.shadow_draws().len(), 9);
    assert!(ctx.shadow_draws()[..4].iter().all(|draw| draw.target == cascades.map));
    assert!(ctx.shadow_draws()[4..].iter().all(|draw| draw.target == atlas.map));
    assert_eq!(ctx.live_shadow_maps(), 0);

    let globals = ctx.globals();
    assert!(globals.is_enabled(ShaderKeywords::CASCADED_SHADOWS_HARD));
    assert!(!globals.is_enabled(ShaderKeywords::CASCADED_SHADOWS_SOFT));
    assert!(globals.is_enabled(ShaderKeywords::SHADOWS_SOFT));
    assert!(!globals.is_enabled(ShaderKeywords::SHADOWS_HARD));

    let shadow_data = globals.vector_array(ShaderProperty::ShadowData).expect("shadow data");
    assert_eq!(shadow_data[0], Vec4::new(1.0, 0.0, 0.0, 0.0));
    let tile_scale = 1.0 / 3.0;
    assert!((shadow_data[5].z - tile_scale).abs() < 1e-6);
    assert!((shadow_data[5].w - tile_scale).abs() < 1e-6);
    assert_eq!(shadow_data[6], Vec4::ZERO);
    assert_eq!(globals.vector(ShaderProperty::GlobalShadowData).map(|data| data.y), Some(3600.0));
}

#[test]
fn without_cascades_the_sun_takes_an_atlas_tile() {
    let config = LightingConfig { shadow_cascades: ShadowCascades::Zero, ..LightingConfig::default() };
    let mut scene = CulledScene::new(params(), vec![sun(), shadowed_spot(0.0)], ground());
    let mut renderer = ForwardRenderer::new(&config);
    let mut ctx = HostContext::new();
    let report = renderer.render(&mut ctx, &params(), &mut scene).expect("render");

    assert!(!report.main_light_cascaded);
    assert!(report.cascades.is_none());
    let atlas = report.atlas.expect("atlas");
    assert_eq!((atlas.split, atlas.tiles), (2, 2));
    assert!(atlas.hard && atlas.soft);
    assert!(!ctx.globals().is_enabled(ShaderKeywords::CASCADED_SHADOWS_HARD));
}

#[test]
fn lights_without_casters_in_range_render_unshadowed() {
    let far_spot = VisibleLight::spot(Vec3::new(80.0, 5.0, 0.0), Vec3::NEG_Y, Vec3::ONE, 6.0, 40.0)
        .with_shadows(LightShadows::Hard, 1.0);
    let mut scene = CulledScene::new(params(), vec![far_spot], ground());
    let mut renderer = ForwardRenderer::new(&LightingConfig::default());
    let mut ctx = HostContext::new();
    let report = renderer.render(&mut ctx, &params(), &mut scene).expect("render");

    assert_eq!(report.packed_lights, 1);
    assert!(report.atlas.is_none());
    assert!(ctx.shadow_draws().is_empty());
    assert!(!ctx.globals().is_enabled(ShaderKeywords::SHADOWS_HARD));
}

#[test]
fn reversed_depth_changes_only_the_shadow_matrices() {
    let render = |caps: DeviceCaps| {
        let mut scene = CulledScene::new(params(), vec![shadowed_spot(0.0)], ground());
        let mut renderer = ForwardRenderer::new(&LightingConfig::default());
        let mut ctx = HostContext::with_caps(caps);
        renderer.render(&mut ctx, &params(), &mut scene).expect("render");
        let matrices = ctx.globals().matrix_array(ShaderProperty::WorldToShadowMatrices).expect("matrices");
        let probe = Vec3::new(0.0, 0.4, 0.0);
        matrices[0].project_point3(probe)
    };
    let regular = render(DeviceCaps::default());
    let reversed = render(DeviceCaps { reversed_z: true });
    assert!((regular.x - reversed.x).abs() < 1e-5);
    assert!((regular.y - reversed.y).abs() < 1e-5);
    assert!((regular.z + reversed.z - 1.0).abs() < 1e-4);
}

#[test]
fn repeated_frames_reuse_the_shadow_map_pool() {
    let mut scene = CulledScene::new(params(), vec![sun(), shadowed_spot(1.0)], ground());
    let mut renderer = ForwardRenderer::new(&LightingConfig::default());
    let mut ctx = HostContext::new();
    for _ in 0..3 {
        renderer.render(&mut ctx, &params(), &mut scene).expect("render");
        assert_eq!(ctx.live_shadow_maps(), 0);
    }
    assert_eq!(ctx.submit_count(), 3);
    assert_eq!(scene.visible_lights().len(), 2);
}
