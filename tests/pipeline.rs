use blade_accel::{
    hal::{self, soft, ResourceDevice as _},
    AsResourceManager, Config, Error, Scene, SceneBuilder, TlasState,
};
use glam::Vec3;
use std::sync::Arc;

fn translation(x: f32, y: f32, z: f32) -> hal::Transform {
    let mut transform = hal::IDENTITY_TRANSFORM;
    transform.x.w = x;
    transform.y.w = y;
    transform.z.w = z;
    transform
}

fn add_quad(builder: &mut SceneBuilder) -> usize {
    builder.add_mesh(
        "quad",
        &[
            [-1.0, -1.0, 0.0],
            [1.0, -1.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0],
        ],
        &[0, 1, 2, 0, 2, 3],
    )
}

fn add_triangle(builder: &mut SceneBuilder) -> usize {
    builder.add_mesh(
        "triangle",
        &[[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]],
        &[0, 1, 2],
    )
}

/// Square of `cells`x`cells` quads spanning [-1, 1] in XY.
fn add_grid(builder: &mut SceneBuilder, cells: u32) -> usize {
    let mut vertices = Vec::new();
    for y in 0..=cells {
        for x in 0..=cells {
            let to_unit = |v: u32| v as f32 / cells as f32 * 2.0 - 1.0;
            vertices.push([to_unit(x), to_unit(y), 0.0]);
        }
    }
    let mut indices = Vec::new();
    let row = cells + 1;
    for y in 0..cells {
        for x in 0..cells {
            let base = y * row + x;
            indices.extend_from_slice(&[base, base + 1, base + row + 1, base, base + row + 1, base + row]);
        }
    }
    builder.add_mesh("grid", &vertices, &indices)
}

/// Two quads and a triangle in front of the origin, plus an empty node.
fn three_node_scene(gpu: &soft::Context) -> Scene<soft::Buffer> {
    let mut builder = SceneBuilder::new();
    let quad = add_quad(&mut builder);
    let triangle = add_triangle(&mut builder);
    builder.add_node(Some(quad), translation(0.0, 0.0, -5.0));
    builder.add_node(None, hal::IDENTITY_TRANSFORM);
    builder.add_node(Some(triangle), translation(5.0, 0.0, -5.0));
    builder.add_node(Some(quad), translation(-5.0, 0.0, -5.0));
    builder.upload(gpu).unwrap()
}

fn trace(
    gpu: &soft::Context,
    manager: &AsResourceManager<soft::Context>,
    origin: [f32; 3],
) -> Option<soft::RayHit> {
    let ray = soft::Ray::new(Vec3::from_array(origin), Vec3::NEG_Z);
    gpu.trace_ray(manager.top_level_handle().unwrap(), &ray)
        .unwrap()
}

fn read_instances(gpu: &soft::Context, manager: &AsResourceManager<soft::Context>) -> Vec<hal::InstanceDesc> {
    let tlas = manager.top_level();
    let mut bytes = vec![0u8; tlas.instance_count() * hal::InstanceDesc::SIZE as usize];
    gpu.read_buffer(tlas.instance_buffer().unwrap().into(), &mut bytes);
    bytes
        .chunks_exact(hal::InstanceDesc::SIZE as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

#[test]
fn empty_scene() {
    let gpu = Arc::new(soft::Context::new());
    let mut builder = SceneBuilder::new();
    builder.add_node(None, hal::IDENTITY_TRANSFORM);
    let scene = builder.upload(&*gpu).unwrap();

    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();
    assert!(handles.is_empty());
    assert_eq!(manager.bottom_level_count(), 0);
    assert_eq!(manager.instance_count(), 0);
    assert_eq!(manager.top_level().state(), TlasState::Built);
    assert_eq!(manager.top_level().instance_count(), 0);
    let tlas = manager.top_level_handle().unwrap();
    assert_eq!(gpu.acceleration_structure_element_count(tlas), Some(0));
    assert_eq!(trace(&gpu, &manager, [0.0, 0.0, 0.0]), None);

    // An empty top level can still be updated.
    manager.update_instance_transforms(&[]).unwrap();
    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn meshes_are_shared_between_nodes() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();

    assert_eq!(handles.len(), 3);
    assert_eq!(manager.bottom_level_count(), 2);
    assert_eq!(manager.instance_count(), 3);
    let tlas = manager.top_level_handle().unwrap();
    assert_eq!(gpu.acceleration_structure_element_count(tlas), Some(3));

    let records = read_instances(&gpu, &manager);
    let custom = records.iter().map(|r| r.custom_index()).collect::<Vec<_>>();
    assert_eq!(custom, [0, 1, 0]);
    assert_eq!(
        records[0].acceleration_structure_reference,
        records[2].acceleration_structure_reference
    );
    assert_ne!(
        records[0].acceleration_structure_reference,
        records[1].acceleration_structure_reference
    );

    let hit = trace(&gpu, &manager, [5.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.instance_index, 1);
    assert_eq!(hit.instance_custom_index, 1);
    assert!((hit.t - 5.0).abs() < 1e-5);
    let hit = trace(&gpu, &manager, [-5.5, 0.5, 0.0]).unwrap();
    assert_eq!(hit.instance_index, 2);
    assert_eq!(trace(&gpu, &manager, [2.5, 0.0, 0.0]), None);

    drop(manager);
    scene.destroy(&*gpu);
    assert_eq!(gpu.buffer_count(), 0);
    assert_eq!(gpu.acceleration_structure_count(), 0);
}

#[test]
fn pre_transformed_scene() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let config = Config {
        pre_transform: true,
        ..Config::default()
    };
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), config);
    let handles = manager.load_scene(&scene).unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(manager.bottom_level_count(), 1);

    let hit = trace(&gpu, &manager, [5.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.instance_index, 0);
    assert_eq!(hit.geometry_index, 1);
    assert!((hit.t - 5.0).abs() < 1e-5);

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn update_only_touches_transforms() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();
    let tlas = manager.top_level_handle();
    let before = read_instances(&gpu, &manager);

    let moved = translation(5.0, 10.0, -5.0);
    manager
        .update_blas_transforms(&[(handles[1], moved)])
        .unwrap();
    manager.wait_idle();
    let after = read_instances(&gpu, &manager);

    assert_eq!(manager.top_level_handle(), tlas);
    assert_eq!(before.len(), after.len());
    for (index, (old, new)) in before.iter().zip(after.iter()).enumerate() {
        assert_eq!(old.custom_index_and_mask, new.custom_index_and_mask);
        assert_eq!(old.sbt_offset_and_flags, new.sbt_offset_and_flags);
        assert_eq!(
            old.acceleration_structure_reference,
            new.acceleration_structure_reference
        );
        if index == 1 {
            assert_eq!(new.transform, hal::transform_to_rows(&moved));
        } else {
            assert_eq!(old.transform, new.transform);
        }
    }
    assert_eq!(manager.instance(handles[1]).unwrap().transform, moved);

    assert_eq!(trace(&gpu, &manager, [5.0, 0.0, 0.0]), None);
    let hit = trace(&gpu, &manager, [5.0, 10.0, 0.0]).unwrap();
    assert_eq!(hit.instance_index, 1);

    // Dense variant, in instance order.
    let transforms = [
        translation(0.0, 0.0, -2.0),
        translation(5.0, 0.0, -5.0),
        translation(-5.0, 0.0, -5.0),
    ];
    manager.update_instance_transforms(&transforms).unwrap();
    let hit = trace(&gpu, &manager, [0.0, 0.0, 0.0]).unwrap();
    assert!((hit.t - 2.0).abs() < 1e-5);

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn topology_change_requires_rebuild() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();
    let before = read_instances(&gpu, &manager);

    manager.remove_instance(handles[2]).unwrap();
    let result = manager.update_instance_transforms(&[hal::IDENTITY_TRANSFORM; 2]);
    assert!(matches!(result, Err(Error::InvalidUpdate(_))));
    let result = manager.update_blas_transforms(&[(handles[0], hal::IDENTITY_TRANSFORM)]);
    assert!(matches!(result, Err(Error::InvalidUpdate(_))));
    // The top level is untouched.
    assert_eq!(manager.top_level().instance_count(), 3);
    assert_eq!(read_instances(&gpu, &manager), before);
    assert!(trace(&gpu, &manager, [-5.0, 0.0, 0.0]).is_some());

    manager.rebuild_top_level().unwrap();
    assert_eq!(manager.top_level().instance_count(), 2);
    assert!(trace(&gpu, &manager, [-5.0, 0.0, 0.0]).is_none());

    let stale = manager.update_blas_transforms(&[(handles[2], hal::IDENTITY_TRANSFORM)]);
    assert!(matches!(stale, Err(Error::StaleInstance(_))));
    assert!(matches!(
        manager.instance(handles[2]),
        Err(Error::StaleInstance(_))
    ));
    manager
        .update_blas_transforms(&[(handles[1], translation(5.0, 0.0, -3.0))])
        .unwrap();
    let hit = trace(&gpu, &manager, [5.0, 0.0, 0.0]).unwrap();
    assert!((hit.t - 3.0).abs() < 1e-5);

    // Reloading invalidates every handle.
    manager.load_scene(&scene).unwrap();
    assert!(manager.instance(handles[0]).is_err());

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn compaction_keeps_hits() {
    let gpu = Arc::new(soft::Context::new());
    let mut builder = SceneBuilder::new();
    let grid = add_grid(&mut builder, 8);
    builder.add_node(Some(grid), translation(0.0, 0.0, -4.0));
    let scene = builder.upload(&*gpu).unwrap();

    let mut compacted = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    compacted.load_scene(&scene).unwrap();
    let mut plain = AsResourceManager::new(
        Arc::clone(&gpu),
        Config {
            compaction: false,
            ..Config::default()
        },
    );
    plain.load_scene(&scene).unwrap();

    let stats = compacted.last_build_stats();
    assert_eq!(stats.compacted, 1);
    assert!(stats.final_size < stats.uncompacted_size);
    assert!(compacted.bottom_levels()[0].is_compacted());
    assert!(gpu.is_compacted(compacted.bottom_levels()[0].raw()));
    assert!(compacted.bottom_levels()[0].size() <= plain.bottom_levels()[0].size());
    assert!(!plain.bottom_levels()[0].is_compacted());

    let mut hits = 0;
    for i in 0..11 {
        for j in 0..11 {
            let origin = [i as f32 * 0.23 - 1.2, j as f32 * 0.23 - 1.2, 0.0];
            let a = trace(&gpu, &compacted, origin);
            let b = trace(&gpu, &plain, origin);
            assert_eq!(a, b);
            hits += a.is_some() as u32;
        }
    }
    assert!(hits > 0);

    drop(compacted);
    drop(plain);
    scene.destroy(&*gpu);
}

#[test]
fn compaction_readback_failure_keeps_structures() {
    let gpu = Arc::new(soft::Context::new());
    let mut builder = SceneBuilder::new();
    let grid = add_grid(&mut builder, 8);
    builder.add_node(Some(grid), translation(0.0, 0.0, -4.0));
    let scene = builder.upload(&*gpu).unwrap();

    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    gpu.inject_fault(soft::Fault::QueryReadback);
    manager.load_scene(&scene).unwrap();
    assert_eq!(manager.last_build_stats().compacted, 0);
    assert_eq!(manager.last_build_stats().compaction_skipped, 1);
    assert!(!manager.bottom_levels()[0].is_compacted());
    let hit = trace(&gpu, &manager, [0.1, 0.1, 0.0]).unwrap();
    assert!((hit.t - 4.0).abs() < 1e-5);

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn failed_load_keeps_previous_scene() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();
    let tlas = manager.top_level_handle();
    let structures = gpu.acceleration_structure_count();
    let buffers = gpu.buffer_count();

    for fault in [soft::Fault::SizeQuery, soft::Fault::Submit, soft::Fault::OutOfMemory] {
        gpu.inject_fault(fault);
        let result = manager.load_scene(&scene);
        assert!(
            matches!(result, Err(Error::BuildFailure { .. })),
            "{:?} gave {:?}",
            fault,
            result.map(|h| h.len())
        );
        assert_eq!(manager.top_level_handle(), tlas);
        assert_eq!(manager.bottom_level_count(), 2);
        assert_eq!(gpu.acceleration_structure_count(), structures);
        assert_eq!(gpu.buffer_count(), buffers);
        assert!(manager.instance(handles[0]).is_ok());
        assert!(trace(&gpu, &manager, [0.0, 0.0, 0.0]).is_some());
    }

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn top_level_failure_keeps_previous_scene() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();
    let tlas = manager.top_level_handle();

    let mut builder = SceneBuilder::new();
    let triangle = add_triangle(&mut builder);
    builder.add_node(Some(triangle), translation(0.0, 0.0, -3.0));
    let other = builder.upload(&*gpu).unwrap();
    let structures = gpu.acceleration_structure_count();
    let buffers = gpu.buffer_count();
    let submissions = gpu.submission_count();

    // The bottom level of the new scene builds, then its top level fails.
    gpu.inject_fault(soft::Fault::TopLevelSizeQuery);
    let result = manager.load_scene(&other);
    assert!(matches!(result, Err(Error::BuildFailure { .. })));
    assert!(gpu.submission_count() > submissions);
    assert_eq!(manager.top_level_handle(), tlas);
    assert_eq!(manager.top_level().state(), TlasState::Built);
    assert_eq!(manager.bottom_level_count(), 2);
    assert_eq!(manager.instance_count(), 3);
    assert_eq!(gpu.acceleration_structure_count(), structures);
    assert_eq!(gpu.buffer_count(), buffers);
    assert!(manager.instance(handles[0]).is_ok());
    let hit = trace(&gpu, &manager, [0.0, 0.0, 0.0]).unwrap();
    assert!((hit.t - 5.0).abs() < 1e-5);

    let handles = manager.load_scene(&other).unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(manager.bottom_level_count(), 1);
    let hit = trace(&gpu, &manager, [0.0, 0.0, 0.0]).unwrap();
    assert!((hit.t - 3.0).abs() < 1e-5);

    drop(manager);
    scene.destroy(&*gpu);
    other.destroy(&*gpu);
    assert_eq!(gpu.buffer_count(), 0);
    assert_eq!(gpu.acceleration_structure_count(), 0);
}

#[test]
fn failed_update_restores_transforms() {
    let gpu = Arc::new(soft::Context::new());
    let scene = three_node_scene(&gpu);
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager.load_scene(&scene).unwrap();
    let before = read_instances(&gpu, &manager);
    let original = manager.instance(handles[0]).unwrap().transform;

    gpu.inject_fault(soft::Fault::Submit);
    let result = manager.update_blas_transforms(&[(handles[0], translation(0.0, 10.0, -5.0))]);
    assert!(matches!(result, Err(Error::BuildFailure { .. })));
    assert_eq!(manager.instance(handles[0]).unwrap().transform, original);
    assert_eq!(read_instances(&gpu, &manager), before);
    assert_eq!(trace(&gpu, &manager, [0.0, 0.0, 0.0]).unwrap().instance_index, 0);
    assert_eq!(trace(&gpu, &manager, [0.0, 10.0, 0.0]), None);

    gpu.inject_fault(soft::Fault::Submit);
    let result = manager.update_instance_transforms(&[hal::IDENTITY_TRANSFORM; 3]);
    assert!(matches!(result, Err(Error::BuildFailure { .. })));
    assert_eq!(read_instances(&gpu, &manager), before);

    // The next update must not carry over the rejected transforms.
    let moved = translation(5.0, 10.0, -5.0);
    manager.update_blas_transforms(&[(handles[1], moved)]).unwrap();
    manager.wait_idle();
    let after = read_instances(&gpu, &manager);
    assert_eq!(after[0].transform, before[0].transform);
    assert_eq!(after[2].transform, before[2].transform);
    assert_eq!(after[1].transform, hal::transform_to_rows(&moved));
    assert_eq!(trace(&gpu, &manager, [0.0, 0.0, 0.0]).unwrap().instance_index, 0);
    assert_eq!(trace(&gpu, &manager, [0.0, 10.0, 0.0]), None);

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn custom_index_must_fit_24_bits() {
    let gpu = Arc::new(soft::Context::new());
    let unit = hal::Aabb {
        min: [-0.5, -0.5, -6.0],
        max: [0.5, 0.5, -5.0],
    };
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    assert!(matches!(
        manager.load_aabbs(&[unit], &[1 << 24], false),
        Err(Error::InvalidGeometry(_))
    ));
    assert!(manager.top_level_handle().is_none());
    assert_eq!(gpu.buffer_count(), 0);
    assert_eq!(gpu.acceleration_structure_count(), 0);

    let max = hal::InstanceDesc::MAX_CUSTOM_INDEX;
    let handles = manager.load_aabbs(&[unit], &[max], false).unwrap();
    assert_eq!(manager.instance(handles[0]).unwrap().custom_index, max);
    let hit = trace(&gpu, &manager, [0.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.instance_custom_index, max);

    let oversized = blade_accel::Instance {
        custom_index: max + 1,
        ..blade_accel::Instance::new(0, hal::IDENTITY_TRANSFORM)
    };
    assert!(matches!(
        manager.add_instance(oversized),
        Err(Error::InvalidCustomIndex { custom_index, .. }) if custom_index == max + 1
    ));
    assert_eq!(manager.instance_count(), 1);

    drop(manager);
    assert_eq!(gpu.buffer_count(), 0);
}

#[test]
fn invalid_geometry_is_rejected() {
    let gpu = Arc::new(soft::Context::new());
    let mut builder = SceneBuilder::new();
    let broken = builder.add_mesh("broken", &[[0.0; 3], [1.0, 0.0, 0.0]], &[0, 1]);
    builder.add_node(Some(broken), hal::IDENTITY_TRANSFORM);
    let scene = builder.upload(&*gpu).unwrap();

    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    assert!(matches!(
        manager.load_scene(&scene),
        Err(Error::InvalidGeometry(_))
    ));
    assert!(manager.top_level_handle().is_none());
    assert!(matches!(
        manager.load_aabbs(&[hal::Aabb::default()], &[], false),
        Err(Error::InvalidGeometry(_))
    ));

    drop(manager);
    scene.destroy(&*gpu);
}

#[test]
fn procedural_refit() {
    let gpu = Arc::new(soft::Context::new());
    let unit = |x: f32| hal::Aabb {
        min: [x - 0.5, -0.5, -6.0],
        max: [x + 0.5, 0.5, -5.0],
    };
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), Config::default());
    let handles = manager
        .load_aabbs(&[unit(0.0), unit(3.0), unit(6.0)], &[4, 1, 4], true)
        .unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(manager.bottom_level_count(), 2);
    assert_eq!(manager.instance(handles[0]).unwrap().custom_index, 1);
    assert_eq!(manager.instance(handles[1]).unwrap().custom_index, 4);

    let hit = trace(&gpu, &manager, [3.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.instance_custom_index, 1);
    assert!((hit.t - 5.0).abs() < 1e-5);
    let hit = trace(&gpu, &manager, [6.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.instance_custom_index, 4);
    assert_eq!(hit.primitive_index, 1);

    manager
        .refit_aabbs(&[unit(0.0), unit(13.0), unit(6.0)])
        .unwrap();
    assert!(trace(&gpu, &manager, [3.0, 0.0, 0.0]).is_none());
    let hit = trace(&gpu, &manager, [13.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.instance_custom_index, 1);
    assert!(matches!(
        manager.refit_aabbs(&[unit(0.0)]),
        Err(Error::InvalidUpdate(_))
    ));

    manager.load_aabbs(&[unit(0.0)], &[0], false).unwrap();
    assert!(matches!(
        manager.refit_aabbs(&[unit(1.0)]),
        Err(Error::InvalidUpdate(_))
    ));

    drop(manager);
    assert_eq!(gpu.buffer_count(), 0);
    assert_eq!(gpu.acceleration_structure_count(), 0);
}

#[test]
fn refit_rebuilds_static_top_level() {
    let gpu = Arc::new(soft::Context::new());
    let config = Config {
        top_level_updates: false,
        ..Config::default()
    };
    let unit = |x: f32| hal::Aabb {
        min: [x - 0.5, -0.5, -6.0],
        max: [x + 0.5, 0.5, -5.0],
    };
    let mut manager = AsResourceManager::new(Arc::clone(&gpu), config);
    manager.load_aabbs(&[unit(0.0), unit(2.0)], &[0, 0], true).unwrap();
    assert!(manager.update_instance_transforms(&[hal::IDENTITY_TRANSFORM]).is_err());

    manager.refit_aabbs(&[unit(0.0), unit(8.0)]).unwrap();
    assert!(trace(&gpu, &manager, [2.0, 0.0, 0.0]).is_none());
    let hit = trace(&gpu, &manager, [8.0, 0.0, 0.0]).unwrap();
    assert_eq!(hit.primitive_index, 1);
    assert_eq!(manager.top_level().state(), TlasState::Built);

    drop(manager);
    assert_eq!(gpu.buffer_count(), 0);
    assert_eq!(gpu.acceleration_structure_count(), 0);
}

#[test]
fn demo_config_parses() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/trace/config.ron");
    let config = Config::load(&path).unwrap();
    assert!(config.compaction);
    assert!(config.top_level_updates);
}
