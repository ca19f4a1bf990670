use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use glam::Vec4;
use itertools::Itertools;

use scenestream::io::loader::{LoadOptions, NodeLoader};
use scenestream::io::primitives::{PrimitiveLoader, checker_texture, cube_mesh, quad_mesh};
use scenestream::loading::{LoadTask, LoaderPool, MergeTask, Operation};
use scenestream::rendering::compile::manager::{CompileManager, CompileStatus};
use scenestream::rendering::device::SoftwareDevice;
use scenestream::rendering::resources::ResourceHints;
use scenestream::rendering::types::{AlbedoType, Material};
use scenestream::scene::node::{Node, NodeRef};
use scenestream::streaming::{collect_unresolved_pages, has_nonresident_pages};
use scenestream::viewer::{SortOrder, View, Viewer};

fn small_hints() -> ResourceHints {
    ResourceHints {
        num_descriptor_sets: 32,
        num_uniform_buffers: 32,
        num_combined_image_samplers: 32,
    }
}

fn flat_quad(slot: u32, render_bin: Option<i32>) -> NodeRef {
    let material = Material {
        slot,
        albedo: AlbedoType::Value(Vec4::ONE),
    };
    Node::geometry(quad_mesh(), material, None, render_bin)
}

fn textured_cube() -> NodeRef {
    let material = Material {
        slot: 2,
        albedo: AlbedoType::Textured,
    };
    Node::geometry(cube_mesh(), material, Some(checker_texture(4, 4)), None)
}

/// Loads `slot:<n>` as an untextured quad bound to descriptor slot n.
struct SlotLoader;

impl NodeLoader for SlotLoader {
    fn load(&self, path: &str, _options: &Arc<LoadOptions>) -> Result<NodeRef, anyhow::Error> {
        let slot = path
            .strip_prefix("slot:")
            .ok_or_else(|| anyhow::anyhow!("No loader able to handle {}", path))?
            .parse::<u32>()?;
        Ok(flat_quad(slot, None))
    }
}

/// Pumps the owning thread's drain point until `done` holds or the timeout
/// expires; returns whether it held.
fn pump_until(viewer: &Viewer, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        viewer.update();
        if done() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn child_count(node: &NodeRef) -> usize {
    match &**node {
        Node::Group(group) => group.children.read().expect("children read lock").len(),
        Node::Transform(transform) => transform.children.read().expect("children read lock").len(),
        _ => 0,
    }
}

#[test]
fn pool_size_bounds_concurrent_device_work() {
    let device = Arc::new(SoftwareDevice::with_work_duration(Duration::from_millis(30)));
    let manager = Arc::new(CompileManager::new(device.clone(), &small_hints(), 2).expect("manager"));

    let workers = (0..6u32)
        .map(|index| {
            let manager = manager.clone();
            std::thread::Builder::new()
                .name(format!("compiler {}", index))
                .spawn(move || manager.compile(&flat_quad(index, None)))
                .expect("Failed to spawn compiler")
        })
        .collect_vec();

    for worker in workers {
        let result = worker.join().expect("Compiler to terminate normally");
        assert_eq!(result.status, CompileStatus::Success);
    }

    assert!(
        device.peak_in_flight() <= 2,
        "{} compilations ran device work at once with a pool of 2",
        device.peak_in_flight()
    );
}

#[test]
fn single_context_is_never_shared() {
    let device = Arc::new(SoftwareDevice::with_work_duration(Duration::from_millis(1)));
    let manager = Arc::new(CompileManager::new(device.clone(), &small_hints(), 1).expect("manager"));

    let workers = (0..3u32)
        .map(|index| {
            let manager = manager.clone();
            std::thread::Builder::new()
                .name(format!("compiler {}", index))
                .spawn(move || {
                    (0..5u32)
                        .map(|attempt| manager.compile(&flat_quad(index * 10 + attempt, None)).status)
                        .collect_vec()
                })
                .expect("Failed to spawn compiler")
        })
        .collect_vec();

    for worker in workers {
        let statuses = worker.join().expect("Compiler to terminate normally");
        assert!(statuses.iter().all(|status| *status == CompileStatus::Success));
    }

    assert_eq!(device.peak_in_flight(), 1);
}

#[test]
fn zero_requirement_object_compiles_to_an_empty_result() {
    let device = Arc::new(SoftwareDevice::new());
    let viewer = Viewer::new();
    viewer.assign_render_task(vec![View::new()]);
    viewer
        .compile(device.clone(), &ResourceHints::default(), 1)
        .expect("viewer compile");
    let manager = viewer.compile_manager().expect("manager");

    let result = manager.compile(&Node::group());

    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(result.max_slot, 0);
    assert!(!result.contains_paged_lod);
    assert!(result.views.is_empty());
    assert_eq!(device.buffers_created(), 0);
    assert_eq!(device.sets_allocated(), 0);
}

#[test]
fn max_slot_reconciliation_is_monotonic_and_idempotent() {
    let device = Arc::new(SoftwareDevice::new());
    let viewer = Viewer::new();
    viewer.assign_render_task(vec![View::new()]);
    viewer.compile(device, &small_hints(), 1).expect("viewer compile");
    let manager = viewer.compile_manager().expect("manager");

    let attachment = Node::group();
    let result = manager.compile(&flat_quad(5, None));
    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(result.max_slot, 5);

    let merge = |node: NodeRef, result| {
        viewer.add_update_operation(Operation::Merge(MergeTask {
            path: "five".into(),
            viewer: Arc::downgrade(&viewer),
            attachment: attachment.clone(),
            node,
            result,
        }));
        viewer.update();
    };

    merge(flat_quad(5, None), result.clone());
    assert_eq!(viewer.max_slot(), 5);

    // applying the same result again never lowers the counter
    merge(flat_quad(5, None), result.clone());
    assert_eq!(viewer.max_slot(), 5);

    let lower = manager.compile(&flat_quad(3, None));
    merge(flat_quad(3, None), lower);
    assert_eq!(viewer.max_slot(), 5);
}

#[test]
fn ten_loads_fill_ten_slots() {
    let device = Arc::new(SoftwareDevice::with_work_duration(Duration::from_millis(1)));
    let viewer = Viewer::new();
    viewer.assign_render_task(vec![View::new()]);
    viewer.compile(device, &small_hints(), 4).expect("viewer compile");

    let options = Arc::new(LoadOptions {
        loader: Arc::new(SlotLoader),
        shared: None,
    });

    let scene = Node::group();
    let attachments = (0..10)
        .map(|_| {
            let attachment = Node::group();
            scene.attach(attachment.clone());
            attachment
        })
        .collect_vec();

    let loaders = LoaderPool::new(4);
    for (index, attachment) in attachments.iter().enumerate() {
        loaders.add(Operation::Load(LoadTask {
            path: format!("slot:{}", index * 2),
            options: options.clone(),
            viewer: viewer.weak(),
            attachment: attachment.clone(),
        }));
    }

    let all_merged = pump_until(&viewer, Duration::from_secs(5), || {
        attachments.iter().all(|attachment| child_count(attachment) == 1)
    });
    assert!(all_merged, "not all models were merged in time");

    assert_eq!(child_count(&scene), 10);
    assert_eq!(viewer.max_slot(), 18);

    loaders.shutdown();
    viewer.shutdown();
}

#[test]
fn bins_are_created_lazily_with_sign_derived_sort_orders() {
    let device = Arc::new(SoftwareDevice::new());
    let viewer = Viewer::new();
    let view = View::new();
    viewer.assign_render_task(vec![view.clone()]);
    viewer.compile(device, &small_hints(), 1).expect("viewer compile");
    let manager = viewer.compile_manager().expect("manager");

    let build_object = || {
        let object = Node::group();
        object.attach(flat_quad(1, Some(-3)));
        object.attach(flat_quad(1, Some(5)));
        object
    };

    let attachment = Node::group();
    let merge_once = |path: &str| {
        let object = build_object();
        let result = manager.compile(&object);
        assert_eq!(result.status, CompileStatus::Success);
        assert_eq!(result.views.len(), 1);

        viewer.add_update_operation(Operation::Merge(MergeTask {
            path: path.into(),
            viewer: Arc::downgrade(&viewer),
            attachment: attachment.clone(),
            node: object,
            result,
        }));
        viewer.update();
    };

    merge_once("first");

    {
        let bins = view.bins.read().expect("bins read lock");
        assert_eq!(bins.len(), 2);
        let ascending = bins.iter().find(|bin| bin.number == -3).expect("bin -3");
        assert_eq!(ascending.sort, SortOrder::Ascending);
        let descending = bins.iter().find(|bin| bin.number == 5).expect("bin 5");
        assert_eq!(descending.sort, SortOrder::Descending);
    }

    // a second merge referencing the same numbers must not duplicate bins
    merge_once("second");
    assert_eq!(view.bins.read().expect("bins read lock").len(), 2);
}

#[test]
fn shutdown_mid_run_fails_fast_but_lets_in_flight_work_finish() {
    let device = Arc::new(SoftwareDevice::with_work_duration(Duration::from_millis(80)));
    let manager = Arc::new(CompileManager::new(device.clone(), &small_hints(), 1).expect("manager"));

    // occupies the only context and sits in the device wait
    let in_flight = {
        let manager = manager.clone();
        std::thread::Builder::new()
            .name("in-flight compile".into())
            .spawn(move || manager.compile(&flat_quad(1, None)))
            .expect("Failed to spawn compiler")
    };
    // give the first compile time to check out the only context
    std::thread::sleep(Duration::from_millis(20));

    // blocks on checkout behind the in-flight compile
    let blocked = {
        let manager = manager.clone();
        std::thread::Builder::new()
            .name("blocked compile".into())
            .spawn(move || manager.compile(&flat_quad(2, None)))
            .expect("Failed to spawn compiler")
    };

    std::thread::sleep(Duration::from_millis(20));
    manager.shutdown();

    let in_flight = in_flight.join().expect("Compiler to terminate normally");
    assert_eq!(in_flight.status, CompileStatus::Success);

    let blocked = blocked.join().expect("Compiler to terminate normally");
    assert_eq!(blocked.status, CompileStatus::PoolShutDown);

    // new compiles after shutdown return immediately
    let start = Instant::now();
    let late = manager.compile(&flat_quad(3, None));
    assert_eq!(late.status, CompileStatus::PoolShutDown);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn reservation_failure_aborts_the_object_but_not_the_context() {
    let device = Arc::new(SoftwareDevice::new());
    // no hints: the first textured compile has to create its pool on demand
    let manager = CompileManager::new(device.clone(), &ResourceHints::default(), 1).expect("manager");

    device.inject_pool_failure(true);
    let failed = manager.compile(&textured_cube());
    assert_eq!(failed.status, CompileStatus::OutOfResources);

    device.inject_pool_failure(false);
    let retried = manager.compile(&textured_cube());
    assert_eq!(retried.status, CompileStatus::Success);
}

#[test]
fn device_errors_surface_as_failed_results() {
    let device = Arc::new(SoftwareDevice::new());
    let manager = CompileManager::new(device.clone(), &small_hints(), 1).expect("manager");

    device.inject_submission_failure(true);
    let failed = manager.compile(&flat_quad(1, None));
    assert_eq!(failed.status, CompileStatus::DeviceError);

    device.inject_submission_failure(false);
    let retried = manager.compile(&flat_quad(1, None));
    assert_eq!(retried.status, CompileStatus::Success);
}

#[test]
fn failed_loads_are_dropped_without_a_merge() {
    let device = Arc::new(SoftwareDevice::new());
    let viewer = Viewer::new();
    viewer.assign_render_task(vec![View::new()]);
    viewer.compile(device, &small_hints(), 1).expect("viewer compile");

    let options = Arc::new(LoadOptions {
        loader: Arc::new(PrimitiveLoader),
        shared: None,
    });
    let attachment = Node::group();

    let loaders = LoaderPool::new(1);
    loaders.add(Operation::Load(LoadTask {
        path: "teapot.obj".into(),
        options,
        viewer: viewer.weak(),
        attachment: attachment.clone(),
    }));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !loaders.is_idle() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    viewer.update();
    assert_eq!(viewer.pending_updates(), 0);
    assert_eq!(child_count(&attachment), 0);

    loaders.shutdown();
    viewer.shutdown();
}

#[test]
fn merges_for_a_dead_viewer_are_dropped() {
    let device = Arc::new(SoftwareDevice::new());
    let viewer = Viewer::new();
    viewer.assign_render_task(vec![View::new()]);
    viewer.compile(device, &small_hints(), 1).expect("viewer compile");
    let manager = viewer.compile_manager().expect("manager");

    let attachment = Node::group();
    let node = flat_quad(1, None);
    let result = manager.compile(&node);

    let gone: Weak<Viewer> = {
        let other = Viewer::new();
        Arc::downgrade(&other)
    };

    Operation::Merge(MergeTask {
        path: "orphan".into(),
        viewer: gone,
        attachment: attachment.clone(),
        node,
        result,
    })
    .run();

    // the owner was torn down first, so nothing may be attached
    assert_eq!(child_count(&attachment), 0);
    viewer.shutdown();
}

#[test]
fn paged_content_starts_one_pager_and_pages_in() {
    let device = Arc::new(SoftwareDevice::new());
    let viewer = Viewer::new();
    viewer.assign_render_task(vec![View::new()]);
    viewer.compile(device, &small_hints(), 2).expect("viewer compile");

    let options = Arc::new(LoadOptions {
        loader: Arc::new(PrimitiveLoader),
        shared: None,
    });

    let scene = Node::group();
    let attachment = Node::group();
    scene.attach(attachment.clone());

    let loaders = LoaderPool::new(2);
    loaders.add(Operation::Load(LoadTask {
        path: "paged:cube".into(),
        options,
        viewer: viewer.weak(),
        attachment: attachment.clone(),
    }));

    let merged = pump_until(&viewer, Duration::from_secs(5), || child_count(&attachment) == 1);
    assert!(merged, "the paged object was not merged in time");

    let pager = viewer.pager().expect("merging paged content starts the pager");

    let mut unresolved = Vec::new();
    collect_unresolved_pages(&scene, &mut unresolved);
    assert_eq!(unresolved.len(), 1);
    for lod in unresolved {
        pager.request(lod, viewer.weak());
    }

    let resident = pump_until(&viewer, Duration::from_secs(5), || !has_nonresident_pages(&scene));
    assert!(resident, "the page was not brought in, in time");

    // requesting again is a no-op; the pager was created exactly once
    let mut after = Vec::new();
    collect_unresolved_pages(&scene, &mut after);
    assert!(after.is_empty());
    assert!(Arc::ptr_eq(&pager, &viewer.pager().expect("pager persists")));

    loaders.shutdown();
    viewer.shutdown();
}
