use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use glam::{Affine3A, Vec3};
use log::{info, trace};

use scenestream::io::loader::LoadOptions;
use scenestream::io::primitives::PrimitiveLoader;
use scenestream::loading::{LoadTask, LoaderPool, Operation};
use scenestream::rendering::device::{GpuDevice, SoftwareDevice};
use scenestream::rendering::resources::ResourceHints;
use scenestream::scene::node::{Node, NodeRef};
use scenestream::settings::CliArgs;
use scenestream::streaming::{collect_unresolved_pages, has_nonresident_pages};
use scenestream::viewer::{View, Viewer};

fn main() {
    env_logger::init();

    let args = CliArgs::parse();
    trace!("Starting with args: {:?}", args);

    if args.paths.is_empty() {
        eprintln!("Please specify models to load on the command line, e.g. cube quad paged:cube");
        std::process::exit(1);
    }

    // Stand-in for the real graphics backend; waits take a little simulated
    // time so the bounded concurrency of the pool is observable in the logs.
    let device: Arc<dyn GpuDevice> = Arc::new(SoftwareDevice::with_work_duration(Duration::from_millis(2)));

    let viewer = Viewer::new();
    let view = View::new();
    viewer.assign_render_task(vec![view.clone()]);

    // Pre-size descriptor pools so small models don't each allocate their own.
    let hints = match &args.resource {
        Some(path) => ResourceHints::from_file(path).expect("Failed to read resource hints"),
        None => ResourceHints {
            num_descriptor_sets: 256,
            num_uniform_buffers: 256,
            num_combined_image_samplers: 256,
        },
    };
    viewer
        .compile(device.clone(), &hints, args.pool_size)
        .expect("Failed to build the compile context pool");

    let options = LoadOptions::new(Arc::new(PrimitiveLoader));

    // Lay the models out on a grid of attachment transforms; every slot gets
    // its child spliced in by the merge step once loading and compilation
    // finished, whenever that is.
    let num_models = args.paths.len();
    let columns = (num_models as f32).sqrt().ceil().max(1.0) as usize;

    let scene = Node::group();
    let loaders = LoaderPool::new(args.threads);
    let mut attachments: Vec<NodeRef> = Vec::with_capacity(num_models);

    for (index, path) in args.paths.iter().enumerate() {
        let position = Vec3::new((index % columns) as f32 * 2.0, (index / columns) as f32 * 2.0, 0.0);
        let transform = Node::transform(Affine3A::from_translation(position));

        scene.attach(transform.clone());
        attachments.push(transform.clone());

        loaders.add(Operation::Load(LoadTask {
            path: path.clone(),
            options: options.clone(),
            viewer: viewer.weak(),
            attachment: transform,
        }));
    }

    // Rendering main loop stand-in: merge first, then what would be record,
    // submit and present.
    let mut frame: i64 = 0;
    loop {
        viewer.update();

        // where a renderer's record traversal would notice missing detail pages
        if let Some(pager) = viewer.pager() {
            let mut unresolved = Vec::new();
            collect_unresolved_pages(&scene, &mut unresolved);
            for lod in unresolved {
                pager.request(lod, viewer.weak());
            }
        }

        let merged = attachments.iter().filter(|slot| has_children(slot)).count();
        trace!(
            "Frame {}: {}/{} models resident, max slot {}",
            frame,
            merged,
            num_models,
            viewer.max_slot()
        );

        frame += 1;
        if args.frames >= 0 && frame >= args.frames {
            break;
        }
        if args.frames < 0 && loaders.is_idle() && viewer.pending_updates() == 0 && pages_settled(&viewer, &scene) {
            break;
        }

        std::thread::sleep(Duration::from_millis(16));
    }

    let merged = attachments.iter().filter(|slot| has_children(slot)).count();
    info!(
        "Scene settled after {} frames: {}/{} models resident, max slot {}",
        frame,
        merged,
        num_models,
        viewer.max_slot()
    );

    loaders.shutdown();
    viewer.shutdown();
}

fn has_children(node: &NodeRef) -> bool {
    match &**node {
        Node::Transform(transform) => !transform.children.read().expect("children read lock").is_empty(),
        Node::Group(group) => !group.children.read().expect("children read lock").is_empty(),
        _ => false,
    }
}

// A page whose load keeps failing keeps this false, like a real renderer
// would keep re-requesting it each frame; cap the run with -f in that case.
fn pages_settled(viewer: &Viewer, scene: &NodeRef) -> bool {
    if viewer.pager().is_none() {
        return true;
    }
    !has_nonresident_pages(scene)
}
