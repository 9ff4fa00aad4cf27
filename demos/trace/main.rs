use blade_accel::{hal, hal::soft, AsResourceManager, Config, SceneBuilder};
use std::{env, f32::consts, path::PathBuf, sync::Arc};

const TORUS_RADIUS: f32 = 3.0;
const WIDTH: u32 = 64;
const HEIGHT: u32 = 28;
const FRAME_COUNT: u32 = 4;

fn torus(major: f32, minor: f32, rings: u32, sides: u32) -> (Vec<[f32; 3]>, Vec<u32>) {
    let mut vertices = Vec::with_capacity((rings * sides) as usize);
    for i in 0..rings {
        let theta = i as f32 / rings as f32 * consts::TAU;
        for j in 0..sides {
            let phi = j as f32 / sides as f32 * consts::TAU;
            let radius = major + minor * phi.cos();
            vertices.push([radius * theta.cos(), minor * phi.sin(), radius * theta.sin()]);
        }
    }
    let mut indices = Vec::with_capacity((rings * sides * 6) as usize);
    for i in 0..rings {
        for j in 0..sides {
            let a = i * sides + j;
            let b = (i + 1) % rings * sides + j;
            let c = (i + 1) % rings * sides + (j + 1) % sides;
            let d = i * sides + (j + 1) % sides;
            indices.extend_from_slice(&[a, b, c, a, c, d]);
        }
    }
    (vertices, indices)
}

fn transform(rotation: glam::Quat, translation: glam::Vec3) -> hal::Transform {
    let m = glam::Mat4::from_rotation_translation(rotation, translation).transpose();
    let rows = m.to_cols_array();
    hal::transform_from_rows(&[
        rows[0], rows[1], rows[2], rows[3], //
        rows[4], rows[5], rows[6], rows[7], //
        rows[8], rows[9], rows[10], rows[11],
    ])
}

fn instance_transforms(angle: f32) -> [hal::Transform; 2] {
    [
        transform(
            glam::Quat::from_rotation_x(angle),
            glam::Vec3::new(-1.5, 0.0, 0.0),
        ),
        transform(
            glam::Quat::from_rotation_x(angle + consts::FRAC_PI_2),
            glam::Vec3::new(1.5, 0.0, 0.0),
        ),
    ]
}

fn render(gpu: &soft::Context, tlas: soft::AccelerationStructure) -> String {
    const SHADES: &[u8] = b"@%#*+=-:.";
    let eye = glam::Vec3::new(0.0, 0.0, 12.0);
    let mut image = String::with_capacity(((WIDTH + 1) * HEIGHT) as usize);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            // Terminal cells are about twice as tall as they are wide.
            let u = (x as f32 + 0.5) / WIDTH as f32 * 2.0 - 1.0;
            let v = 1.0 - (y as f32 + 0.5) / HEIGHT as f32 * 2.0;
            let dir = glam::Vec3::new(u * 0.6, v * 0.6 * HEIGHT as f32 * 2.0 / WIDTH as f32, -1.0);
            let ray = soft::Ray::new(eye, dir.normalize());
            let symbol = match gpu.trace_ray(tlas, &ray) {
                Ok(Some(hit)) => {
                    let depth = ((hit.t - 6.0) / 12.0).clamp(0.0, 0.999);
                    SHADES[(depth * SHADES.len() as f32) as usize] as char
                }
                Ok(None) => ' ',
                Err(e) => {
                    log::error!("Ray query failed: {}", e);
                    '?'
                }
            };
            image.push(symbol);
        }
        image.push('\n');
    }
    image
}

fn main() {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path)).unwrap(),
        None => Config::load(&PathBuf::from("demos/trace/config.ron")).unwrap_or_else(|e| {
            log::warn!("Using the default configuration: {}", e);
            Config::default()
        }),
    };

    let gpu = Arc::new(soft::Context::new());
    let mut builder = SceneBuilder::new();
    let (vertices, indices) = torus(TORUS_RADIUS, 1.0, 48, 12);
    let mesh = builder.add_mesh("torus", &vertices, &indices);
    for transform in instance_transforms(0.0) {
        builder.add_node(Some(mesh), transform);
    }
    let scene = builder.upload(&*gpu).unwrap();

    let mut manager = AsResourceManager::new(Arc::clone(&gpu), config);
    manager.load_scene(&scene).unwrap();
    let stats = manager.last_build_stats();
    println!(
        "{} bottom-level structures, {} instances, {} -> {} bytes",
        manager.bottom_level_count(),
        manager.instance_count(),
        stats.uncompacted_size,
        stats.final_size
    );

    for frame in 0..FRAME_COUNT {
        let angle = frame as f32 * 0.4;
        if frame != 0 {
            manager
                .update_instance_transforms(&instance_transforms(angle))
                .unwrap();
            manager.wait_idle();
        }
        let tlas = manager.top_level_handle().unwrap();
        println!("Frame {} (angle {:.1})", frame, angle);
        print!("{}", render(&gpu, tlas));
    }

    drop(manager);
    scene.destroy(&*gpu);
}
