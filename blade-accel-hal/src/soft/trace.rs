use glam::Vec3;

use super::{Content, Primitive, Shape};
use crate::DeviceError;

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
    pub t_min: f32,
    pub t_max: f32,
    pub mask: u8,
}

impl Ray {
    pub fn new(origin: Vec3, dir: Vec3) -> Self {
        Self {
            origin,
            dir,
            t_min: 0.0,
            t_max: f32::INFINITY,
            mask: 0xFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    pub t: f32,
    pub instance_index: u32,
    pub instance_custom_index: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
}

fn intersect_triangle(origin: Vec3, dir: Vec3, v: &[Vec3; 3]) -> Option<f32> {
    const EPSILON: f32 = 1e-8;
    let e1 = v[1] - v[0];
    let e2 = v[2] - v[0];
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - v[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let w = dir.dot(q) * inv_det;
    if w < 0.0 || u + w > 1.0 {
        return None;
    }
    Some(e2.dot(q) * inv_det)
}

fn intersect_aabb(origin: Vec3, dir: Vec3, min: Vec3, max: Vec3, t_min: f32) -> Option<f32> {
    let inv_dir = dir.recip();
    let t0 = (min - origin) * inv_dir;
    let t1 = (max - origin) * inv_dir;
    let near = t0.min(t1).max_element();
    let far = t0.max(t1).min_element();
    let enter = near.max(t_min);
    if far >= enter {
        Some(enter)
    } else {
        None
    }
}

fn closest_primitive(
    primitives: &[Primitive],
    origin: Vec3,
    dir: Vec3,
    t_min: f32,
    t_max: f32,
) -> Option<(f32, &Primitive)> {
    let mut best: Option<(f32, &Primitive)> = None;
    for primitive in primitives {
        let t = match primitive.shape {
            Shape::Triangle(ref vertices) => intersect_triangle(origin, dir, vertices),
            Shape::Aabb { min, max } => intersect_aabb(origin, dir, min, max, t_min),
        };
        let limit = best.map_or(t_max, |(t, _)| t);
        match t {
            Some(t) if t >= t_min && t < limit => best = Some((t, primitive)),
            _ => {}
        }
    }
    best
}

impl super::Context {
    /// Find the closest hit of `ray` against a built top-level structure.
    pub fn trace_ray(
        &self,
        tlas: super::AccelerationStructure,
        ray: &Ray,
    ) -> Result<Option<RayHit>, DeviceError> {
        let state = self.lock();
        let instances = match state.structure(tlas).content {
            Content::Top(ref instances) => instances.clone(),
            _ => {
                return Err(DeviceError::Validation(
                    "ray queries need a built top-level structure".to_string(),
                ))
            }
        };

        let mut best: Option<RayHit> = None;
        for (instance_index, instance) in instances.iter().enumerate() {
            if instance.mask & ray.mask == 0 {
                continue;
            }
            if !state.is_alive(instance.blas) {
                return Err(DeviceError::Validation(format!(
                    "instance {} references a destroyed bottom-level structure",
                    instance_index
                )));
            }
            let r = &instance.transform;
            let object_to_world = glam::Mat4::from_cols_array(&[
                r[0], r[4], r[8], 0.0, //
                r[1], r[5], r[9], 0.0, //
                r[2], r[6], r[10], 0.0, //
                r[3], r[7], r[11], 1.0,
            ]);
            if object_to_world.determinant().abs() < f32::EPSILON {
                continue;
            }
            let world_to_object = object_to_world.inverse();
            let origin = world_to_object.transform_point3(ray.origin);
            let dir = world_to_object.transform_vector3(ray.dir);
            let t_max = best.map_or(ray.t_max, |hit| hit.t);
            if let Some((t, primitive)) =
                closest_primitive(&instance.primitives, origin, dir, ray.t_min, t_max)
            {
                best = Some(RayHit {
                    t,
                    instance_index: instance_index as u32,
                    instance_custom_index: instance.custom_index,
                    geometry_index: primitive.geometry_index,
                    primitive_index: primitive.primitive_index,
                });
            }
        }
        Ok(best)
    }
}
