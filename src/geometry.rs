use blade_accel_hal::{self as hal, BufferHandle as _};
use rayon::prelude::*;
use std::{collections::BTreeMap, ops::Range};

use crate::{scene::Scene, Error};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeometryKind {
    /// Triangles of scene meshes. Pre-transformed geometry is already in
    /// world space.
    Mesh { pre_transformed: bool },
    /// Procedural boxes of one group.
    Aabbs { blas_index: u32 },
}

/// Everything needed to build one bottom-level structure.
#[derive(Clone, Debug)]
pub struct GeometryInput<B> {
    pub name: String,
    pub kind: GeometryKind,
    pub geometries: Vec<hal::AccelerationStructureGeometry<B>>,
    /// Added to the flags of the build call.
    pub flags: hal::AccelerationStructureFlags,
}

impl<B> GeometryInput<B> {
    pub fn primitive_count(&self) -> u64 {
        self.geometries
            .iter()
            .map(|g| g.primitive_count() as u64)
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AabbGroup {
    pub blas_index: u32,
    /// Range of the group in [`AabbBatch::packed`].
    pub range: Range<u32>,
    /// Positions of the group's boxes in the original input.
    sources: Vec<usize>,
}

/// Boxes regrouped by bottom-level index, ready for upload.
#[derive(Clone, Debug, Default)]
pub struct AabbBatch {
    packed: Vec<hal::Aabb>,
    groups: Vec<AabbGroup>,
}

impl AabbBatch {
    pub fn packed(&self) -> &[hal::Aabb] {
        &self.packed
    }

    pub fn groups(&self) -> &[AabbGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Reorder a new set of boxes, given in the original input order, into
    /// the packed layout of this batch.
    pub fn pack(&self, aabbs: &[hal::Aabb]) -> Result<Vec<hal::Aabb>, Error> {
        if aabbs.len() != self.packed.len() {
            return Err(Error::InvalidUpdate(format!(
                "expected {} boxes, got {}",
                self.packed.len(),
                aabbs.len()
            )));
        }
        check_aabbs(aabbs)?;
        Ok(self
            .groups
            .iter()
            .flat_map(|group| group.sources.iter().map(|&source| aabbs[source]))
            .collect())
    }

    /// One input per group, referencing the packed boxes uploaded to `buffer`.
    pub fn inputs<B: hal::BufferHandle>(
        &self,
        buffer: B,
        flags: hal::AccelerationStructureFlags,
    ) -> Vec<GeometryInput<B>> {
        let stride = size_of::<hal::Aabb>() as u32;
        self.groups
            .iter()
            .map(|group| GeometryInput {
                name: format!("procedural {}", group.blas_index),
                kind: GeometryKind::Aabbs {
                    blas_index: group.blas_index,
                },
                geometries: vec![hal::AccelerationStructureGeometry::Aabbs(
                    hal::AccelerationStructureAabbs {
                        data: buffer.at(group.range.start as u64 * stride as u64),
                        stride,
                        count: group.range.end - group.range.start,
                        is_opaque: true,
                    },
                )],
                flags,
            })
            .collect()
    }
}

fn check_aabbs(aabbs: &[hal::Aabb]) -> Result<(), Error> {
    match aabbs.iter().position(|aabb| !aabb.is_valid()) {
        Some(index) => Err(Error::InvalidGeometry(format!(
            "box {} is inverted or not finite: {:?}",
            index, aabbs[index]
        ))),
        None => Ok(()),
    }
}

/// Converts scene meshes and procedural boxes into build inputs.
pub struct GeometryInputBuilder;

impl GeometryInputBuilder {
    fn mesh_geometry<B: hal::BufferHandle>(
        scene: &Scene<B>,
        mesh_index: usize,
        transform_data: Option<hal::GenericBufferPiece<B>>,
    ) -> Result<hal::AccelerationStructureGeometry<B>, Error> {
        let mesh = scene.meshes.get(mesh_index).ok_or_else(|| {
            Error::InvalidGeometry(format!(
                "mesh {} is out of {} meshes",
                mesh_index,
                scene.meshes.len()
            ))
        })?;
        if mesh.index_count == 0 {
            return Err(Error::InvalidGeometry(format!(
                "mesh '{}' has no indices",
                mesh.name
            )));
        }
        if mesh.index_count % 3 != 0 {
            return Err(Error::InvalidGeometry(format!(
                "mesh '{}' has {} indices, which is not a whole number of triangles",
                mesh.name, mesh.index_count
            )));
        }
        if mesh.vertex_count == 0 {
            return Err(Error::InvalidGeometry(format!(
                "mesh '{}' has no vertices",
                mesh.name
            )));
        }
        Ok(hal::AccelerationStructureGeometry::Triangles(
            hal::AccelerationStructureMesh {
                vertex_data: scene
                    .vertex_buffer
                    .at(mesh.first_vertex as u64 * scene.vertex_stride as u64),
                vertex_format: hal::VertexFormat::F32Vec3,
                vertex_stride: scene.vertex_stride,
                vertex_count: mesh.vertex_count,
                index_data: scene
                    .index_buffer
                    .at(mesh.first_index as u64 * scene.index_type.size()),
                index_type: Some(scene.index_type),
                triangle_count: mesh.index_count / 3,
                transform_data,
                is_opaque: mesh.is_opaque,
            },
        ))
    }

    /// One geometry per drawable node in `nodes`.
    ///
    /// With `pre_transform`, each geometry is baked into world space using
    /// the node's slot of the scene transform buffer.
    pub fn build_from_mesh<B: hal::BufferHandle>(
        scene: &Scene<B>,
        nodes: Range<usize>,
        pre_transform: bool,
    ) -> Result<GeometryInput<B>, Error> {
        if nodes.end > scene.nodes.len() {
            return Err(Error::InvalidGeometry(format!(
                "node range {:?} is out of {} nodes",
                nodes,
                scene.nodes.len()
            )));
        }
        let transforms = match (pre_transform, scene.transform_buffer) {
            (false, _) => None,
            (true, Some(buffer)) => Some(buffer),
            (true, None) => {
                return Err(Error::InvalidGeometry(
                    "pre-transformation requires a transform buffer".to_string(),
                ))
            }
        };

        let first = nodes.start;
        let geometries = scene.nodes[nodes.clone()]
            .par_iter()
            .enumerate()
            .filter_map(|(offset, node)| {
                let transform_data =
                    transforms.map(|buffer| buffer.at((first + offset) as u64 * Scene::<B>::TRANSFORM_SIZE));
                node.mesh
                    .map(|mesh_index| Self::mesh_geometry(scene, mesh_index, transform_data))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if geometries.is_empty() {
            return Err(Error::InvalidGeometry(format!(
                "node range {:?} has no drawable nodes",
                nodes
            )));
        }

        Ok(GeometryInput {
            name: format!("nodes {}..{}", nodes.start, nodes.end),
            kind: GeometryKind::Mesh {
                pre_transformed: pre_transform,
            },
            geometries,
            flags: hal::AccelerationStructureFlags::empty(),
        })
    }

    /// Object-space input for a single mesh.
    pub fn mesh_input<B: hal::BufferHandle>(
        scene: &Scene<B>,
        mesh_index: usize,
    ) -> Result<GeometryInput<B>, Error> {
        let geometry = Self::mesh_geometry(scene, mesh_index, None)?;
        Ok(GeometryInput {
            name: scene.meshes[mesh_index].name.clone(),
            kind: GeometryKind::Mesh {
                pre_transformed: false,
            },
            geometries: vec![geometry],
            flags: hal::AccelerationStructureFlags::empty(),
        })
    }

    pub fn build_from_meshes<B: hal::BufferHandle>(
        scene: &Scene<B>,
        mesh_indices: &[usize],
    ) -> Result<Vec<GeometryInput<B>>, Error> {
        mesh_indices
            .par_iter()
            .map(|&mesh_index| Self::mesh_input(scene, mesh_index))
            .collect()
    }

    /// Group boxes by their bottom-level index.
    ///
    /// Groups come in ascending index order, and boxes keep their relative
    /// order within a group.
    pub fn build_from_aabbs(aabbs: &[hal::Aabb], blas_indices: &[u32]) -> Result<AabbBatch, Error> {
        if aabbs.len() != blas_indices.len() {
            return Err(Error::InvalidGeometry(format!(
                "{} boxes are given {} bottom-level indices",
                aabbs.len(),
                blas_indices.len()
            )));
        }
        check_aabbs(aabbs)?;
        if let Some(&blas_index) = blas_indices
            .iter()
            .find(|&&blas_index| blas_index > hal::InstanceDesc::MAX_CUSTOM_INDEX)
        {
            return Err(Error::InvalidGeometry(format!(
                "bottom-level index {} does not fit into 24 bits",
                blas_index
            )));
        }

        let mut grouped = BTreeMap::<u32, Vec<usize>>::new();
        for (source, &blas_index) in blas_indices.iter().enumerate() {
            grouped.entry(blas_index).or_default().push(source);
        }
        let mut batch = AabbBatch {
            packed: Vec::with_capacity(aabbs.len()),
            groups: Vec::with_capacity(grouped.len()),
        };
        for (blas_index, sources) in grouped {
            let start = batch.packed.len() as u32;
            batch.packed.extend(sources.iter().map(|&source| aabbs[source]));
            batch.groups.push(AabbGroup {
                blas_index,
                range: start..batch.packed.len() as u32,
                sources,
            });
        }
        log::debug!(
            "Grouped {} boxes into {} procedural groups",
            aabbs.len(),
            batch.groups.len()
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::{GeometryInputBuilder, GeometryKind};
    use crate::scene::{Mesh, Node, Scene};
    use blade_accel_hal::{self as hal, Aabb, AccelerationStructureGeometry as Geometry};

    #[derive(Clone, Copy, Debug, Hash, PartialEq)]
    struct FakeBuffer(u32);
    impl hal::BufferHandle for FakeBuffer {}

    fn mesh(name: &str, first_index: u32, index_count: u32) -> Mesh {
        Mesh {
            name: name.to_string(),
            first_index,
            index_count,
            first_vertex: 0,
            vertex_count: 4,
            is_opaque: true,
        }
    }

    fn scene(transforms: bool) -> Scene<FakeBuffer> {
        let node = |mesh| Node {
            transform: hal::IDENTITY_TRANSFORM,
            mesh,
        };
        Scene {
            nodes: vec![node(Some(0)), node(None), node(Some(1)), node(Some(0))],
            meshes: vec![mesh("quad", 0, 6), mesh("tri", 6, 3)],
            vertex_buffer: FakeBuffer(1),
            vertex_stride: 12,
            index_buffer: FakeBuffer(2),
            index_type: hal::IndexType::U32,
            transform_buffer: if transforms { Some(FakeBuffer(3)) } else { None },
        }
    }

    fn triangles(geometry: &Geometry<FakeBuffer>) -> &hal::AccelerationStructureMesh<FakeBuffer> {
        match *geometry {
            Geometry::Triangles(ref mesh) => mesh,
            Geometry::Aabbs(_) => panic!("Expected triangles"),
        }
    }

    #[test]
    fn mesh_nodes() {
        let scene = scene(true);
        let input = GeometryInputBuilder::build_from_mesh(&scene, 0..4, true).unwrap();
        assert_eq!(input.kind, GeometryKind::Mesh { pre_transformed: true });
        assert_eq!(input.geometries.len(), 3);
        assert_eq!(input.primitive_count(), 2 + 1 + 2);
        let second = triangles(&input.geometries[1]);
        assert_eq!(second.index_data.offset, 6 * 4);
        assert_eq!(second.triangle_count, 1);
        // Transform slots follow the node index, skipping nothing.
        let offsets = input
            .geometries
            .iter()
            .map(|g| triangles(g).transform_data.unwrap().offset)
            .collect::<Vec<_>>();
        assert_eq!(offsets, [0, 2 * 48, 3 * 48]);

        let object_space = GeometryInputBuilder::build_from_mesh(&scene, 1..3, false).unwrap();
        assert_eq!(object_space.geometries.len(), 1);
        assert!(triangles(&object_space.geometries[0]).transform_data.is_none());
    }

    #[test]
    fn mesh_errors() {
        assert!(GeometryInputBuilder::build_from_mesh(&scene(false), 0..2, true).is_err());
        assert!(GeometryInputBuilder::build_from_mesh(&scene(true), 1..2, false).is_err());
        assert!(GeometryInputBuilder::build_from_mesh(&scene(true), 0..5, false).is_err());

        let mut bad = scene(true);
        bad.meshes[1].index_count = 0;
        assert!(GeometryInputBuilder::mesh_input(&bad, 1).is_err());
        bad.meshes[1].index_count = 4;
        assert!(GeometryInputBuilder::build_from_meshes(&bad, &[0, 1]).is_err());
        assert!(GeometryInputBuilder::mesh_input(&bad, 7).is_err());
    }

    #[test]
    fn meshes_keep_order() {
        let inputs = GeometryInputBuilder::build_from_meshes(&scene(false), &[1, 0]).unwrap();
        let names = inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["tri", "quad"]);
    }

    #[test]
    fn aabb_groups() {
        let unit = |x: f32| Aabb {
            min: [x, 0.0, 0.0],
            max: [x + 1.0, 1.0, 1.0],
        };
        let aabbs = [unit(0.0), unit(1.0), unit(2.0), unit(3.0)];
        let batch = GeometryInputBuilder::build_from_aabbs(&aabbs, &[5, 2, 5, 2]).unwrap();
        let groups = batch
            .groups()
            .iter()
            .map(|g| (g.blas_index, g.range.clone()))
            .collect::<Vec<_>>();
        assert_eq!(groups, [(2, 0..2), (5, 2..4)]);
        assert_eq!(batch.packed(), [aabbs[1], aabbs[3], aabbs[0], aabbs[2]]);

        let inputs = batch.inputs(FakeBuffer(9), hal::AccelerationStructureFlags::ALLOW_UPDATE);
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].kind, GeometryKind::Aabbs { blas_index: 5 });
        match inputs[1].geometries[0] {
            Geometry::Aabbs(ref boxes) => {
                assert_eq!(boxes.data.offset, 2 * 24);
                assert_eq!(boxes.count, 2);
            }
            Geometry::Triangles(_) => panic!("Expected boxes"),
        }

        let moved = [unit(10.0), unit(11.0), unit(12.0), unit(13.0)];
        assert_eq!(
            batch.pack(&moved).unwrap(),
            [moved[1], moved[3], moved[0], moved[2]]
        );
        assert!(batch.pack(&moved[..3]).is_err());
    }

    #[test]
    fn aabb_errors() {
        let good = Aabb {
            min: [0.0; 3],
            max: [1.0; 3],
        };
        let inverted = Aabb {
            min: [1.0; 3],
            max: [0.0; 3],
        };
        assert!(GeometryInputBuilder::build_from_aabbs(&[good], &[0, 1]).is_err());
        assert!(GeometryInputBuilder::build_from_aabbs(&[good, inverted], &[0, 0]).is_err());
        assert!(GeometryInputBuilder::build_from_aabbs(&[], &[]).unwrap().is_empty());
    }
}
