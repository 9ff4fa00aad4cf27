//! Read-only view of a loaded scene, as produced by an asset loader.

use blade_accel_hal as hal;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Node {
    /// Object to world transform.
    pub transform: hal::Transform,
    /// Index into [`Scene::meshes`], if the node is drawable.
    pub mesh: Option<usize>,
}

/// Range of a mesh inside the shared vertex and index buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    pub name: String,
    pub first_index: u32,
    pub index_count: u32,
    /// First vertex of the mesh. Indices are relative to it.
    pub first_vertex: u32,
    pub vertex_count: u32,
    pub is_opaque: bool,
}

pub struct Scene<B> {
    pub nodes: Vec<Node>,
    pub meshes: Vec<Mesh>,
    pub vertex_buffer: B,
    pub vertex_stride: u32,
    pub index_buffer: B,
    pub index_type: hal::IndexType,
    /// Per-node object to world transforms, one 3x4 row-major matrix per node.
    pub transform_buffer: Option<B>,
}

impl<B> Scene<B> {
    /// Byte size of one slot in the transform buffer.
    pub const TRANSFORM_SIZE: u64 = 48;

    pub fn drawable_nodes(&self) -> impl Iterator<Item = (usize, &Node, usize)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.mesh.map(|mesh| (index, node, mesh)))
    }
}

/// Host-side scene contents, uploaded into device buffers on demand.
#[derive(Default)]
pub struct SceneBuilder {
    vertices: Vec<[f32; 3]>,
    indices: Vec<u32>,
    meshes: Vec<Mesh>,
    nodes: Vec<Node>,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, name: &str, vertices: &[[f32; 3]], indices: &[u32]) -> usize {
        self.meshes.push(Mesh {
            name: name.to_string(),
            first_index: self.indices.len() as u32,
            index_count: indices.len() as u32,
            first_vertex: self.vertices.len() as u32,
            vertex_count: vertices.len() as u32,
            is_opaque: true,
        });
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
        self.meshes.len() - 1
    }

    pub fn add_node(&mut self, mesh: Option<usize>, transform: hal::Transform) -> usize {
        self.nodes.push(Node { transform, mesh });
        self.nodes.len() - 1
    }

    fn upload_buffer<D: hal::ResourceDevice>(
        gpu: &D,
        name: &str,
        data: &[u8],
    ) -> Result<D::Buffer, hal::DeviceError> {
        let buffer = gpu.create_buffer(hal::BufferDesc {
            name,
            size: (data.len() as u64).max(4),
            memory: hal::Memory::Shared,
        })?;
        gpu.write_buffer(buffer.into(), data);
        Ok(buffer)
    }

    pub fn upload<D: hal::ResourceDevice>(
        &self,
        gpu: &D,
    ) -> Result<Scene<D::Buffer>, hal::DeviceError> {
        let transforms = self
            .nodes
            .iter()
            .map(|node| hal::transform_to_rows(&node.transform))
            .collect::<Vec<_>>();
        let vertex_buffer =
            Self::upload_buffer(gpu, "scene vertices", bytemuck::cast_slice(&self.vertices))?;
        let index_buffer =
            match Self::upload_buffer(gpu, "scene indices", bytemuck::cast_slice(&self.indices)) {
                Ok(buffer) => buffer,
                Err(e) => {
                    gpu.destroy_buffer(vertex_buffer);
                    return Err(e);
                }
            };
        let transform_buffer =
            match Self::upload_buffer(gpu, "scene transforms", bytemuck::cast_slice(&transforms)) {
                Ok(buffer) => buffer,
                Err(e) => {
                    gpu.destroy_buffer(vertex_buffer);
                    gpu.destroy_buffer(index_buffer);
                    return Err(e);
                }
            };
        log::debug!(
            "Uploaded {} vertices, {} indices and {} nodes",
            self.vertices.len(),
            self.indices.len(),
            self.nodes.len()
        );
        Ok(Scene {
            nodes: self.nodes.clone(),
            meshes: self.meshes.clone(),
            vertex_buffer,
            vertex_stride: 12,
            index_buffer,
            index_type: hal::IndexType::U32,
            transform_buffer: Some(transform_buffer),
        })
    }
}

impl<B: hal::BufferHandle> Scene<B> {
    pub fn destroy<D: hal::ResourceDevice<Buffer = B>>(self, gpu: &D) {
        gpu.destroy_buffer(self.vertex_buffer);
        gpu.destroy_buffer(self.index_buffer);
        if let Some(buffer) = self.transform_buffer {
            gpu.destroy_buffer(buffer);
        }
    }
}
