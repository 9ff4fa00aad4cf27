#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // No need for defaults in the internal types.
    clippy::new_without_default,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub mod soft;
mod traits;

pub use traits::*;

/// Row-major 3x4 affine transform, as consumed by the ray tracing hardware.
pub type Transform = mint::RowMatrix3x4<f32>;

pub const IDENTITY_TRANSFORM: Transform = mint::RowMatrix3x4 {
    x: mint::Vector4 {
        x: 1.0,
        y: 0.0,
        z: 0.0,
        w: 0.0,
    },
    y: mint::Vector4 {
        x: 0.0,
        y: 1.0,
        z: 0.0,
        w: 0.0,
    },
    z: mint::Vector4 {
        x: 0.0,
        y: 0.0,
        z: 1.0,
        w: 0.0,
    },
};

pub fn transform_to_rows(t: &Transform) -> [f32; 12] {
    [
        t.x.x, t.x.y, t.x.z, t.x.w, //
        t.y.x, t.y.y, t.y.z, t.y.w, //
        t.z.x, t.z.y, t.z.z, t.z.w,
    ]
}

pub fn transform_from_rows(r: &[f32; 12]) -> Transform {
    mint::RowMatrix3x4 {
        x: mint::Vector4 {
            x: r[0],
            y: r[1],
            z: r[2],
            w: r[3],
        },
        y: mint::Vector4 {
            x: r[4],
            y: r[5],
            z: r[6],
            w: r[7],
        },
        z: mint::Vector4 {
            x: r[8],
            y: r[9],
            z: r[10],
            w: r[11],
        },
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfMemory,
    #[error("device lost")]
    Lost,
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("invalid usage: {0}")]
    Validation(String),
    #[error("query results are not available")]
    QueryUnavailable,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Memory {
    /// Device-local, not visible to the host.
    Device,
    /// Visible to both the host and the device.
    Shared,
    /// Host-visible staging memory.
    Upload,
}

#[derive(Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub memory: Memory,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq)]
pub struct GenericBufferPiece<B> {
    pub buffer: B,
    pub offset: u64,
}

impl<B> From<B> for GenericBufferPiece<B> {
    fn from(buffer: B) -> Self {
        Self { buffer, offset: 0 }
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum AccelerationStructureType {
    TopLevel,
    BottomLevel,
}

#[derive(Debug)]
pub struct AccelerationStructureDesc<'a, B> {
    pub name: &'a str,
    pub ty: AccelerationStructureType,
    /// Region the structure is placed into.
    pub buffer: GenericBufferPiece<B>,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AccelerationStructureSizes {
    /// Size of the acceleration structure itself.
    pub data: u64,
    /// Scratch space required for a full build.
    pub scratch: u64,
    /// Scratch space required for an in-place update.
    pub update_scratch: u64,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct AccelerationStructureFlags: u32 {
        const PREFER_FAST_TRACE = 1 << 0;
        const PREFER_FAST_BUILD = 1 << 1;
        const ALLOW_UPDATE = 1 << 2;
        const ALLOW_COMPACTION = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BuildMode {
    /// Construct the structure from scratch.
    Build,
    /// Refit the existing structure in place, keeping its topology.
    Update,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VertexFormat {
    F32Vec3,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AccelerationStructureMesh<B> {
    pub vertex_data: GenericBufferPiece<B>,
    pub vertex_format: VertexFormat,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub index_data: GenericBufferPiece<B>,
    pub index_type: Option<IndexType>,
    pub triangle_count: u32,
    /// Optional 3x4 row-major transform applied to the vertices at build time.
    pub transform_data: Option<GenericBufferPiece<B>>,
    pub is_opaque: bool,
}

#[derive(Clone, Debug)]
pub struct AccelerationStructureAabbs<B> {
    pub data: GenericBufferPiece<B>,
    pub stride: u32,
    pub count: u32,
    pub is_opaque: bool,
}

#[derive(Clone, Debug)]
pub enum AccelerationStructureGeometry<B> {
    Triangles(AccelerationStructureMesh<B>),
    Aabbs(AccelerationStructureAabbs<B>),
}

impl<B> AccelerationStructureGeometry<B> {
    pub fn primitive_count(&self) -> u32 {
        match *self {
            Self::Triangles(ref mesh) => mesh.triangle_count,
            Self::Aabbs(ref aabbs) => aabbs.count,
        }
    }
}

/// Axis-aligned box in the layout expected by the device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn is_valid(&self) -> bool {
        self.min
            .iter()
            .chain(self.max.iter())
            .all(|v| v.is_finite())
            && (0..3).all(|i| self.min[i] <= self.max[i])
    }
}

/// Single top-level instance in the layout expected by the device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Binding table offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl InstanceDesc {
    pub const SIZE: u64 = size_of::<Self>() as u64;
    /// Largest custom index that fits into an instance record.
    pub const MAX_CUSTOM_INDEX: u32 = 0xFF_FFFF;

    pub fn new(
        transform: &Transform,
        custom_index: u32,
        mask: u8,
        flags: u8,
        acceleration_structure_reference: u64,
    ) -> Self {
        assert!(
            custom_index <= Self::MAX_CUSTOM_INDEX,
            "Custom index must fit into 24 bits"
        );
        Self {
            transform: transform_to_rows(transform),
            custom_index_and_mask: custom_index | ((mask as u32) << 24),
            sbt_offset_and_flags: (flags as u32) << 24,
            acceleration_structure_reference,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0xFF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn flags(&self) -> u8 {
        (self.sbt_offset_and_flags >> 24) as u8
    }
}

pub struct CommandEncoderDesc<'a> {
    pub name: &'a str,
    /// Number of buffers that this encoder needs to keep alive.
    pub buffer_count: u32,
}

#[derive(Debug)]
pub struct QueryPoolDesc<'a> {
    pub name: &'a str,
    pub count: u32,
}

#[test]
fn instance_desc_layout() {
    assert_eq!(InstanceDesc::SIZE, 64);
    assert_eq!(size_of::<Aabb>(), 24);
    let desc = InstanceDesc::new(&IDENTITY_TRANSFORM, 0x12_3456, 0xA5, 0x3, 0xDEAD_0000);
    assert_eq!(desc.custom_index(), 0x12_3456);
    assert_eq!(desc.mask(), 0xA5);
    assert_eq!(desc.flags(), 0x3);
    assert_eq!(transform_from_rows(&desc.transform), IDENTITY_TRANSFORM);
}
