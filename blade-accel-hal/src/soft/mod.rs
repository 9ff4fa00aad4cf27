//! Host-memory reference device.
//!
//! Executes acceleration structure builds, updates and compaction copies on
//! the CPU at submission time, and answers ray queries by brute force. Used
//! for testing the build pipeline without a GPU.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

mod command;
mod query;
mod resource;
mod trace;

pub use command::CommandEncoder;
pub use trace::{Ray, RayHit};

const ADDRESS_BASE: u64 = 0x1_0000_0000;
const ALIGNMENT: u64 = 256;

/// Failure to trigger once on the next matching operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Any size query, bottom or top level.
    SizeQuery,
    TopLevelSizeQuery,
    QueryReadback,
    Submit,
    OutOfMemory,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Buffer {
    key: usize,
    id: u64,
}

impl crate::BufferHandle for Buffer {}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AccelerationStructure {
    key: usize,
    id: u64,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QueryPool {
    key: usize,
    id: u64,
}

#[derive(Clone, Debug)]
pub struct SyncPoint {
    index: u64,
}

pub type BufferPiece = crate::GenericBufferPiece<Buffer>;

#[derive(Clone, Copy, Debug)]
enum Shape {
    Triangle([glam::Vec3; 3]),
    Aabb { min: glam::Vec3, max: glam::Vec3 },
}

#[derive(Clone, Copy, Debug)]
struct Primitive {
    geometry_index: u32,
    primitive_index: u32,
    shape: Shape,
}

#[derive(Clone, Debug)]
struct TopInstance {
    transform: [f32; 12],
    custom_index: u32,
    mask: u8,
    blas: AccelerationStructure,
    primitives: Arc<[Primitive]>,
}

#[derive(Clone, Debug, Default)]
enum Content {
    #[default]
    Empty,
    Bottom(Arc<[Primitive]>),
    Top(Arc<[TopInstance]>),
}

struct BufferEntry {
    id: u64,
    name: String,
    data: Vec<u8>,
    address: u64,
}

struct StructureEntry {
    id: u64,
    name: String,
    ty: crate::AccelerationStructureType,
    size: u64,
    address: u64,
    flags: crate::AccelerationStructureFlags,
    compacted_size: u64,
    compacted: bool,
    content: Content,
}

struct PoolEntry {
    id: u64,
    results: Vec<Option<u64>>,
}

#[derive(Default)]
struct State {
    buffers: slab::Slab<BufferEntry>,
    structures: slab::Slab<StructureEntry>,
    query_pools: slab::Slab<PoolEntry>,
    structure_addresses: HashMap<u64, AccelerationStructure>,
    next_id: u64,
    next_address: u64,
    faults: Vec<Fault>,
    submission_count: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|&f| f == fault) {
            Some(index) => {
                self.faults.remove(index);
                log::debug!("Triggering injected fault {:?}", fault);
                true
            }
            None => false,
        }
    }

    fn buffer(&self, handle: Buffer) -> &BufferEntry {
        match self.buffers.get(handle.key) {
            Some(entry) if entry.id == handle.id => entry,
            _ => panic!("Stale buffer handle {:?}", handle),
        }
    }

    fn buffer_mut(&mut self, handle: Buffer) -> &mut BufferEntry {
        match self.buffers.get_mut(handle.key) {
            Some(entry) if entry.id == handle.id => entry,
            _ => panic!("Stale buffer handle {:?}", handle),
        }
    }

    fn structure(&self, handle: AccelerationStructure) -> &StructureEntry {
        match self.structures.get(handle.key) {
            Some(entry) if entry.id == handle.id => entry,
            _ => panic!("Stale acceleration structure handle {:?}", handle),
        }
    }

    fn structure_mut(&mut self, handle: AccelerationStructure) -> &mut StructureEntry {
        match self.structures.get_mut(handle.key) {
            Some(entry) if entry.id == handle.id => entry,
            _ => panic!("Stale acceleration structure handle {:?}", handle),
        }
    }

    fn is_alive(&self, handle: AccelerationStructure) -> bool {
        match self.structures.get(handle.key) {
            Some(entry) => entry.id == handle.id,
            None => false,
        }
    }

    /// Borrow `size` bytes at `piece`, failing if the range is out of bounds.
    fn bytes(&self, piece: BufferPiece, size: u64) -> Result<&[u8], crate::DeviceError> {
        let entry = self.buffer(piece.buffer);
        let end = piece.offset + size;
        if end > entry.data.len() as u64 {
            return Err(crate::DeviceError::Validation(format!(
                "range {}..{} is outside of buffer '{}' of size {}",
                piece.offset,
                end,
                entry.name,
                entry.data.len()
            )));
        }
        Ok(&entry.data[piece.offset as usize..end as usize])
    }
}

/// Software device context.
pub struct Context {
    state: Mutex<State>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_address: ADDRESS_BASE,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make the next operation of the given kind fail.
    pub fn inject_fault(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Number of buffers currently alive.
    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Number of acceleration structures currently alive.
    pub fn acceleration_structure_count(&self) -> usize {
        self.lock().structures.len()
    }

    /// Number of primitives (bottom level) or instances (top level) in
    /// the last build of a structure.
    pub fn acceleration_structure_element_count(
        &self,
        acceleration_structure: AccelerationStructure,
    ) -> Option<usize> {
        match self.lock().structure(acceleration_structure).content {
            Content::Empty => None,
            Content::Bottom(ref primitives) => Some(primitives.len()),
            Content::Top(ref instances) => Some(instances.len()),
        }
    }

    pub fn is_compacted(&self, acceleration_structure: AccelerationStructure) -> bool {
        self.lock().structure(acceleration_structure).compacted
    }

    pub fn submission_count(&self) -> u64 {
        self.lock().submission_count
    }
}
