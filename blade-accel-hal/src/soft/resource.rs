use crate::{
    AccelerationStructureFlags as Flags, AccelerationStructureGeometry as Geometry,
    AccelerationStructureSizes, DeviceError,
};

fn align(size: u64) -> u64 {
    size.next_multiple_of(super::ALIGNMENT)
}

pub(super) fn bottom_level_sizes(primitive_count: u64, flags: Flags) -> AccelerationStructureSizes {
    let node_size = if flags.contains(Flags::PREFER_FAST_BUILD) {
        48
    } else {
        64
    };
    let scratch_size = if flags.contains(Flags::PREFER_FAST_BUILD) {
        24
    } else {
        32
    };
    AccelerationStructureSizes {
        data: align(256 + primitive_count * (node_size + refit_size(flags))),
        scratch: align(128 + primitive_count * scratch_size),
        update_scratch: align(64 + primitive_count * 8),
    }
}

/// Size of a bottom-level structure after compaction. Never exceeds
/// the uncompacted size.
pub(super) fn bottom_level_compacted_size(primitive_count: u64, flags: Flags) -> u64 {
    align(256 + primitive_count * (40 + refit_size(flags)))
}

pub(super) fn top_level_sizes(instance_count: u64, _flags: Flags) -> AccelerationStructureSizes {
    AccelerationStructureSizes {
        data: align(256 + instance_count * 64),
        scratch: align(128 + instance_count * 16),
        update_scratch: align(64 + instance_count * 8),
    }
}

fn refit_size(flags: Flags) -> u64 {
    if flags.contains(Flags::ALLOW_UPDATE) {
        16
    } else {
        0
    }
}

fn check_geometry(geometry: &Geometry<super::Buffer>) -> Result<(), DeviceError> {
    match *geometry {
        Geometry::Triangles(ref mesh) => {
            if mesh.vertex_stride < 12 {
                return Err(DeviceError::InvalidGeometry(format!(
                    "vertex stride {} is too small",
                    mesh.vertex_stride
                )));
            }
            if mesh.index_type.is_none() && mesh.vertex_count < mesh.triangle_count * 3 {
                return Err(DeviceError::InvalidGeometry(format!(
                    "{} non-indexed triangles need more than {} vertices",
                    mesh.triangle_count, mesh.vertex_count
                )));
            }
        }
        Geometry::Aabbs(ref aabbs) => {
            if (aabbs.stride as usize) < size_of::<crate::Aabb>() {
                return Err(DeviceError::InvalidGeometry(format!(
                    "AABB stride {} is too small",
                    aabbs.stride
                )));
            }
        }
    }
    Ok(())
}

impl crate::ResourceDevice for super::Context {
    type Buffer = super::Buffer;
    type AccelerationStructure = super::AccelerationStructure;

    fn create_buffer(&self, desc: crate::BufferDesc) -> Result<super::Buffer, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(super::Fault::OutOfMemory) {
            return Err(DeviceError::OutOfMemory);
        }
        let id = state.next_id();
        let address = state.next_address;
        state.next_address += align(desc.size.max(1));
        let key = state.buffers.insert(super::BufferEntry {
            id,
            name: desc.name.to_string(),
            data: vec![0; desc.size as usize],
            address,
        });
        Ok(super::Buffer { key, id })
    }

    fn destroy_buffer(&self, buffer: super::Buffer) {
        let mut state = self.lock();
        let _ = state.buffer(buffer);
        state.buffers.remove(buffer.key);
    }

    fn write_buffer(&self, dst: super::BufferPiece, data: &[u8]) {
        let mut state = self.lock();
        let entry = state.buffer_mut(dst.buffer);
        let start = dst.offset as usize;
        entry.data[start..start + data.len()].copy_from_slice(data);
    }

    fn read_buffer(&self, src: super::BufferPiece, data: &mut [u8]) {
        let state = self.lock();
        let entry = state.buffer(src.buffer);
        let start = src.offset as usize;
        data.copy_from_slice(&entry.data[start..start + data.len()]);
    }

    fn buffer_device_address(&self, buffer: super::Buffer) -> u64 {
        self.lock().buffer(buffer).address
    }

    fn get_bottom_level_acceleration_structure_sizes(
        &self,
        geometries: &[Geometry<super::Buffer>],
        flags: Flags,
    ) -> Result<AccelerationStructureSizes, DeviceError> {
        if self.lock().take_fault(super::Fault::SizeQuery) {
            return Err(DeviceError::Lost);
        }
        for geometry in geometries {
            check_geometry(geometry)?;
        }
        let primitive_count = geometries
            .iter()
            .map(|g| g.primitive_count() as u64)
            .sum::<u64>();
        Ok(bottom_level_sizes(primitive_count, flags))
    }

    fn get_top_level_acceleration_structure_sizes(
        &self,
        instance_count: u32,
        flags: Flags,
    ) -> Result<AccelerationStructureSizes, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(super::Fault::SizeQuery)
            || state.take_fault(super::Fault::TopLevelSizeQuery)
        {
            return Err(DeviceError::Lost);
        }
        Ok(top_level_sizes(instance_count as u64, flags))
    }

    fn create_acceleration_structure(
        &self,
        desc: crate::AccelerationStructureDesc<super::Buffer>,
    ) -> Result<super::AccelerationStructure, DeviceError> {
        let mut state = self.lock();
        let (buffer_size, buffer_address) = {
            let entry = state.buffer(desc.buffer.buffer);
            (entry.data.len() as u64, entry.address)
        };
        if desc.buffer.offset + desc.size > buffer_size {
            return Err(DeviceError::Validation(format!(
                "structure '{}' of size {} does not fit into its buffer",
                desc.name, desc.size
            )));
        }
        let id = state.next_id();
        let address = buffer_address + desc.buffer.offset;
        let key = state.structures.insert(super::StructureEntry {
            id,
            name: desc.name.to_string(),
            ty: desc.ty,
            size: desc.size,
            address,
            flags: Flags::empty(),
            compacted_size: 0,
            compacted: false,
            content: super::Content::Empty,
        });
        let handle = super::AccelerationStructure { key, id };
        state.structure_addresses.insert(address, handle);
        Ok(handle)
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: super::AccelerationStructure) {
        let mut state = self.lock();
        let address = state.structure(acceleration_structure).address;
        state.structure_addresses.remove(&address);
        state.structures.remove(acceleration_structure.key);
    }

    fn acceleration_structure_device_address(
        &self,
        acceleration_structure: super::AccelerationStructure,
    ) -> u64 {
        self.lock().structure(acceleration_structure).address
    }
}

#[test]
fn compacted_never_larger() {
    for flags in [
        Flags::PREFER_FAST_TRACE,
        Flags::PREFER_FAST_BUILD,
        Flags::PREFER_FAST_TRACE | Flags::ALLOW_UPDATE,
        Flags::PREFER_FAST_BUILD | Flags::ALLOW_UPDATE,
    ] {
        for count in [0, 1, 7, 1000] {
            let sizes = bottom_level_sizes(count, flags);
            assert!(bottom_level_compacted_size(count, flags) <= sizes.data);
        }
    }
}
