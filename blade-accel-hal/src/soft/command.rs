use std::{mem, ops::Range, sync::Arc};

use super::{
    resource, AccelerationStructure, Buffer, BufferPiece, Content, Primitive, QueryPool, Shape,
    State, TopInstance,
};
use crate::{
    AccelerationStructureFlags as Flags, AccelerationStructureGeometry as Geometry,
    AccelerationStructureType, BuildMode, DeviceError,
};

#[derive(Debug)]
enum Command {
    BuildBottomLevel {
        dst: AccelerationStructure,
        geometries: Vec<Geometry<Buffer>>,
        flags: Flags,
        mode: BuildMode,
        scratch: BufferPiece,
    },
    BuildTopLevel {
        dst: AccelerationStructure,
        instance_count: u32,
        instance_data: BufferPiece,
        flags: Flags,
        mode: BuildMode,
        scratch: BufferPiece,
    },
    WriteCompactedSizes {
        structures: Vec<AccelerationStructure>,
        pool: QueryPool,
        first_query: u32,
    },
    CopyCompacted {
        src: AccelerationStructure,
        dst: AccelerationStructure,
    },
    Barrier,
}

pub struct CommandEncoder {
    name: String,
    commands: Vec<Command>,
}

impl crate::AccelerationStructureEncoder for CommandEncoder {
    type Buffer = Buffer;
    type AccelerationStructure = AccelerationStructure;
    type QueryPool = QueryPool;

    fn start(&mut self) {
        self.commands.clear();
    }

    fn build_bottom_level(
        &mut self,
        acceleration_structure: AccelerationStructure,
        geometries: &[Geometry<Buffer>],
        flags: Flags,
        mode: BuildMode,
        scratch_data: BufferPiece,
    ) {
        self.commands.push(Command::BuildBottomLevel {
            dst: acceleration_structure,
            geometries: geometries.to_vec(),
            flags,
            mode,
            scratch: scratch_data,
        });
    }

    fn build_top_level(
        &mut self,
        acceleration_structure: AccelerationStructure,
        instance_count: u32,
        instance_data: BufferPiece,
        flags: Flags,
        mode: BuildMode,
        scratch_data: BufferPiece,
    ) {
        self.commands.push(Command::BuildTopLevel {
            dst: acceleration_structure,
            instance_count,
            instance_data,
            flags,
            mode,
            scratch: scratch_data,
        });
    }

    fn write_compacted_sizes(
        &mut self,
        acceleration_structures: &[AccelerationStructure],
        pool: QueryPool,
        first_query: u32,
    ) {
        self.commands.push(Command::WriteCompactedSizes {
            structures: acceleration_structures.to_vec(),
            pool,
            first_query,
        });
    }

    fn copy_compacted(&mut self, src: AccelerationStructure, dst: AccelerationStructure) {
        self.commands.push(Command::CopyCompacted { src, dst });
    }

    fn barrier(&mut self) {
        self.commands.push(Command::Barrier);
    }
}

/// Resources touched since the last barrier.
#[derive(Default)]
struct Hazards {
    scratch: Vec<(Buffer, Range<u64>)>,
    written: Vec<AccelerationStructure>,
}

impl Hazards {
    fn use_scratch(&mut self, piece: BufferPiece, size: u64) -> Result<(), DeviceError> {
        let range = piece.offset..piece.offset + size;
        let overlaps = self
            .scratch
            .iter()
            .any(|&(buffer, ref r)| buffer == piece.buffer && r.start < range.end && range.start < r.end);
        if overlaps {
            return Err(DeviceError::Validation(
                "scratch region reused without a barrier".to_string(),
            ));
        }
        self.scratch.push((piece.buffer, range));
        Ok(())
    }

    fn read(&self, acceleration_structure: AccelerationStructure) -> Result<(), DeviceError> {
        if self.written.contains(&acceleration_structure) {
            return Err(DeviceError::Validation(format!(
                "{:?} is read in the same scope it was built",
                acceleration_structure
            )));
        }
        Ok(())
    }
}

fn read_vec3(bytes: &[u8]) -> glam::Vec3 {
    glam::Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(&bytes[..12]))
}

fn affine_from_rows(r: &[f32; 12]) -> glam::Affine3A {
    glam::Affine3A::from_cols(
        glam::Vec3A::new(r[0], r[4], r[8]),
        glam::Vec3A::new(r[1], r[5], r[9]),
        glam::Vec3A::new(r[2], r[6], r[10]),
        glam::Vec3A::new(r[3], r[7], r[11]),
    )
}

fn read_primitives(
    state: &State,
    geometries: &[Geometry<Buffer>],
) -> Result<Vec<Primitive>, DeviceError> {
    let mut primitives = Vec::new();
    for (geometry_index, geometry) in geometries.iter().enumerate() {
        match *geometry {
            Geometry::Triangles(ref mesh) => {
                let stride = mesh.vertex_stride as u64;
                let vertex_bytes = state.bytes(
                    mesh.vertex_data,
                    (mesh.vertex_count as u64).saturating_sub(1) * stride + 12,
                )?;
                let transform = match mesh.transform_data {
                    Some(piece) => {
                        let bytes = state.bytes(piece, 48)?;
                        affine_from_rows(&bytemuck::pod_read_unaligned(bytes))
                    }
                    None => glam::Affine3A::IDENTITY,
                };
                let index_count = mesh.triangle_count as u64 * 3;
                let indices = match mesh.index_type {
                    Some(index_type) => {
                        let bytes = state.bytes(mesh.index_data, index_count * index_type.size())?;
                        match index_type {
                            crate::IndexType::U16 => bytes
                                .chunks_exact(2)
                                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                                .collect::<Vec<_>>(),
                            crate::IndexType::U32 => bytes
                                .chunks_exact(4)
                                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                                .collect::<Vec<_>>(),
                        }
                    }
                    None => (0..index_count as u32).collect(),
                };
                for (primitive_index, tri) in indices.chunks_exact(3).enumerate() {
                    let mut vertices = [glam::Vec3::ZERO; 3];
                    for (v, &index) in vertices.iter_mut().zip(tri) {
                        if index >= mesh.vertex_count {
                            return Err(DeviceError::InvalidGeometry(format!(
                                "index {} is out of {} vertices",
                                index, mesh.vertex_count
                            )));
                        }
                        let offset = (index as u64 * stride) as usize;
                        *v = transform.transform_point3(read_vec3(&vertex_bytes[offset..]));
                    }
                    primitives.push(Primitive {
                        geometry_index: geometry_index as u32,
                        primitive_index: primitive_index as u32,
                        shape: Shape::Triangle(vertices),
                    });
                }
            }
            Geometry::Aabbs(ref aabbs) => {
                let stride = aabbs.stride as u64;
                let size = match aabbs.count {
                    0 => 0,
                    count => (count as u64 - 1) * stride + size_of::<crate::Aabb>() as u64,
                };
                let bytes = state.bytes(aabbs.data, size)?;
                for primitive_index in 0..aabbs.count {
                    let offset = (primitive_index as u64 * stride) as usize;
                    let aabb: crate::Aabb = bytemuck::pod_read_unaligned(
                        &bytes[offset..offset + size_of::<crate::Aabb>()],
                    );
                    primitives.push(Primitive {
                        geometry_index: geometry_index as u32,
                        primitive_index,
                        shape: Shape::Aabb {
                            min: glam::Vec3::from_array(aabb.min),
                            max: glam::Vec3::from_array(aabb.max),
                        },
                    });
                }
            }
        }
    }
    Ok(primitives)
}

fn check_destination(
    state: &State,
    dst: AccelerationStructure,
    ty: AccelerationStructureType,
    required_size: u64,
    mode: BuildMode,
    element_count: usize,
) -> Result<(), DeviceError> {
    let entry = state.structure(dst);
    if entry.ty != ty {
        return Err(DeviceError::Validation(format!(
            "'{}' is not a {:?} structure",
            entry.name, ty
        )));
    }
    if entry.size < required_size {
        return Err(DeviceError::Validation(format!(
            "'{}' has {} bytes, but the build needs {}",
            entry.name, entry.size, required_size
        )));
    }
    if mode == BuildMode::Update {
        if !entry.flags.contains(Flags::ALLOW_UPDATE) {
            return Err(DeviceError::Validation(format!(
                "'{}' was not built with ALLOW_UPDATE",
                entry.name
            )));
        }
        let previous_count = match entry.content {
            Content::Empty => None,
            Content::Bottom(ref primitives) => Some(primitives.len()),
            Content::Top(ref instances) => Some(instances.len()),
        };
        if previous_count != Some(element_count) {
            return Err(DeviceError::Validation(format!(
                "update of '{}' changes its element count from {:?} to {}",
                entry.name, previous_count, element_count
            )));
        }
    }
    Ok(())
}

fn check_scratch(state: &State, scratch: BufferPiece, size: u64) -> Result<(), DeviceError> {
    state.bytes(scratch, size).map(|_| ()).map_err(|_| {
        DeviceError::Validation(format!(
            "scratch at offset {} is smaller than the required {} bytes",
            scratch.offset, size
        ))
    })
}

fn execute(state: &mut State, hazards: &mut Hazards, command: Command) -> Result<(), DeviceError> {
    match command {
        Command::BuildBottomLevel {
            dst,
            geometries,
            flags,
            mode,
            scratch,
        } => {
            let primitives = read_primitives(state, &geometries)?;
            let count = primitives.len() as u64;
            let sizes = resource::bottom_level_sizes(count, flags);
            let scratch_size = match mode {
                BuildMode::Build => sizes.scratch,
                BuildMode::Update => sizes.update_scratch,
            };
            check_scratch(state, scratch, scratch_size)?;
            check_destination(
                state,
                dst,
                AccelerationStructureType::BottomLevel,
                sizes.data,
                mode,
                primitives.len(),
            )?;
            hazards.use_scratch(scratch, scratch_size)?;
            hazards.written.push(dst);
            let entry = state.structure_mut(dst);
            entry.flags = flags;
            entry.compacted_size = resource::bottom_level_compacted_size(count, flags);
            entry.content = Content::Bottom(primitives.into());
        }
        Command::BuildTopLevel {
            dst,
            instance_count,
            instance_data,
            flags,
            mode,
            scratch,
        } => {
            let bytes = state.bytes(instance_data, instance_count as u64 * crate::InstanceDesc::SIZE)?;
            let descs = bytes
                .chunks_exact(crate::InstanceDesc::SIZE as usize)
                .map(bytemuck::pod_read_unaligned::<crate::InstanceDesc>)
                .collect::<Vec<_>>();
            let mut instances = Vec::with_capacity(descs.len());
            for (index, desc) in descs.iter().enumerate() {
                let blas = match state
                    .structure_addresses
                    .get(&desc.acceleration_structure_reference)
                {
                    Some(&blas) => blas,
                    None => {
                        return Err(DeviceError::Validation(format!(
                            "instance {} references unknown address {:#x}",
                            index, desc.acceleration_structure_reference
                        )))
                    }
                };
                hazards.read(blas)?;
                let primitives = match state.structure(blas).content {
                    Content::Bottom(ref primitives) => Arc::clone(primitives),
                    _ => {
                        return Err(DeviceError::Validation(format!(
                            "instance {} references a structure that is not a built bottom level",
                            index
                        )))
                    }
                };
                instances.push(TopInstance {
                    transform: desc.transform,
                    custom_index: desc.custom_index(),
                    mask: desc.mask(),
                    blas,
                    primitives,
                });
            }
            let sizes = resource::top_level_sizes(instance_count as u64, flags);
            let scratch_size = match mode {
                BuildMode::Build => sizes.scratch,
                BuildMode::Update => sizes.update_scratch,
            };
            check_scratch(state, scratch, scratch_size)?;
            check_destination(
                state,
                dst,
                AccelerationStructureType::TopLevel,
                sizes.data,
                mode,
                instances.len(),
            )?;
            hazards.use_scratch(scratch, scratch_size)?;
            hazards.written.push(dst);
            let entry = state.structure_mut(dst);
            entry.flags = flags;
            entry.content = Content::Top(instances.into());
        }
        Command::WriteCompactedSizes {
            structures,
            pool,
            first_query,
        } => {
            let mut sizes = Vec::with_capacity(structures.len());
            for &handle in structures.iter() {
                hazards.read(handle)?;
                let entry = state.structure(handle);
                if !entry.flags.contains(Flags::ALLOW_COMPACTION) {
                    return Err(DeviceError::Validation(format!(
                        "'{}' was not built with ALLOW_COMPACTION",
                        entry.name
                    )));
                }
                if let Content::Empty = entry.content {
                    return Err(DeviceError::Validation(format!(
                        "'{}' has not been built",
                        entry.name
                    )));
                }
                sizes.push(entry.compacted_size);
            }
            let entry = match state.query_pools.get_mut(pool.key) {
                Some(entry) if entry.id == pool.id => entry,
                _ => panic!("Stale query pool handle {:?}", pool),
            };
            let start = first_query as usize;
            if start + sizes.len() > entry.results.len() {
                return Err(DeviceError::Validation(
                    "query pool is too small".to_string(),
                ));
            }
            for (slot, size) in entry.results[start..].iter_mut().zip(sizes) {
                *slot = Some(size);
            }
        }
        Command::CopyCompacted { src, dst } => {
            hazards.read(src)?;
            let (ty, flags, compacted_size, content) = {
                let entry = state.structure(src);
                if !entry.flags.contains(Flags::ALLOW_COMPACTION) {
                    return Err(DeviceError::Validation(format!(
                        "'{}' was not built with ALLOW_COMPACTION",
                        entry.name
                    )));
                }
                (
                    entry.ty,
                    entry.flags,
                    entry.compacted_size,
                    entry.content.clone(),
                )
            };
            let entry = state.structure_mut(dst);
            if entry.ty != ty || entry.size < compacted_size {
                return Err(DeviceError::Validation(format!(
                    "'{}' cannot hold a compacted copy of {} bytes",
                    entry.name, compacted_size
                )));
            }
            entry.flags = flags;
            entry.compacted_size = compacted_size;
            entry.compacted = true;
            entry.content = content;
            hazards.written.push(dst);
        }
        Command::Barrier => {
            *hazards = Hazards::default();
        }
    }
    Ok(())
}

impl crate::CommandDevice for super::Context {
    type CommandEncoder = CommandEncoder;
    type SyncPoint = super::SyncPoint;

    fn create_command_encoder(&self, desc: crate::CommandEncoderDesc) -> CommandEncoder {
        CommandEncoder {
            name: desc.name.to_string(),
            commands: Vec::new(),
        }
    }

    fn destroy_command_encoder(&self, encoder: &mut CommandEncoder) {
        encoder.commands.clear();
    }

    fn submit(&self, encoder: &mut CommandEncoder) -> Result<super::SyncPoint, DeviceError> {
        let commands = mem::take(&mut encoder.commands);
        let mut state = self.lock();
        if state.take_fault(super::Fault::Submit) {
            return Err(DeviceError::Lost);
        }
        state.submission_count += 1;
        let index = state.submission_count;
        log::trace!(
            "Executing '{}' with {} commands as submission {}",
            encoder.name,
            commands.len(),
            index
        );
        let mut hazards = Hazards::default();
        for command in commands {
            execute(&mut state, &mut hazards, command)?;
        }
        Ok(super::SyncPoint { index })
    }

    fn wait_for(&self, sp: &super::SyncPoint, _timeout_ms: u32) -> bool {
        // Submissions are executed eagerly.
        sp.index <= self.lock().submission_count
    }
}
