use blade_accel_hal::{self as hal, AccelerationStructureEncoder as _};

/// Acceleration structure together with the buffer backing it.
///
/// Not copyable: whoever holds the value is responsible for passing it
/// to [`AccelerationStructure::destroy`].
pub struct AccelerationStructure<D: hal::ResourceDevice> {
    raw: D::AccelerationStructure,
    buffer: D::Buffer,
    size: u64,
    device_address: u64,
    compacted: bool,
}

impl<D: hal::ResourceDevice> AccelerationStructure<D> {
    pub(crate) fn create(
        gpu: &D,
        name: &str,
        ty: hal::AccelerationStructureType,
        size: u64,
    ) -> Result<Self, hal::DeviceError> {
        let buffer = gpu.create_buffer(hal::BufferDesc {
            name,
            size,
            memory: hal::Memory::Device,
        })?;
        let raw = match gpu.create_acceleration_structure(hal::AccelerationStructureDesc {
            name,
            ty,
            buffer: buffer.into(),
            size,
        }) {
            Ok(raw) => raw,
            Err(e) => {
                gpu.destroy_buffer(buffer);
                return Err(e);
            }
        };
        Ok(Self {
            raw,
            buffer,
            size,
            device_address: gpu.acceleration_structure_device_address(raw),
            compacted: false,
        })
    }

    pub(crate) fn into_compacted(self) -> Self {
        Self {
            compacted: true,
            ..self
        }
    }

    pub(crate) fn destroy(self, gpu: &D) {
        gpu.destroy_acceleration_structure(self.raw);
        gpu.destroy_buffer(self.buffer);
    }

    pub fn raw(&self) -> D::AccelerationStructure {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted
    }
}

/// Record commands into a single-use encoder, submit them and wait.
pub(crate) fn one_off<D: hal::CommandDevice>(
    gpu: &D,
    name: &str,
    record: impl FnOnce(&mut D::CommandEncoder),
) -> Result<(), hal::DeviceError> {
    let mut encoder = gpu.create_command_encoder(hal::CommandEncoderDesc {
        name,
        buffer_count: 1,
    });
    encoder.start();
    record(&mut encoder);
    let result = gpu.submit(&mut encoder).and_then(|sync_point| {
        if gpu.wait_for(&sync_point, !0) {
            Ok(())
        } else {
            Err(hal::DeviceError::Lost)
        }
    });
    gpu.destroy_command_encoder(&mut encoder);
    result
}
