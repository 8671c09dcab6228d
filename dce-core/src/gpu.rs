//! wgpu compute backend.
//!
//! Buffers: the event array as read-only `vec4<f32>` storage, an output
//! arena of `(x, y, weight)` triples sized to the input, three atomic
//! counter words `(count, sum_x bits, sum_y bits)` and a 48-byte uniform
//! block. Large inputs are dispatched over a 2D grid because a single
//! dimension is limited to 65535 workgroups.

#![cfg(feature = "gpu")]

use crate::shutter::{BackendError, ComputeBackend, Counters, KernelParams};
use crate::types::Event;
use bytemuck::cast_slice;
use pollster::block_on;
use tracing::{debug, info};

const EXPOSURE_WGSL: &str = r#"
struct Params {
    space_window: vec4<f32>,
    event_bound_l: u32,
    event_bound_r: u32,
    is_positive_only: u32,
    use_morlet: u32,
    morlet_freq: f32,
    morlet_center_t: f32,
    morlet_h: f32,
    base_contribution: f32,
};

struct OutPoint {
    x: f32,
    y: f32,
    w: f32,
};

@group(0) @binding(0) var<storage, read> events: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> points: array<OutPoint>;
@group(0) @binding(2) var<storage, read_write> counters: array<atomic<u32>, 3>;
@group(0) @binding(3) var<uniform> params: Params;

const PI: f32 = 3.14159265358979;
const LN_2: f32 = 0.69314718055994;

fn add_f32(slot: u32, value: f32) {
    var old = atomicLoad(&counters[slot]);
    loop {
        let next = bitcast<u32>(bitcast<f32>(old) + value);
        let result = atomicCompareExchangeWeak(&counters[slot], old, next);
        if (result.exchanged) {
            break;
        }
        old = result.old_value;
    }
}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let idx = gid.x + gid.y * groups.x * 256u;
    if (idx < params.event_bound_l || idx > params.event_bound_r || idx >= arrayLength(&events)) {
        return;
    }

    let e = events[idx];
    // space_window = (top, right, bottom, left)
    let sw = params.space_window;
    if (e.x < sw.w || e.x > sw.y || e.y < sw.x || e.y > sw.z) {
        return;
    }
    if (params.is_positive_only != 0u && e.w < 0.5) {
        return;
    }

    var weight = params.base_contribution;
    if (params.use_morlet != 0u) {
        let dt = e.z - params.morlet_center_t;
        let h = params.morlet_h;
        weight = cos(2.0 * PI * params.morlet_freq * dt) * exp(-4.0 * LN_2 * dt * dt / (h * h));
    }

    let slot = atomicAdd(&counters[0], 1u);
    points[slot] = OutPoint(e.x, e.y, weight);
    add_f32(1u, e.x);
    add_f32(2u, e.y);
}
"#;

const EVENT_BYTES: u64 = std::mem::size_of::<Event>() as u64;
const POINT_BYTES: u64 = 12;
const COUNTER_BYTES: u64 = 12;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Buffers sized for one input length.
struct GpuBuffers {
    len: usize,
    events: wgpu::Buffer,
    points: wgpu::Buffer,
    counters: wgpu::Buffer,
    staging: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// Runs exposures on the default wgpu adapter.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    buffers: Option<GpuBuffers>,
    adapter_name: String,
}

impl WgpuBackend {
    /// Acquires an adapter and device and builds the exposure kernel.
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .ok_or(BackendError::NoAdapter)?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("dce.device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|err| BackendError::RequestDevice(err.to_string()))?;

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dce.exposure.layout"),
            entries: &[
                storage(0, true),
                storage(1, false),
                storage(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("dce.exposure.pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("dce.exposure.shader"),
            source: wgpu::ShaderSource::Wgsl(EXPOSURE_WGSL.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("dce.exposure.pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
            compilation_options: Default::default(),
        });
        if let Some(err) = block_on(device.pop_error_scope()) {
            return Err(BackendError::KernelBuild(err.to_string()));
        }

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dce.exposure.params"),
            size: std::mem::size_of::<KernelParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        info!(adapter = %adapter_name, "initialised GPU backend");
        Ok(Self {
            device,
            queue,
            pipeline,
            layout,
            params,
            buffers: None,
            adapter_name,
        })
    }

    /// Name of the adapter the device was created on.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn allocate(&self, len: usize) -> Result<GpuBuffers, BackendError> {
        let event_bytes = (len as u64 * EVENT_BYTES).max(EVENT_BYTES);
        let point_bytes = (len as u64 * POINT_BYTES).max(POINT_BYTES);
        let limit = self.device.limits().max_storage_buffer_binding_size as u64;
        if event_bytes > limit {
            return Err(BackendError::Dispatch(format!(
                "{} events exceed the {} byte storage binding limit",
                len, limit
            )));
        }

        let buffer = |label: &str, size: u64, usage: wgpu::BufferUsages| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let events = buffer(
            "dce.exposure.events",
            event_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let points = buffer(
            "dce.exposure.points",
            point_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let counters = buffer(
            "dce.exposure.counters",
            COUNTER_BYTES,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );
        let staging = buffer(
            "dce.exposure.staging",
            point_bytes.max(COUNTER_BYTES),
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dce.exposure.bind_group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: events.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: points.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: counters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.params.as_entire_binding(),
                },
            ],
        });

        Ok(GpuBuffers {
            len,
            events,
            points,
            counters,
            staging,
            bind_group,
        })
    }

    /// Copies `bytes` from the start of `source` through the staging buffer
    /// and hands the mapped range to `read`.
    fn read_back<T>(
        &self,
        buffers: &GpuBuffers,
        source: &wgpu::Buffer,
        bytes: u64,
        read: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, BackendError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dce.exposure.readback"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &buffers.staging, 0, bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = buffers.staging.slice(0..bytes);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match receiver.recv().map_err(|_| BackendError::Map)? {
            Ok(()) => {}
            Err(_) => return Err(BackendError::Map),
        }

        let data = slice.get_mapped_range();
        let value = read(&data);
        drop(data);
        buffers.staging.unmap();
        Ok(value)
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn upload(&mut self, events: &[Event]) -> Result<(), BackendError> {
        let reuse = matches!(&self.buffers, Some(b) if b.len == events.len());
        if !reuse {
            debug!(len = events.len(), "allocating GPU exposure buffers");
            self.buffers = Some(self.allocate(events.len())?);
        }
        let buffers = self.buffers.as_ref().ok_or(BackendError::NotUploaded)?;
        if !events.is_empty() {
            self.queue.write_buffer(&buffers.events, 0, cast_slice(events));
        }
        Ok(())
    }

    fn dispatch(&mut self, params: &KernelParams, workgroups: u32) -> Result<(), BackendError> {
        let buffers = self.buffers.as_ref().ok_or(BackendError::NotUploaded)?;
        self.queue.write_buffer(&self.params, 0, cast_slice(&[*params]));

        let groups_x = workgroups.clamp(1, MAX_GROUPS_PER_DIM);
        let groups_y = workgroups.div_ceil(groups_x).max(1);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dce.exposure.encoder"),
            });
        encoder.clear_buffer(&buffers.counters, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("dce.exposure.pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &buffers.bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Dispatch(err.to_string()));
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), BackendError> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_counters(&mut self) -> Result<Counters, BackendError> {
        let buffers = self.buffers.as_ref().ok_or(BackendError::NotUploaded)?;
        self.read_back(buffers, &buffers.counters, COUNTER_BYTES, |data| {
            let words: &[u32] = cast_slice(data);
            Counters {
                count: words[0],
                sum_x: f32::from_bits(words[1]),
                sum_y: f32::from_bits(words[2]),
            }
        })
    }

    fn read_points(&mut self, count: u32) -> Result<Vec<[f32; 3]>, BackendError> {
        let buffers = self.buffers.as_ref().ok_or(BackendError::NotUploaded)?;
        let count = (count as usize).min(buffers.len);
        if count == 0 {
            return Ok(Vec::new());
        }
        self.read_back(buffers, &buffers.points, count as u64 * POINT_BYTES, |data| {
            let floats: &[f32] = cast_slice(data);
            floats.chunks_exact(3).map(|p| [p[0], p[1], p[2]]).collect()
        })
    }

    fn release(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            buffers.events.destroy();
            buffers.points.destroy();
            buffers.counters.destroy();
            buffers.staging.destroy();
        }
    }
}
