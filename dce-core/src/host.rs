//! Data-parallel CPU backend.
//!
//! Mirrors the kernel one invocation per event using rayon. The output arena
//! is a pre-sized array of atomic words with a single atomic cursor; the
//! floating-point sums are compare-and-swap loops over the bit pattern, the
//! same scheme the WGSL kernel uses.

use crate::shutter::{BackendError, ComputeBackend, Counters, KernelParams, WORKGROUP_SIZE};
use crate::types::Event;
use rayon::prelude::*;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use tracing::debug;

/// Runs exposures on the rayon thread pool.
#[derive(Debug, Default)]
pub struct HostBackend {
    events: Option<Vec<Event>>,
    points: Vec<[AtomicU32; 3]>,
    counters: [AtomicU32; 3],
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn upload(&mut self, events: &[Event]) -> Result<(), BackendError> {
        if self.points.len() != events.len() {
            debug!(len = events.len(), "allocating host output arena");
            self.points = (0..events.len()).map(|_| Default::default()).collect();
        }
        let input = self.events.get_or_insert_with(Vec::new);
        input.clear();
        input.extend_from_slice(events);
        Ok(())
    }

    fn dispatch(&mut self, params: &KernelParams, workgroups: u32) -> Result<(), BackendError> {
        let events = self.events.as_deref().ok_or(BackendError::NotUploaded)?;
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }

        let invocations = workgroups as usize * WORKGROUP_SIZE as usize;
        let start = params.event_bound_l as usize;
        let end = (params.event_bound_r as usize)
            .saturating_add(1)
            .min(events.len())
            .min(invocations);
        if start >= end {
            return Ok(());
        }

        let points = &self.points;
        let [count, sum_x, sum_y] = &self.counters;
        events[start..end].par_iter().for_each(|event| {
            if !params.admits(event) {
                return;
            }
            let slot = count.fetch_add(1, Ordering::Relaxed) as usize;
            let weight = params.weight(event.t);
            for (cell, value) in points[slot].iter().zip([event.x, event.y, weight]) {
                cell.store(value.to_bits(), Ordering::Relaxed);
            }
            atomic_add_f32(sum_x, event.x);
            atomic_add_f32(sum_y, event.y);
        });
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), BackendError> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn read_counters(&mut self) -> Result<Counters, BackendError> {
        if self.events.is_none() {
            return Err(BackendError::NotUploaded);
        }
        let [count, sum_x, sum_y] = &self.counters;
        Ok(Counters {
            count: count.load(Ordering::Acquire),
            sum_x: f32::from_bits(sum_x.load(Ordering::Acquire)),
            sum_y: f32::from_bits(sum_y.load(Ordering::Acquire)),
        })
    }

    fn read_points(&mut self, count: u32) -> Result<Vec<[f32; 3]>, BackendError> {
        if self.events.is_none() {
            return Err(BackendError::NotUploaded);
        }
        let count = (count as usize).min(self.points.len());
        Ok(self.points[..count]
            .iter()
            .map(|cells| cells.each_ref().map(|c| f32::from_bits(c.load(Ordering::Acquire))))
            .collect())
    }

    fn release(&mut self) {
        self.events = None;
        self.points = Vec::new();
    }
}

/// Adds `value` to the f32 stored as bits in `cell`.
fn atomic_add_f32(cell: &AtomicU32, value: f32) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f32::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(l: u32, r: u32) -> KernelParams {
        KernelParams {
            space_window: [f32::MIN, f32::MAX, f32::MAX, f32::MIN],
            event_bound_l: l,
            event_bound_r: r,
            base_contribution: 2.0,
            ..KernelParams::default()
        }
    }

    #[test]
    fn test_atomic_add_under_contention() {
        let cell = AtomicU32::new(0f32.to_bits());
        (0..10_000).into_par_iter().for_each(|_| atomic_add_f32(&cell, 1.0));
        assert_eq!(f32::from_bits(cell.load(Ordering::SeqCst)), 10_000.0);
    }

    #[test]
    fn test_every_admitted_event_emitted_once() {
        let events: Vec<Event> = (0..5000)
            .map(|i| Event::new((i % 100) as f32, (i / 100) as f32, i as f32, i % 3 == 0))
            .collect();
        let mut backend = HostBackend::new();
        backend.upload(&events).unwrap();
        backend.dispatch(&params(0, 4999), 20).unwrap();
        backend.barrier().unwrap();

        let counters = backend.read_counters().unwrap();
        assert_eq!(counters.count, 5000);
        let mut ts: Vec<u32> = backend
            .read_points(counters.count)
            .unwrap()
            .iter()
            .map(|p| {
                assert_eq!(p[2], 2.0);
                (p[1] * 100.0 + p[0]) as u32
            })
            .collect();
        ts.sort_unstable();
        assert_eq!(ts, (0..5000).collect::<Vec<u32>>());
    }

    #[test]
    fn test_dispatch_resets_counters() {
        let events = vec![Event::new(1.0, 2.0, 0.0, true); 8];
        let mut backend = HostBackend::new();
        backend.upload(&events).unwrap();
        backend.dispatch(&params(0, 7), 1).unwrap();
        backend.dispatch(&params(2, 3), 1).unwrap();
        let counters = backend.read_counters().unwrap();
        assert_eq!(counters.count, 2);
        assert_eq!(counters.sum_x, 2.0);
        assert_eq!(counters.sum_y, 4.0);
    }

    #[test]
    fn test_dispatch_without_upload() {
        let mut backend = HostBackend::new();
        assert_eq!(
            backend.dispatch(&params(0, 0), 1),
            Err(BackendError::NotUploaded)
        );
    }
}
