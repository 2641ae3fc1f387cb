//! Timer queries over dispatch sequences.
//!
//! One query may be active at a time; nesting is rejected. When the adapter
//! exposes `TIMESTAMP_QUERY`, each dispatch inside the bracket writes a
//! begin/end timestamp pair at its pass boundaries and resolution computes
//! last-end minus first-begin in device ticks. Without the feature (or when a
//! session exceeds the pair budget) the unit degrades to host wall-clock
//! timing and flags the result unreliable instead of failing the computation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use bytemuck::cast_slice;
use futures::channel::oneshot;
use texelflow_api::{ElapsedTime, TexelError, TexelResult};

use crate::config::TIMER_QUERY_PAIR_CAPACITY;
use crate::sync::{FenceRegistry, FenceToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct ActiveQuery {
    token: u64,
    base_index: u32,
    pairs: u32,
    overflowed: bool,
    wall_start: Instant,
    last_fence: Option<FenceToken>,
}

struct FinishedQuery {
    base_index: u32,
    pairs: u32,
    gpu: bool,
    wall_ns: u64,
    last_fence: Option<FenceToken>,
}

#[derive(Default)]
struct TimerState {
    active: Option<ActiveQuery>,
    finished: HashMap<u64, FinishedQuery>,
    next_token: u64,
    cursor: u32,
    unresolved_gpu: usize,
}

pub struct TimerUnit {
    query_set: Option<wgpu::QuerySet>,
    resolve_buffer: Option<wgpu::Buffer>,
    period_ns: f32,
    state: Mutex<TimerState>,
}

impl TimerUnit {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, supported: bool) -> Self {
        let (query_set, resolve_buffer) = if supported {
            let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("texelflow-timer-queries"),
                ty: wgpu::QueryType::Timestamp,
                count: TIMER_QUERY_PAIR_CAPACITY * 2,
            });
            let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("texelflow-timer-resolve"),
                size: (TIMER_QUERY_PAIR_CAPACITY as u64) * 2 * 8,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            (Some(query_set), Some(resolve_buffer))
        } else {
            log::info!("texelflow: adapter lacks TIMESTAMP_QUERY, timing falls back to wall clock");
            (None, None)
        };
        Self {
            query_set,
            resolve_buffer,
            period_ns: queue.get_timestamp_period(),
            state: Mutex::new(TimerState::default()),
        }
    }

    /// Whether resolved values come from device timestamps.
    pub fn supported(&self) -> bool {
        self.query_set.is_some()
    }

    pub(crate) fn query_set(&self) -> Option<&wgpu::QuerySet> {
        self.query_set.as_ref()
    }

    /// Begin a timer bracket. A second `begin` before `end` is a query-state
    /// error.
    pub fn begin(&self) -> TexelResult<TimerToken> {
        let mut state = self.state.lock().expect("timer state poisoned");
        if state.active.is_some() {
            return Err(TexelError::query_state(
                "a timer query is already active; nesting is not supported",
            ));
        }
        if state.unresolved_gpu == 0 {
            state.cursor = 0;
        }
        state.next_token += 1;
        let token = state.next_token;
        let base_index = state.cursor;
        state.active = Some(ActiveQuery {
            token,
            base_index,
            pairs: 0,
            overflowed: false,
            wall_start: Instant::now(),
            last_fence: None,
        });
        Ok(TimerToken(token))
    }

    /// End the active bracket, making its token redeemable once the last
    /// bracketed dispatch's fence has passed.
    pub fn end(&self) -> TexelResult<TimerToken> {
        let mut state = self.state.lock().expect("timer state poisoned");
        let active = state
            .active
            .take()
            .ok_or_else(|| TexelError::query_state("no timer query is active"))?;
        let gpu = self.query_set.is_some() && active.pairs > 0 && !active.overflowed;
        if gpu {
            state.unresolved_gpu += 1;
        }
        let token = active.token;
        state.finished.insert(
            token,
            FinishedQuery {
                base_index: active.base_index,
                pairs: active.pairs,
                gpu,
                wall_ns: active.wall_start.elapsed().as_nanos().min(u64::MAX as u128) as u64,
                last_fence: active.last_fence,
            },
        );
        Ok(TimerToken(token))
    }

    /// Reserve the next begin/end timestamp index pair for a dispatch inside
    /// the active bracket, if device timing applies.
    pub(crate) fn pass_timestamps(&self) -> Option<(u32, u32)> {
        let mut state = self.state.lock().expect("timer state poisoned");
        let active = state.active.as_mut()?;
        if self.query_set.is_none() || active.overflowed {
            return None;
        }
        if active.base_index + active.pairs * 2 + 2 > TIMER_QUERY_PAIR_CAPACITY * 2 {
            log::debug!("timer query exceeded pair budget; degrading to wall clock");
            active.overflowed = true;
            return None;
        }
        let begin = active.base_index + active.pairs * 2;
        active.pairs += 1;
        Some((begin, begin + 1))
    }

    pub(crate) fn note_dispatch(&self, token: FenceToken) {
        let mut state = self.state.lock().expect("timer state poisoned");
        if let Some(active) = state.active.as_mut() {
            active.last_fence = Some(token);
        }
    }

    /// Redeem a finished timer token. Blocks until the bracketing fence has
    /// passed, then reads back the device timestamps (or reports the wall
    /// clock interval flagged unreliable).
    pub fn resolve(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        fences: &FenceRegistry,
        token: TimerToken,
    ) -> TexelResult<ElapsedTime> {
        let finished = {
            let mut state = self.state.lock().expect("timer state poisoned");
            state.finished.remove(&token.0).ok_or_else(|| {
                TexelError::query_state("unknown or already resolved timer token")
            })?
        };
        if let Some(fence) = finished.last_fence {
            fences.wait_blocking(device, fence);
        }
        if !finished.gpu {
            return Ok(ElapsedTime {
                millis: finished.wall_ns as f64 / 1e6,
                unreliable: true,
            });
        }

        let result = self.read_timestamps(device, queue, &finished);
        {
            let mut state = self.state.lock().expect("timer state poisoned");
            state.unresolved_gpu = state.unresolved_gpu.saturating_sub(1);
        }
        match result {
            Ok(Some(elapsed_ns)) => Ok(ElapsedTime {
                millis: elapsed_ns / 1e6,
                unreliable: false,
            }),
            Ok(None) => Ok(ElapsedTime {
                millis: finished.wall_ns as f64 / 1e6,
                unreliable: true,
            }),
            Err(e) => {
                // Timing failures degrade, never abort.
                log::warn!("timestamp readback failed ({e}); reporting wall clock");
                Ok(ElapsedTime {
                    millis: finished.wall_ns as f64 / 1e6,
                    unreliable: true,
                })
            }
        }
    }

    fn read_timestamps(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        finished: &FinishedQuery,
    ) -> TexelResult<Option<f64>> {
        let query_set = self.query_set.as_ref().expect("gpu query without set");
        let resolve_buffer = self.resolve_buffer.as_ref().expect("gpu query without buffer");
        let query_count = finished.base_index + finished.pairs * 2;
        let size_bytes = query_count as u64 * 8;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texelflow-timer-staging"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texelflow-timer-resolve"),
        });
        encoder.resolve_query_set(query_set, 0..query_count, resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(resolve_buffer, 0, &staging, 0, size_bytes);
        queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        device.poll(wgpu::Maintain::Wait);
        pollster::block_on(rx)
            .map_err(|_| TexelError::internal("timer map_async callback dropped"))?
            .map_err(|e| TexelError::internal(e.to_string()))?;
        let data = slice.get_mapped_range();
        let stamps: &[u64] = cast_slice(&data);
        let begin = stamps[finished.base_index as usize];
        let end = stamps[(finished.base_index + finished.pairs * 2 - 1) as usize];
        drop(data);
        staging.unmap();
        if end <= begin {
            return Ok(None);
        }
        Ok(Some((end - begin) as f64 * self.period_ns as f64))
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = TimerState::default();
        }
    }
}
