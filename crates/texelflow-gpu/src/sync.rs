//! Fence tracking for submitted GPU work.
//!
//! Each dispatch gets one token and advances `Issued -> FencePending ->
//! Passed`. Completion callbacks only flip a per-fence flag; the registry's
//! watermark advances exclusively by scanning the pending queue from the
//! oldest entry. A newer fence observed complete does not move the watermark
//! past an older unconfirmed one: some drivers misreport completion when
//! fences are queried out of issuance order, so the linear oldest-first scan
//! is a correctness requirement, not an optimization opportunity.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Issuance position of one dispatch in the command stream. Positions start
/// at 1 and increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceToken(pub(crate) u64);

impl FenceToken {
    pub fn position(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Token reserved for a dispatch whose fence has not been armed yet.
    Issued,
    /// Fence armed; completion callback not yet confirmed in order.
    FencePending,
    /// All commands up to this fence have retired.
    Passed,
}

struct PendingFence {
    position: u64,
    done: Arc<AtomicBool>,
}

pub struct FenceRegistry {
    next_position: AtomicU64,
    last_passed: AtomicU64,
    pending: Mutex<VecDeque<PendingFence>>,
    last_hw_poll: Mutex<Instant>,
    poll_interval: Duration,
}

impl FenceRegistry {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            next_position: AtomicU64::new(1),
            last_passed: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            last_hw_poll: Mutex::new(Instant::now() - poll_interval),
            poll_interval,
        }
    }

    /// Reserve the next issuance position. The token stays `Issued` until the
    /// dispatch is submitted and `arm` is called.
    pub fn issue(&self) -> FenceToken {
        FenceToken(self.next_position.fetch_add(1, Ordering::Relaxed))
    }

    /// Arm the fence for a just-submitted dispatch. Always succeeds; only
    /// polling can report "not yet". The completion callback does nothing but
    /// flip the flag, so re-entrant work scheduled from other callbacks can
    /// never corrupt the queue.
    pub fn arm(&self, queue: &wgpu::Queue, token: FenceToken) {
        let done = Arc::new(AtomicBool::new(false));
        let signal = done.clone();
        queue.on_submitted_work_done(move || {
            signal.store(true, Ordering::Release);
        });
        self.push_pending(token, done);
    }

    fn push_pending(&self, token: FenceToken, done: Arc<AtomicBool>) {
        let mut guard = self.pending.lock().expect("fence queue poisoned");
        if let Some(back) = guard.back() {
            debug_assert!(back.position < token.0, "fences must be armed in order");
        }
        guard.push_back(PendingFence {
            position: token.0,
            done,
        });
    }

    /// In-order drain: advance the watermark while the *oldest* pending fence
    /// reports complete, and stop at the first that does not.
    fn advance(&self) {
        let mut guard = self.pending.lock().expect("fence queue poisoned");
        while let Some(front) = guard.front() {
            if !front.done.load(Ordering::Acquire) {
                break;
            }
            self.last_passed.store(front.position, Ordering::Release);
            guard.pop_front();
        }
    }

    /// Non-blocking completion check. Callable at arbitrarily high frequency:
    /// the device is polled at most once per configured interval and the
    /// cached watermark answers in between. Once true for a token, every
    /// subsequent call returns true.
    pub fn is_passed(&self, device: &wgpu::Device, token: FenceToken) -> bool {
        if token.0 <= self.last_passed.load(Ordering::Acquire) {
            return true;
        }
        let should_poll = {
            let mut guard = self.last_hw_poll.lock().expect("fence poll clock poisoned");
            if guard.elapsed() >= self.poll_interval {
                *guard = Instant::now();
                true
            } else {
                false
            }
        };
        if should_poll {
            device.poll(wgpu::Maintain::Poll);
        }
        self.advance();
        token.0 <= self.last_passed.load(Ordering::Acquire)
    }

    pub fn state(&self, token: FenceToken) -> FenceState {
        if token.0 <= self.last_passed.load(Ordering::Acquire) {
            return FenceState::Passed;
        }
        let guard = self.pending.lock().expect("fence queue poisoned");
        if guard.iter().any(|f| f.position == token.0) {
            FenceState::FencePending
        } else {
            FenceState::Issued
        }
    }

    /// Completion future built from repeated non-blocking polls. Each poll
    /// that comes up short yields back to the executor instead of blocking
    /// the host thread.
    pub fn await_fence<'a>(&'a self, device: &'a wgpu::Device, token: FenceToken) -> FenceFuture<'a> {
        FenceFuture {
            registry: self,
            device,
            token,
        }
    }

    /// Blocking wait used by the synchronous readback path and disposal.
    pub fn wait_blocking(&self, device: &wgpu::Device, token: FenceToken) {
        loop {
            self.advance();
            if token.0 <= self.last_passed.load(Ordering::Acquire) {
                return;
            }
            device.poll(wgpu::Maintain::Wait);
        }
    }

    /// Drain every pending fence, blocking until the device retires them.
    pub fn drain_blocking(&self, device: &wgpu::Device) {
        let newest = {
            let guard = self.pending.lock().expect("fence queue poisoned");
            guard.back().map(|f| f.position)
        };
        if let Some(position) = newest {
            self.wait_blocking(device, FenceToken(position));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("fence queue poisoned").len()
    }

    #[cfg(test)]
    fn arm_manual(&self, token: FenceToken, done: Arc<AtomicBool>) {
        self.push_pending(token, done);
    }
}

pub struct FenceFuture<'a> {
    registry: &'a FenceRegistry,
    device: &'a wgpu::Device,
    token: FenceToken,
}

impl Future for FenceFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.registry.is_passed(self.device, self.token) {
            Poll::Ready(())
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FenceRegistry {
        FenceRegistry::new(Duration::from_micros(0))
    }

    fn passed(reg: &FenceRegistry, token: FenceToken) -> bool {
        reg.advance();
        token.0 <= reg.last_passed.load(Ordering::Acquire)
    }

    #[test]
    fn tokens_issue_in_increasing_order() {
        let reg = registry();
        let a = reg.issue();
        let b = reg.issue();
        assert!(a < b);
        assert_eq!(reg.state(a), FenceState::Issued);
    }

    #[test]
    fn drain_is_strictly_in_issuance_order() {
        let reg = registry();
        let a = reg.issue();
        let b = reg.issue();
        let a_done = Arc::new(AtomicBool::new(false));
        let b_done = Arc::new(AtomicBool::new(false));
        reg.arm_manual(a, a_done.clone());
        reg.arm_manual(b, b_done.clone());
        assert_eq!(reg.state(a), FenceState::FencePending);

        // The newer fence completing first must not advance the watermark
        // past the older one.
        b_done.store(true, Ordering::Release);
        assert!(!passed(&reg, a));
        assert!(!passed(&reg, b));

        a_done.store(true, Ordering::Release);
        assert!(passed(&reg, a));
        assert!(passed(&reg, b));
        assert_eq!(reg.pending_count(), 0);
    }

    #[test]
    fn passed_is_monotonic() {
        let reg = registry();
        let a = reg.issue();
        let done = Arc::new(AtomicBool::new(false));
        reg.arm_manual(a, done.clone());
        done.store(true, Ordering::Release);
        assert!(passed(&reg, a));
        // The flag is irrelevant once the watermark moved past the token.
        done.store(false, Ordering::Release);
        assert!(passed(&reg, a));
        assert_eq!(reg.state(a), FenceState::Passed);
    }

    #[test]
    fn state_machine_never_skips_pending() {
        let reg = registry();
        let a = reg.issue();
        assert_eq!(reg.state(a), FenceState::Issued);
        let done = Arc::new(AtomicBool::new(true));
        reg.arm_manual(a, done);
        assert_eq!(reg.state(a), FenceState::FencePending);
        reg.advance();
        assert_eq!(reg.state(a), FenceState::Passed);
    }
}
