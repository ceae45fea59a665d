//! Deterministic cycle pacing on an absolute time base.
//!
//! The next wake-up is always the previous one plus exactly one period,
//! never "now + period", so sleep jitter and body duration do not
//! accumulate into drift. A late cycle is counted as an overrun and the
//! schedule is kept: the following wait returns immediately and the loop
//! catches up on the original grid.
//!
//! ## RT Setup Sequence
//! 1. Lock all current and future pages.
//! 2. Prefault stack pages.
//! 3. Pin to a CPU core (optional).
//! 4. SCHED_FIFO at the configured priority, clamped to the scheduler's
//!    range, or its maximum.
//!
//! The process calls go through [`RtOps`]. [`SystemRt`] only touches the
//! process when the `rt` feature is enabled.

use std::fmt;
use std::time::Duration;

use csp_common::consts::{NSEC_PER_SEC, STACK_PREFAULT_BYTES};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};
use tracing::{info, warn};

// ─── Errors ─────────────────────────────────────────────────────────

/// One step of preparing the process for the cycle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtStep {
    LockMemory,
    PinCpu(usize),
    Scheduler(i32),
}

impl fmt::Display for RtStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockMemory => write!(f, "mlockall(MCL_CURRENT | MCL_FUTURE)"),
            Self::PinCpu(cpu) => write!(f, "pinning to CPU core {cpu}"),
            Self::Scheduler(prio) => write!(f, "SCHED_FIFO priority {prio}"),
        }
    }
}

/// Errors during RT setup or cycle pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    /// A process setup call was refused.
    Rt { step: RtStep, errno: Errno },
    /// Reading the clock or sleeping failed.
    Clock(Errno),
    /// Period is zero or does not divide one second.
    InvalidPeriod(u64),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rt { step, errno } => write!(f, "RT setup failed at {step}: {errno}"),
            Self::Clock(e) => write!(f, "monotonic clock error: {e}"),
            Self::InvalidPeriod(p) => write!(f, "invalid cycle period: {p}ns"),
        }
    }
}

impl std::error::Error for CycleError {}

/// Rate limit for repeated RT-path warnings: the first 10, then every 1000th.
#[inline]
pub(crate) const fn should_log(count: u64) -> bool {
    count <= 10 || count % 1000 == 0
}

// ─── Time Sources ───────────────────────────────────────────────────

/// Monotonic time base the scheduler sleeps against.
pub trait TimeSource {
    /// Current monotonic time [ns].
    fn now_ns(&self) -> Result<u64, CycleError>;

    /// Block until the absolute deadline. Returns immediately when the
    /// deadline has already passed.
    fn sleep_until_ns(&mut self, deadline_ns: u64) -> Result<(), CycleError>;
}

/// `CLOCK_MONOTONIC` with `clock_nanosleep(TIMER_ABSTIME)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub const fn new() -> Self {
        Self
    }
}

impl TimeSource for MonotonicClock {
    fn now_ns(&self) -> Result<u64, CycleError> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(CycleError::Clock)?;
        Ok(timespec_to_ns(&ts))
    }

    fn sleep_until_ns(&mut self, deadline_ns: u64) -> Result<(), CycleError> {
        let deadline = TimeSpec::from(Duration::from_nanos(deadline_ns));
        loop {
            // Absolute deadline: resuming after a signal does not stretch the sleep.
            match clock_nanosleep(
                ClockId::CLOCK_MONOTONIC,
                ClockNanosleepFlags::TIMER_ABSTIME,
                &deadline,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(CycleError::Clock(e)),
            }
        }
    }
}

#[inline]
fn timespec_to_ns(ts: &TimeSpec) -> u64 {
    ts.tv_sec() as u64 * NSEC_PER_SEC + ts.tv_nsec() as u64
}

/// Hand-driven time source for tests and offline runs.
///
/// Sleeping jumps the clock forward to the deadline and records it.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now_ns: u64,
    wakes: Vec<u64>,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: start_ns,
            wakes: Vec::new(),
        }
    }

    /// Let time pass, e.g. to model the duration of a cycle body.
    pub fn advance(&mut self, ns: u64) {
        self.now_ns += ns;
    }

    /// Every deadline slept on, in order.
    pub fn wakes(&self) -> &[u64] {
        &self.wakes
    }
}

impl TimeSource for ManualClock {
    fn now_ns(&self) -> Result<u64, CycleError> {
        Ok(self.now_ns)
    }

    fn sleep_until_ns(&mut self, deadline_ns: u64) -> Result<(), CycleError> {
        self.wakes.push(deadline_ns);
        self.now_ns = self.now_ns.max(deadline_ns);
        Ok(())
    }
}

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStats {
    /// Total wake-ups.
    pub cycle_count: u64,
    /// Last cycle body duration [ns].
    pub last_busy_ns: u64,
    /// Minimum cycle body duration [ns].
    pub min_busy_ns: u64,
    /// Maximum cycle body duration [ns].
    pub max_busy_ns: u64,
    /// Running sum for average computation.
    pub sum_busy_ns: u64,
    /// Cycles whose body ran past the next deadline.
    pub overruns: u64,
    /// Maximum wake-up latency [ns] (time between deadline and actual wake).
    pub max_latency_ns: u64,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            cycle_count: 0,
            last_busy_ns: 0,
            min_busy_ns: u64::MAX,
            max_busy_ns: 0,
            sum_busy_ns: 0,
            overruns: 0,
            max_latency_ns: 0,
        }
    }

    /// Record a completed cycle body and the following wake latency.
    #[inline]
    pub fn record(&mut self, busy_ns: u64, latency_ns: u64) {
        self.cycle_count += 1;
        self.last_busy_ns = busy_ns;
        self.min_busy_ns = self.min_busy_ns.min(busy_ns);
        self.max_busy_ns = self.max_busy_ns.max(busy_ns);
        self.sum_busy_ns = self.sum_busy_ns.saturating_add(busy_ns);
        self.max_latency_ns = self.max_latency_ns.max(latency_ns);
    }

    /// Average body duration [ns] (0 if no cycles).
    #[inline]
    pub fn avg_busy_ns(&self) -> u64 {
        if self.cycle_count == 0 {
            0
        } else {
            self.sum_busy_ns / self.cycle_count
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────

/// Absolute wake-up grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    period_ns: u64,
    next_wake_ns: u64,
}

impl CycleClock {
    pub const fn new(period_ns: u64) -> Self {
        Self {
            period_ns,
            next_wake_ns: 0,
        }
    }

    /// Anchor the grid; the first deadline is one period after `now_ns`.
    pub fn arm(&mut self, now_ns: u64) {
        self.next_wake_ns = now_ns;
    }

    /// Step to the next deadline and return it.
    #[inline]
    pub fn advance(&mut self) -> u64 {
        self.next_wake_ns += self.period_ns;
        self.next_wake_ns
    }

    #[inline]
    pub const fn period_ns(&self) -> u64 {
        self.period_ns
    }

    #[inline]
    pub const fn next_wake_ns(&self) -> u64 {
        self.next_wake_ns
    }
}

/// Paces the cycle loop: one [`wait`](Self::wait) per cycle.
pub struct CycleScheduler<T: TimeSource> {
    clock: CycleClock,
    time: T,
    stats: CycleStats,
    armed: bool,
    body_start_ns: Option<u64>,
}

impl<T: TimeSource> CycleScheduler<T> {
    /// The period must be non-zero and divide one second.
    pub fn new(time: T, period_ns: u64) -> Result<Self, CycleError> {
        if period_ns == 0 || NSEC_PER_SEC % period_ns != 0 {
            return Err(CycleError::InvalidPeriod(period_ns));
        }
        Ok(Self {
            clock: CycleClock::new(period_ns),
            time,
            stats: CycleStats::new(),
            armed: false,
            body_start_ns: None,
        })
    }

    /// Anchor the wake-up grid at `now_ns`. `wait` arms on first use if this
    /// was never called.
    pub fn arm(&mut self, now_ns: u64) {
        self.clock.arm(now_ns);
        self.armed = true;
    }

    /// Sleep until the next deadline; returns that deadline.
    pub fn wait(&mut self) -> Result<u64, CycleError> {
        let now = self.time.now_ns()?;
        if !self.armed {
            self.arm(now);
        }
        let busy = self.body_start_ns.map_or(0, |start| now.saturating_sub(start));
        let deadline = self.clock.advance();

        if now > deadline {
            self.stats.overruns += 1;
            if should_log(self.stats.overruns) {
                warn!(
                    "Cycle overrun #{}: {}ns past deadline (busy {}ns, period {}ns)",
                    self.stats.overruns,
                    now - deadline,
                    busy,
                    self.clock.period_ns()
                );
            }
        }

        self.time.sleep_until_ns(deadline)?;
        let woke = self.time.now_ns()?;
        self.stats.record(busy, woke.saturating_sub(deadline));
        self.body_start_ns = Some(woke);
        Ok(deadline)
    }

    /// Current monotonic time, used as the DC application time.
    #[inline]
    pub fn now_ns(&self) -> Result<u64, CycleError> {
        self.time.now_ns()
    }

    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn time(&self) -> &T {
        &self.time
    }

    pub fn time_mut(&mut self) -> &mut T {
        &mut self.time
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Process-level calls made by [`rt_setup_with`].
pub trait RtOps {
    /// Accepted SCHED_FIFO priorities, `None` when unavailable.
    fn fifo_priority_range(&self) -> Option<(i32, i32)>;

    fn lock_memory(&mut self) -> Result<(), Errno>;

    fn pin_cpu(&mut self, cpu: usize) -> Result<(), Errno>;

    fn set_fifo(&mut self, priority: i32) -> Result<(), Errno>;
}

/// The running process. Every call succeeds without effect unless the
/// `rt` feature is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRt;

#[cfg(feature = "rt")]
impl RtOps for SystemRt {
    fn fifo_priority_range(&self) -> Option<(i32, i32)> {
        // SAFETY: plain queries, no pointers involved.
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(libc::SCHED_FIFO),
                libc::sched_get_priority_max(libc::SCHED_FIFO),
            )
        };
        (min >= 0 && max >= min).then_some((min, max))
    }

    fn lock_memory(&mut self) -> Result<(), Errno> {
        use nix::sys::mman::{MlockallFlags, mlockall};
        mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
    }

    fn pin_cpu(&mut self, cpu: usize) -> Result<(), Errno> {
        use nix::sched::{CpuSet, sched_setaffinity};
        use nix::unistd::Pid;

        let mut set = CpuSet::new();
        set.set(cpu)?;
        sched_setaffinity(Pid::from_raw(0), &set)
    }

    fn set_fifo(&mut self, priority: i32) -> Result<(), Errno> {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: `param` outlives the call; pid 0 is the calling thread.
        match unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } {
            0 => Ok(()),
            _ => Err(Errno::last()),
        }
    }
}

#[cfg(not(feature = "rt"))]
impl RtOps for SystemRt {
    fn fifo_priority_range(&self) -> Option<(i32, i32)> {
        None
    }

    fn lock_memory(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn pin_cpu(&mut self, _cpu: usize) -> Result<(), Errno> {
        Ok(())
    }

    fn set_fifo(&mut self, _priority: i32) -> Result<(), Errno> {
        Ok(())
    }
}

/// Touch the stack the loop will use so it is resident before the first cycle.
fn prefault_stack() {
    let mut buf = [0u8; STACK_PREFAULT_BYTES];
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, exclusive reference into `buf`.
        unsafe { core::ptr::write_volatile(byte, 0) };
    }
    core::hint::black_box(&buf);
}

/// Priority to request: the configured one clamped into `range`, or the
/// top of `range` when none is configured.
pub fn resolve_priority(requested: Option<i32>, range: Option<(i32, i32)>) -> i32 {
    match (requested, range) {
        (None, Some((_, max))) => max,
        (None, None) => 0,
        (Some(prio), Some((min, max))) if !(min..=max).contains(&prio) => {
            let clamped = prio.clamp(min, max);
            warn!("Priority {prio} outside SCHED_FIFO range [{min}, {max}]; using {clamped}");
            clamped
        }
        (Some(prio), _) => prio,
    }
}

/// Prepare this process for the cycle loop. Returns the selected priority.
pub fn rt_setup(priority: Option<i32>, cpu_core: Option<usize>) -> Result<i32, CycleError> {
    rt_setup_with(&mut SystemRt, priority, cpu_core)
}

/// Memory locking and CPU pinning failures are fatal. A refused scheduler
/// change is logged and the loop runs at normal priority.
pub fn rt_setup_with(
    ops: &mut impl RtOps,
    priority: Option<i32>,
    cpu_core: Option<usize>,
) -> Result<i32, CycleError> {
    if cfg!(not(feature = "rt")) {
        info!("Built without `rt` feature: memory locking and SCHED_FIFO skipped");
    }

    ops.lock_memory().map_err(|errno| CycleError::Rt {
        step: RtStep::LockMemory,
        errno,
    })?;
    prefault_stack();

    if let Some(cpu) = cpu_core {
        ops.pin_cpu(cpu).map_err(|errno| CycleError::Rt {
            step: RtStep::PinCpu(cpu),
            errno,
        })?;
        info!("Pinned to CPU core {cpu}");
    }

    let prio = resolve_priority(priority, ops.fifo_priority_range());
    info!("Using priority {prio}");
    if let Err(errno) = ops.set_fifo(prio) {
        let err = CycleError::Rt {
            step: RtStep::Scheduler(prio),
            errno,
        };
        warn!("{err}; continuing without real-time scheduling");
    }
    Ok(prio)
}
