//! Engine lifecycle: configure, bring up, control, stop.
//!
//! ```text
//!  STARTUP_CONFIG ──configure ok──▶ BRINGUP ──all devices OP──▶ CONTROL
//!        │                            │  │                         │
//!        └──error──▶ (exit)  timeout ─┘  └─stop─▶ STOPPED ◀──stop──┘
//! ```
//!
//! Both cyclic phases run the same ordered transaction on the same
//! absolute wake-up grid. Bring-up only watches device states; control
//! additionally reads measured values, asks the motion policy for
//! setpoints and writes them before queueing. Distributed-clock sync runs
//! every cycle in both phases, and the grid is not re-anchored when
//! control starts.
//!
//! A stop request is observed at cycle boundaries, after `send` and before
//! the next wait, so the bus never sees a half-built frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use csp_common::bus::{BusError, BusMaster, DomainHandle, PdoEntryRegistration};
use csp_common::config::{ConfigError, EngineConfig};
use csp_common::consts::MAX_DEVICES;
use csp_common::pdo::{PdoEntryInfo, mapped_entries};
use tracing::{debug, error, info, warn};

use crate::clock::{self, ClockSynchronizer};
use crate::cycle::{CycleScheduler, CycleStats, TimeSource};
use crate::device::DeviceStateTracker;
use crate::error::EngineError;
use crate::image::ProcessImage;
use crate::motion::{AxisFields, MotionPolicy, OffsetPolicy, Setpoint};
use crate::registry::FieldRegistry;
use crate::transaction::{BusTransactionManager, ExchangeHealth, HealthVerdict, TransactionStats};

/// Control cycles between periodic statistics lines.
const STATS_LOG_INTERVAL: u64 = 10_000;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    StartupConfig,
    Bringup,
    Control,
    Stopped,
}

/// How bring-up ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupResult {
    /// Every device reached OP on the last of `cycles`.
    Ready { cycles: u64 },
    /// The cycle budget ran out first.
    Timeout { cycles: u64 },
    /// A stop was requested first.
    Stopped { cycles: u64 },
}

/// How an uninterrupted run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    StoppedDuringBringup { cycles: u64 },
    Stopped { control_cycles: u64 },
}

/// Cooperative stop request, shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one control cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// 1-based control cycle number.
    pub cycle: u64,
    /// Deadline this cycle woke on [ns].
    pub wake_ns: u64,
    pub exchange: ExchangeHealth,
    pub verdict: HealthVerdict,
    /// Reference clock delta since the previous cycle, when measured.
    pub reference_delta: Option<u32>,
    pub all_operational: bool,
    /// Setpoints written, by device index.
    pub setpoints: heapless::Vec<Setpoint, MAX_DEVICES>,
}

/// Counters reported on shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSummary {
    pub bringup_cycles: u64,
    pub control_cycles: u64,
    pub cycles: CycleStats,
    pub transactions: TransactionStats,
}

/// Everything configuration produces before the bus is handed over.
struct BusSetup {
    domain: DomainHandle,
    tracker: DeviceStateTracker,
    registry: FieldRegistry,
    axes: heapless::Vec<AxisFields, MAX_DEVICES>,
    image: ProcessImage,
}

pub struct Engine<B: BusMaster, T: TimeSource> {
    tx: BusTransactionManager<B>,
    image: ProcessImage,
    registry: FieldRegistry,
    axes: heapless::Vec<AxisFields, MAX_DEVICES>,
    tracker: DeviceStateTracker,
    clock_sync: Box<dyn ClockSynchronizer>,
    policy: Box<dyn MotionPolicy>,
    scheduler: CycleScheduler<T>,
    stop: StopFlag,
    phase: EnginePhase,
    bringup_timeout_cycles: u64,
    bringup_cycles: u64,
    control_cycles: u64,
}

impl<B: BusMaster, T: TimeSource> Engine<B, T> {
    /// Configure the bus and activate it.
    ///
    /// Startup SDO failures are logged and skipped. Any other failure
    /// releases the master and is returned.
    pub fn configure(mut bus: B, config: &EngineConfig, time: T) -> Result<Self, EngineError> {
        info!(
            "Configuring {} device(s) on {} master {}",
            config.devices.len(),
            bus.name(),
            config.engine.master_index
        );
        let scheduler = match CycleScheduler::new(time, config.engine.cycle_period_ns) {
            Ok(s) => s,
            Err(e) => {
                bus.release();
                return Err(e.into());
            }
        };
        let clock_sync = clock::from_config(&config.clock);
        let setup = match configure_bus(&mut bus, config, clock_sync.as_ref()) {
            Ok(s) => s,
            Err(e) => {
                bus.release();
                return Err(e);
            }
        };
        let tx = BusTransactionManager::new(bus, setup.domain, config.engine.max_consecutive_missed)?;

        let offsets: Vec<i32> = config.devices.iter().map(|d| d.setpoint_offset).collect();
        info!(
            "Engine configured: {} field(s) in {} bytes, cycle {}ns, clock sync {}",
            setup.registry.len(),
            setup.image.len(),
            config.engine.cycle_period_ns,
            clock_sync.name()
        );

        Ok(Self {
            tx,
            image: setup.image,
            registry: setup.registry,
            axes: setup.axes,
            tracker: setup.tracker,
            clock_sync,
            policy: Box::new(OffsetPolicy::new(&offsets)),
            scheduler,
            stop: StopFlag::new(),
            phase: EnginePhase::StartupConfig,
            bringup_timeout_cycles: config.engine.bringup_timeout_cycles,
            bringup_cycles: 0,
            control_cycles: 0,
        })
    }

    /// Replace the default offset law.
    pub fn with_policy(mut self, policy: impl MotionPolicy + 'static) -> Self {
        info!("Motion policy: {}", policy.name());
        self.policy = Box::new(policy);
        self
    }

    /// Use an externally owned stop flag (e.g. one shared with a signal handler).
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    fn require(&self, op: &'static str, allowed: &[EnginePhase]) -> Result<(), EngineError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(EngineError::WrongPhase {
                op,
                phase: self.phase,
            })
        }
    }

    // ─── Bring-up ───────────────────────────────────────────────────

    /// One bring-up cycle. Returns whether every device is now in OP.
    ///
    /// The cycle always completes, including queue, clock sync and send,
    /// even when it is the one that observes the last device reaching OP.
    pub fn bringup_cycle(&mut self) -> Result<bool, EngineError> {
        self.require("bringup_cycle", &[EnginePhase::StartupConfig, EnginePhase::Bringup])?;
        self.phase = EnginePhase::Bringup;

        self.scheduler.wait()?;
        self.tx.receive()?;
        self.tx.process(&mut self.image)?;
        let all_operational = self.tracker.refresh_all(&self.tx)?;
        self.tx.queue(&self.image)?;
        let app_time = self.scheduler.now_ns()?;
        self.tx.sync_clocks(self.clock_sync.as_mut(), app_time)?;
        // Missed exchanges are expected while devices are still coming up.
        self.tx.send()?;

        self.bringup_cycles += 1;
        Ok(all_operational)
    }

    /// Cycle until every device is in OP, the budget runs out, or a stop
    /// is requested.
    pub fn bring_up(&mut self) -> Result<BringupResult, EngineError> {
        self.require("bring_up", &[EnginePhase::StartupConfig, EnginePhase::Bringup])?;
        self.phase = EnginePhase::Bringup;
        info!(
            "Waiting for {} device(s) to reach OP (budget {} cycles)",
            self.tracker.len(),
            self.bringup_timeout_cycles
        );

        loop {
            if self.stop.is_stop_requested() {
                info!("Stop requested during bring-up after {} cycles", self.bringup_cycles);
                self.phase = EnginePhase::Stopped;
                return Ok(BringupResult::Stopped {
                    cycles: self.bringup_cycles,
                });
            }
            if self.bringup_cycles >= self.bringup_timeout_cycles {
                for dev in self.tracker.iter().filter(|d| !d.state().is_operational()) {
                    error!("{} ({}) stuck in {}", dev.name, dev.address, dev.state());
                }
                return Ok(BringupResult::Timeout {
                    cycles: self.bringup_cycles,
                });
            }
            if self.bringup_cycle()? {
                info!(
                    "All {} device(s) in OP after {} cycles",
                    self.tracker.len(),
                    self.bringup_cycles
                );
                self.tx.health_mut().reset_streak();
                self.phase = EnginePhase::Control;
                return Ok(BringupResult::Ready {
                    cycles: self.bringup_cycles,
                });
            }
        }
    }

    // ─── Control ────────────────────────────────────────────────────

    /// One control cycle: read measured values, compute and write
    /// setpoints, exchange.
    pub fn control_cycle(&mut self) -> Result<CycleReport, EngineError> {
        self.require("control_cycle", &[EnginePhase::Control])?;

        let wake_ns = self.scheduler.wait()?;
        self.tx.receive()?;
        let exchange = self.tx.process(&mut self.image)?;
        let reference_delta = self.tx.sample_reference(self.clock_sync.as_mut())?;
        let all_operational = self.tracker.refresh_all(&self.tx)?;

        // One setpoint per axis; both share the MAX_DEVICES bound.
        let setpoints = self
            .axes
            .iter()
            .map(|axis| -> Result<Setpoint, EngineError> {
                let measured = axis.read_measured(&self.image)?;
                let sp = self.policy.next_setpoint(axis.device, &measured);
                axis.write_setpoint(&mut self.image, &sp)?;
                Ok(sp)
            })
            .collect::<Result<heapless::Vec<_, MAX_DEVICES>, _>>()?;

        self.tx.queue(&self.image)?;
        let app_time = self.scheduler.now_ns()?;
        self.tx.sync_clocks(self.clock_sync.as_mut(), app_time)?;
        let verdict = self.tx.send()?;
        self.control_cycles += 1;

        if let HealthVerdict::Fatal { consecutive_missed } = verdict {
            error!(
                "Bus lost after {} control cycles: {consecutive_missed} consecutive missed exchanges",
                self.control_cycles
            );
            return Err(EngineError::TransportFatal {
                consecutive: consecutive_missed,
            });
        }
        if self.control_cycles % STATS_LOG_INTERVAL == 0 {
            let stats = self.scheduler.stats();
            debug!(
                "cycles={} overruns={} max_latency={}ns avg_busy={}ns degraded={} missed={}",
                self.control_cycles,
                stats.overruns,
                stats.max_latency_ns,
                stats.avg_busy_ns(),
                self.tx.stats().incomplete,
                self.tx.stats().missed
            );
        }

        Ok(CycleReport {
            cycle: self.control_cycles,
            wake_ns,
            exchange,
            verdict,
            reference_delta,
            all_operational,
            setpoints,
        })
    }

    /// Run control cycles until a stop is requested.
    pub fn run_control(&mut self) -> Result<RunOutcome, EngineError> {
        self.require("run_control", &[EnginePhase::Control])?;
        info!("Entering control loop");
        while !self.stop.is_stop_requested() {
            self.control_cycle()?;
        }
        info!("Stop requested after {} control cycles", self.control_cycles);
        self.phase = EnginePhase::Stopped;
        Ok(RunOutcome::Stopped {
            control_cycles: self.control_cycles,
        })
    }

    /// Bring-up followed by control until stopped.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        match self.bring_up()? {
            BringupResult::Ready { .. } => self.run_control(),
            BringupResult::Timeout { cycles } => Err(EngineError::BringupTimeout {
                cycles,
                pending: self.tracker.pending(),
            }),
            BringupResult::Stopped { cycles } => Ok(RunOutcome::StoppedDuringBringup { cycles }),
        }
    }

    /// Release the master and report counters.
    pub fn shutdown(mut self) -> EngineSummary {
        self.tx.release();
        self.phase = EnginePhase::Stopped;
        let summary = EngineSummary {
            bringup_cycles: self.bringup_cycles,
            control_cycles: self.control_cycles,
            cycles: self.scheduler.stats().clone(),
            transactions: *self.tx.stats(),
        };
        info!(
            "Shutdown: {} bring-up + {} control cycles, {} overruns, {} degraded, {} missed, {} transport errors",
            summary.bringup_cycles,
            summary.control_cycles,
            summary.cycles.overruns,
            summary.transactions.incomplete,
            summary.transactions.missed,
            summary.transactions.transport_errors
        );
        summary
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn bus(&self) -> &B {
        self.tx.bus()
    }

    /// Script the backend between cycles.
    pub fn bus_mut(&mut self) -> &mut B {
        self.tx.bus_mut()
    }

    pub fn image(&self) -> &ProcessImage {
        &self.image
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn axes(&self) -> &[AxisFields] {
        &self.axes
    }

    pub fn tracker(&self) -> &DeviceStateTracker {
        &self.tracker
    }

    pub fn clock_sync(&self) -> &dyn ClockSynchronizer {
        self.clock_sync.as_ref()
    }

    pub fn scheduler(&self) -> &CycleScheduler<T> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut CycleScheduler<T> {
        &mut self.scheduler
    }

    pub fn transaction_stats(&self) -> &TransactionStats {
        self.tx.stats()
    }

    pub fn bringup_cycles(&self) -> u64 {
        self.bringup_cycles
    }

    pub fn control_cycles(&self) -> u64 {
        self.control_cycles
    }
}

/// Startup configuration sequence, in bus order: SDOs, slave configs and
/// PDOs, domain entries, DC, activation.
fn configure_bus<B: BusMaster>(
    bus: &mut B,
    config: &EngineConfig,
    clock_sync: &dyn ClockSynchronizer,
) -> Result<BusSetup, EngineError> {
    for dev in &config.devices {
        for sdo in dev.startup_sdos() {
            let payload = sdo
                .payload()
                .map_err(|e| ConfigError::ValidationError(format!("device '{}': {e}", dev.name)))?;
            match bus.sdo_download(dev.position, sdo.index, sdo.subindex, &payload) {
                Ok(()) => debug!(
                    "{}: SDO 0x{:04x}:{:02x} <- 0x{:x}",
                    dev.name, sdo.index, sdo.subindex, sdo.value
                ),
                Err(e) => warn!("{}: {e}; continuing", dev.name),
            }
        }
    }

    let mut tracker = DeviceStateTracker::new();
    let mut slaves = Vec::with_capacity(config.devices.len());
    for dev in &config.devices {
        let slave = bus.configure_slave(dev.address(), dev.identity())?;
        let layout = dev.layout();
        bus.configure_pdos(slave, &layout)?;
        tracker.track(dev.name.clone(), dev.address(), dev.identity(), slave)?;
        slaves.push((slave, layout));
    }

    let domain = bus.create_domain()?;
    let mut registrations = Vec::new();
    let mut entries: Vec<(usize, PdoEntryInfo)> = Vec::new();
    for (device, (slave, layout)) in slaves.iter().enumerate() {
        for (_, entry) in mapped_entries(layout) {
            registrations.push(PdoEntryRegistration {
                slave: *slave,
                object: entry.object(),
            });
            entries.push((device, *entry));
        }
    }
    let offsets = bus.register_pdo_entries(domain, &registrations)?;
    if offsets.len() != entries.len() {
        return Err(BusError::PdoMapping(format!(
            "{} offsets returned for {} entries",
            offsets.len(),
            entries.len()
        ))
        .into());
    }
    let mut registry = FieldRegistry::new();
    for ((device, entry), offset) in entries.iter().zip(offsets) {
        registry.register_entry(*device, entry, offset)?;
    }

    if clock_sync.uses_dc() {
        let dc = config.clock.dc_settings(config.engine.cycle_period_ns);
        for (slave, _) in &slaves {
            bus.configure_dc(*slave, &dc)?;
        }
    }

    info!("Activating master...");
    bus.activate()?;
    info!("Master activated");

    let image = registry.finalize_with_size(bus.domain_size(domain)?)?;
    // The tracker already holds every device, so this fits.
    let axes = (0..tracker.len())
        .map(|device| AxisFields::bind(&registry, device))
        .collect::<Result<heapless::Vec<_, MAX_DEVICES>, _>>()?;

    Ok(BusSetup {
        domain,
        tracker,
        registry,
        axes,
        image,
    })
}
