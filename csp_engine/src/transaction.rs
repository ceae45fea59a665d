//! One bus transaction per cycle, in a fixed order.
//!
//! ```text
//!  Idle ──receive──▶ Received ──process──▶ Processed ──queue──▶ Queued ──send──▶ Idle
//!                                            │  slave_state          │  sync_clocks
//!                                            │  sample_reference     │
//! ```
//!
//! Calls outside this order are rejected with
//! [`TransactionError::OutOfOrder`] and leave the phase unchanged. Reading
//! inputs before `process` or writing outputs after `queue` would exchange
//! stale data, so the ordering is enforced here rather than left to callers.
//!
//! Every exchange is classified by its working counter. Transport failures
//! count as missed exchanges; too many in a row is fatal.

use csp_common::bus::{BusError, BusMaster, DomainHandle, DomainState, SlaveConfigHandle, WcState};
use csp_common::device::SlaveConfigState;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::ClockSynchronizer;
use crate::cycle::should_log;
use crate::image::ProcessImage;

/// Position within the current cycle's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Idle,
    Received,
    Processed,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("{op} not allowed in phase {phase:?}")]
    OutOfOrder { op: &'static str, phase: TxPhase },

    #[error("process image is {image} bytes, domain is {domain} bytes")]
    ImageSize { image: usize, domain: usize },

    #[error(transparent)]
    Bus(#[from] BusError),
}

// ─── Health ─────────────────────────────────────────────────────────

/// Outcome of one process-data exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeHealth {
    /// All registered data exchanged.
    Complete,
    /// Some devices did not take part.
    Incomplete { working_counter: u16, expected: u16 },
    /// Nothing exchanged, or the frame was lost.
    Missed,
}

/// What the cycle loop should do about the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Logged and counted; the loop continues.
    Degraded,
    /// Consecutive missed exchanges reached the limit.
    Fatal { consecutive_missed: u32 },
}

/// Exchange counters since start-up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    pub exchanges: u64,
    pub complete: u64,
    pub incomplete: u64,
    pub missed: u64,
    pub transport_errors: u64,
    pub longest_miss_streak: u32,
}

/// Classifies exchanges and tracks consecutive misses.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    max_consecutive_missed: u32,
    consecutive_missed: u32,
    last_working_counter: Option<u16>,
    stats: TransactionStats,
}

impl HealthMonitor {
    pub fn new(max_consecutive_missed: u32) -> Self {
        Self {
            max_consecutive_missed: max_consecutive_missed.max(1),
            consecutive_missed: 0,
            last_working_counter: None,
            stats: TransactionStats::default(),
        }
    }

    /// Classify a domain report.
    pub fn classify(&mut self, state: DomainState) -> ExchangeHealth {
        if self.last_working_counter != Some(state.working_counter) {
            debug!(
                "Domain working counter {}/{}",
                state.working_counter, state.expected_working_counter
            );
            self.last_working_counter = Some(state.working_counter);
        }
        match state.wc_state() {
            WcState::Complete => ExchangeHealth::Complete,
            WcState::Incomplete => ExchangeHealth::Incomplete {
                working_counter: state.working_counter,
                expected: state.expected_working_counter,
            },
            WcState::Zero => ExchangeHealth::Missed,
        }
    }

    pub fn record_transport_error(&mut self, op: &str, err: &BusError) {
        self.stats.transport_errors += 1;
        if should_log(self.stats.transport_errors) {
            warn!(
                "Transport error #{} during {op}: {err}",
                self.stats.transport_errors
            );
        }
    }

    /// Account for one finished exchange and decide what to do about it.
    pub fn evaluate(&mut self, health: ExchangeHealth) -> HealthVerdict {
        self.stats.exchanges += 1;
        match health {
            ExchangeHealth::Complete => {
                self.stats.complete += 1;
                self.consecutive_missed = 0;
                HealthVerdict::Healthy
            }
            ExchangeHealth::Incomplete {
                working_counter,
                expected,
            } => {
                self.stats.incomplete += 1;
                self.consecutive_missed = 0;
                if should_log(self.stats.incomplete) {
                    warn!(
                        "Incomplete exchange #{}: working counter {working_counter}/{expected}",
                        self.stats.incomplete
                    );
                }
                HealthVerdict::Degraded
            }
            ExchangeHealth::Missed => {
                self.stats.missed += 1;
                self.consecutive_missed = self.consecutive_missed.saturating_add(1);
                self.stats.longest_miss_streak =
                    self.stats.longest_miss_streak.max(self.consecutive_missed);
                if should_log(self.stats.missed) {
                    warn!(
                        "Missed exchange #{} ({} consecutive, limit {})",
                        self.stats.missed, self.consecutive_missed, self.max_consecutive_missed
                    );
                }
                if self.consecutive_missed >= self.max_consecutive_missed {
                    HealthVerdict::Fatal {
                        consecutive_missed: self.consecutive_missed,
                    }
                } else {
                    HealthVerdict::Degraded
                }
            }
        }
    }

    /// Forget the current miss streak; counters are kept.
    pub fn reset_streak(&mut self) {
        self.consecutive_missed = 0;
    }

    pub fn consecutive_missed(&self) -> u32 {
        self.consecutive_missed
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }
}

// ─── Transaction Manager ────────────────────────────────────────────

/// Owns the bus master and sequences each cycle's transaction.
pub struct BusTransactionManager<B: BusMaster> {
    bus: B,
    domain: DomainHandle,
    domain_size: usize,
    phase: TxPhase,
    health: HealthMonitor,
    exchange: ExchangeHealth,
    transport_failed: bool,
}

impl<B: BusMaster> BusTransactionManager<B> {
    /// Wrap an activated bus master and its process-data domain.
    pub fn new(
        bus: B,
        domain: DomainHandle,
        max_consecutive_missed: u32,
    ) -> Result<Self, TransactionError> {
        let domain_size = bus.domain_size(domain)?;
        Ok(Self {
            bus,
            domain,
            domain_size,
            phase: TxPhase::Idle,
            health: HealthMonitor::new(max_consecutive_missed),
            exchange: ExchangeHealth::Missed,
            transport_failed: false,
        })
    }

    fn expect(&self, op: &'static str, phase: TxPhase) -> Result<(), TransactionError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(TransactionError::OutOfOrder {
                op,
                phase: self.phase,
            })
        }
    }

    fn check_image(&self, image: &ProcessImage) -> Result<(), TransactionError> {
        if image.len() != self.domain_size {
            return Err(TransactionError::ImageSize {
                image: image.len(),
                domain: self.domain_size,
            });
        }
        Ok(())
    }

    /// Absorb transport failures into the health accounting; anything else
    /// is a programming or configuration error and propagates.
    fn absorb(&mut self, op: &str, result: Result<(), BusError>) -> Result<(), TransactionError> {
        match result {
            Ok(()) => Ok(()),
            Err(err @ BusError::Transport(_)) => {
                self.health.record_transport_error(op, &err);
                self.transport_failed = true;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch the frame returned since the last send.
    pub fn receive(&mut self) -> Result<(), TransactionError> {
        self.expect("receive", TxPhase::Idle)?;
        self.transport_failed = false;
        let result = self.bus.receive();
        self.absorb("receive", result)?;
        self.phase = TxPhase::Received;
        Ok(())
    }

    /// Evaluate the exchange and copy inputs into the image.
    pub fn process(&mut self, image: &mut ProcessImage) -> Result<ExchangeHealth, TransactionError> {
        self.expect("process", TxPhase::Received)?;
        self.check_image(image)?;
        let health = match self.bus.process_domain(self.domain, image.as_mut_slice()) {
            Ok(state) => self.health.classify(state),
            Err(err) => {
                self.absorb("process", Err(err))?;
                ExchangeHealth::Missed
            }
        };
        self.exchange = if self.transport_failed {
            ExchangeHealth::Missed
        } else {
            health
        };
        self.phase = TxPhase::Processed;
        Ok(self.exchange)
    }

    /// Application-layer state of one slave, as of this exchange.
    pub fn slave_state(&self, slave: SlaveConfigHandle) -> Result<SlaveConfigState, TransactionError> {
        self.expect("slave_state", TxPhase::Processed)?;
        Ok(self.bus.slave_config_state(slave)?)
    }

    /// Read the reference clock from this exchange.
    pub fn sample_reference(
        &self,
        clock: &mut dyn ClockSynchronizer,
    ) -> Result<Option<u32>, TransactionError> {
        self.expect("sample_reference", TxPhase::Processed)?;
        Ok(clock.sample_reference(&self.bus))
    }

    /// Hand the image's outputs to the bus for the next frame.
    pub fn queue(&mut self, image: &ProcessImage) -> Result<(), TransactionError> {
        self.expect("queue", TxPhase::Processed)?;
        self.check_image(image)?;
        let result = self.bus.queue_domain(self.domain, image.as_slice());
        self.absorb("queue", result)?;
        self.phase = TxPhase::Queued;
        Ok(())
    }

    /// Queue clock synchronisation datagrams into the outgoing frame.
    pub fn sync_clocks(
        &mut self,
        clock: &mut dyn ClockSynchronizer,
        app_time_ns: u64,
    ) -> Result<(), TransactionError> {
        self.expect("sync_clocks", TxPhase::Queued)?;
        clock.sync(&mut self.bus, app_time_ns);
        Ok(())
    }

    /// Transmit and close the cycle's transaction.
    pub fn send(&mut self) -> Result<HealthVerdict, TransactionError> {
        self.expect("send", TxPhase::Queued)?;
        let result = self.bus.send();
        self.absorb("send", result)?;
        let health = if self.transport_failed {
            ExchangeHealth::Missed
        } else {
            self.exchange
        };
        self.phase = TxPhase::Idle;
        Ok(self.health.evaluate(health))
    }

    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    pub fn domain(&self) -> DomainHandle {
        self.domain
    }

    pub fn domain_size(&self) -> usize {
        self.domain_size
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn health_mut(&mut self) -> &mut HealthMonitor {
        &mut self.health
    }

    pub fn stats(&self) -> &TransactionStats {
        self.health.stats()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Direct access for scripting a backend between cycles. Bypasses the
    /// phase ordering.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Release the master. The manager must not be used for cycles afterwards.
    pub fn release(&mut self) {
        self.bus.release();
    }
}
