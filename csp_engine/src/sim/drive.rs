//! Simulated CiA 402 servo drive in cyclic synchronous position mode.

use std::collections::VecDeque;

use csp_common::consts::{MODE_CSP, OBJ_CONTROL_WORD, OBJ_MODES_OF_OPERATION};
use csp_common::device::{DeviceIdentity, DeviceState};

/// Statusword reported while following setpoints ("Operation enabled").
pub const STATUS_OPERATION_ENABLED: u16 = 0x0237;
/// Statusword reported otherwise ("Switch on disabled").
pub const STATUS_SWITCH_ON_DISABLED: u16 = 0x0250;

const ENABLE_OPERATION_MASK: u16 = 0x000F;

/// One drive on the simulated bus.
///
/// Each exchange it takes part in moves it one step closer to OP, spending
/// `op_after` exchanges in every intermediate state, unless it is held at
/// a lower state with [`stuck_at`](Self::stuck_at). In OP with operation
/// enabled the actual position follows the last target, or the next
/// scripted value when one is queued.
#[derive(Debug, Clone)]
pub struct SimDrive {
    identity: DeviceIdentity,
    state: DeviceState,
    max_state: DeviceState,
    op_after: u32,
    exchanges_in_state: u32,
    actual_position: i32,
    control_word: u16,
    target_position: i32,
    mode: i8,
    script: VecDeque<i32>,
    reject_sdo: bool,
    sdo_writes: Vec<(u16, u8, Vec<u8>)>,
}

impl SimDrive {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: DeviceState::Init,
            max_state: DeviceState::Op,
            op_after: 3,
            exchanges_in_state: 0,
            actual_position: 0,
            control_word: 0,
            target_position: 0,
            mode: 0,
            script: VecDeque::new(),
            reject_sdo: false,
            sdo_writes: Vec::new(),
        }
    }

    /// Exchanges spent in each state on the way up (at least one).
    pub fn with_op_after(mut self, exchanges: u32) -> Self {
        self.op_after = exchanges.max(1);
        self
    }

    pub fn with_position(mut self, position: i32) -> Self {
        self.actual_position = position;
        self
    }

    /// Never advance beyond `state`.
    pub fn stuck_at(&mut self, state: DeviceState) {
        self.max_state = state;
        if rank(self.state) > rank(state) {
            self.state = state;
            self.exchanges_in_state = 0;
        }
    }

    /// Allow progression up to OP again.
    pub fn release_hold(&mut self) {
        self.max_state = DeviceState::Op;
    }

    /// Queue measured positions reported on the following OP exchanges.
    pub fn script_positions(&mut self, positions: impl IntoIterator<Item = i32>) {
        self.script.extend(positions);
    }

    /// Answer every SDO download with an abort.
    pub fn reject_sdo(&mut self, reject: bool) {
        self.reject_sdo = reject;
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn actual_position(&self) -> i32 {
        self.actual_position
    }

    pub fn control_word(&self) -> u16 {
        self.control_word
    }

    pub fn target_position(&self) -> i32 {
        self.target_position
    }

    pub fn mode(&self) -> i8 {
        self.mode
    }

    /// SDO downloads accepted so far: `(index, subindex, data)`.
    pub fn sdo_writes(&self) -> &[(u16, u8, Vec<u8>)] {
        &self.sdo_writes
    }

    pub fn is_operation_enabled(&self) -> bool {
        self.state == DeviceState::Op
            && self.control_word & ENABLE_OPERATION_MASK == ENABLE_OPERATION_MASK
            && self.mode == MODE_CSP as i8
    }

    pub fn status_word(&self) -> u16 {
        if self.is_operation_enabled() {
            STATUS_OPERATION_ENABLED
        } else {
            STATUS_SWITCH_ON_DISABLED
        }
    }

    /// Inputs are valid from SAFEOP.
    pub fn inputs_valid(&self) -> bool {
        matches!(self.state, DeviceState::SafeOp | DeviceState::Op)
    }

    /// Working counter contribution of one LRW exchange: read and write
    /// in OP, read only in SAFEOP.
    pub fn working_counter(&self) -> u16 {
        match self.state {
            DeviceState::Op => 3,
            DeviceState::SafeOp => 1,
            _ => 0,
        }
    }

    pub(crate) fn sdo_download(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<(), String> {
        if self.reject_sdo {
            return Err("abort 0x06010002 (attempt to write a read only object)".to_string());
        }
        let mut raw = [0u8; 4];
        let n = data.len().min(4);
        raw[..n].copy_from_slice(&data[..n]);
        match index {
            OBJ_MODES_OF_OPERATION => self.mode = raw[0] as i8,
            OBJ_CONTROL_WORD => self.control_word = u16::from_le_bytes([raw[0], raw[1]]),
            _ => {}
        }
        self.sdo_writes.push((index, subindex, data.to_vec()));
        Ok(())
    }

    /// Outputs only take effect in OP.
    pub(crate) fn apply_outputs(&mut self, control_word: Option<u16>, target_position: Option<i32>) {
        if self.state != DeviceState::Op {
            return;
        }
        if let Some(cw) = control_word {
            self.control_word = cw;
        }
        if let Some(tp) = target_position {
            self.target_position = tp;
        }
    }

    /// One exchange passes through the drive.
    pub(crate) fn step(&mut self) {
        if self.state == DeviceState::Op {
            if let Some(p) = self.script.pop_front() {
                self.actual_position = p;
            } else if self.is_operation_enabled() {
                self.actual_position = self.target_position;
            }
        }

        if rank(self.state) < rank(self.max_state) {
            self.exchanges_in_state += 1;
            if self.exchanges_in_state >= self.op_after {
                self.state = next(self.state);
                self.exchanges_in_state = 0;
            }
        }
    }
}

fn rank(state: DeviceState) -> u8 {
    match state {
        DeviceState::Unknown => 0,
        DeviceState::Init => 1,
        DeviceState::PreOp => 2,
        DeviceState::SafeOp => 3,
        DeviceState::Op => 4,
    }
}

fn next(state: DeviceState) -> DeviceState {
    match state {
        DeviceState::Unknown | DeviceState::Init => DeviceState::PreOp,
        DeviceState::PreOp => DeviceState::SafeOp,
        DeviceState::SafeOp | DeviceState::Op => DeviceState::Op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> SimDrive {
        SimDrive::new(DeviceIdentity { vendor_id: 0x7595, product_code: 0 }).with_op_after(2)
    }

    fn enable(d: &mut SimDrive) {
        d.sdo_download(OBJ_MODES_OF_OPERATION, 0, &[MODE_CSP]).unwrap();
    }

    #[test]
    fn climbs_to_op_in_steps() {
        let mut d = drive();
        let mut seen = vec![d.state()];
        for _ in 0..8 {
            d.step();
            if seen.last() != Some(&d.state()) {
                seen.push(d.state());
            }
        }
        assert_eq!(
            seen,
            vec![DeviceState::Init, DeviceState::PreOp, DeviceState::SafeOp, DeviceState::Op]
        );
    }

    #[test]
    fn stuck_drive_never_reaches_op() {
        let mut d = drive();
        d.stuck_at(DeviceState::SafeOp);
        for _ in 0..100 {
            d.step();
        }
        assert_eq!(d.state(), DeviceState::SafeOp);
        assert_eq!(d.working_counter(), 1);
        d.release_hold();
        d.step();
        d.step();
        assert_eq!(d.state(), DeviceState::Op);
        assert_eq!(d.working_counter(), 3);
    }

    #[test]
    fn follows_target_when_enabled() {
        let mut d = drive().with_position(100);
        enable(&mut d);
        for _ in 0..6 {
            d.step();
        }
        assert_eq!(d.state(), DeviceState::Op);
        d.apply_outputs(Some(0x0F), Some(5100));
        assert_eq!(d.status_word(), STATUS_OPERATION_ENABLED);
        d.step();
        assert_eq!(d.actual_position(), 5100);

        // Disabled: position holds.
        d.apply_outputs(Some(0x06), Some(9999));
        d.step();
        assert_eq!(d.actual_position(), 5100);
        assert_eq!(d.status_word(), STATUS_SWITCH_ON_DISABLED);
    }

    #[test]
    fn outputs_ignored_before_op() {
        let mut d = drive();
        d.apply_outputs(Some(0x0F), Some(1234));
        assert_eq!(d.control_word(), 0);
        assert_eq!(d.target_position(), 0);
    }

    #[test]
    fn scripted_positions_win() {
        let mut d = drive();
        enable(&mut d);
        d.script_positions([100_000, 100_000]);
        for _ in 0..6 {
            d.step();
        }
        d.apply_outputs(Some(0x0F), Some(7));
        d.step();
        assert_eq!(d.actual_position(), 100_000);
        d.step();
        assert_eq!(d.actual_position(), 100_000);
        d.step();
        assert_eq!(d.actual_position(), 7);
    }

    #[test]
    fn sdo_download_sets_mode_and_control_word() {
        let mut d = drive();
        d.sdo_download(OBJ_CONTROL_WORD, 0, &[0x80, 0x00]).unwrap();
        assert_eq!(d.control_word(), 0x80);
        d.sdo_download(OBJ_MODES_OF_OPERATION, 0, &[0x08]).unwrap();
        assert_eq!(d.mode(), 8);
        assert_eq!(d.sdo_writes().len(), 2);

        d.reject_sdo(true);
        assert!(d.sdo_download(OBJ_CONTROL_WORD, 0, &[0x0F, 0x00]).is_err());
        assert_eq!(d.sdo_writes().len(), 2);
    }
}
