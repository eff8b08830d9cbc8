//! Binary-search commissioning of short addresses.
//!
//! ## Procedure
//!
//! ```text
//! TERMINATE, INITIALISE ×2, RANDOMISE ×2, wait
//! loop:
//!   COMPARE at 0xFFFFFF      no answer → done
//!   binary search the lowest random address that still answers
//!   COMPARE at the result    no answer → retry (bounded)
//!   PROGRAM SHORT ADDRESS, VERIFY, WITHDRAW
//! TERMINATE
//! ```
//!
//! The same procedure runs in the control gear space (16-bit special
//! commands) and in the input device space (24-bit `0xC1` commands).

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Timer};

use crate::adapter::{BusTransport, DaliAdapter, Transaction};
use crate::addressing::{AddressSpace, LongAddress, ShortAddress};
use crate::error::Result;
use crate::protocol::commands::{
    AddressingOp, INITIALISE_ALL, INITIALISE_UNADDRESSED, INPUT_INITIALISE_ALL,
    INPUT_INITIALISE_UNADDRESSED,
};
use crate::protocol::constants::RANDOMISE_SETTLE_MS;

/// Consecutive failed verifications before the search is abandoned
const MAX_VERIFY_FAILURES: u8 = 3;

/// Which devices take part in commissioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitialiseScope {
    /// Every device, addressed or not (full re-addressing)
    All,
    /// Only devices without a short address
    Unaddressed,
}

impl InitialiseScope {
    /// `INITIALISE` argument for this scope in `space`.
    pub const fn data(self, space: AddressSpace) -> u8 {
        match (space, self) {
            (AddressSpace::ControlGear, InitialiseScope::All) => INITIALISE_ALL,
            (AddressSpace::ControlGear, InitialiseScope::Unaddressed) => INITIALISE_UNADDRESSED,
            (AddressSpace::InputDevice, InitialiseScope::All) => INPUT_INITIALISE_ALL,
            (AddressSpace::InputDevice, InitialiseScope::Unaddressed) => INPUT_INITIALISE_UNADDRESSED,
        }
    }
}

/// Result of one commissioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissioningReport {
    pub space: AddressSpace,
    /// Newly programmed devices, in the order they were found
    pub assigned: heapless::Vec<(LongAddress, ShortAddress), 64>,
    /// Devices found after the address space was full
    pub overflow: usize,
}

/// Runs the addressing procedure on one adapter
pub struct Commissioner<'a, M: RawMutex, T: BusTransport> {
    adapter: &'a DaliAdapter<M, T>,
}

impl<M: RawMutex, T: BusTransport> core::fmt::Debug for Commissioner<'_, M, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Commissioner").finish_non_exhaustive()
    }
}

impl<'a, M: RawMutex, T: BusTransport> Commissioner<'a, M, T> {
    pub fn new(adapter: &'a DaliAdapter<M, T>) -> Self {
        Self { adapter }
    }

    /// Assign short addresses to every device selected by `scope`.
    ///
    /// `occupied` is a mask of short addresses already in use (bit n =
    /// short n); new assignments always take the lowest free address.
    /// The bus stays locked for the whole run.
    pub async fn run(&self, scope: InitialiseScope, space: AddressSpace, occupied: u64) -> Result<CommissioningReport> {
        dali_log!(info, "Commissioning {:?} ({:?})", space, scope);
        let mut tx = self.adapter.transaction().await;
        let mut session = Session { tx: &mut tx, space };

        session.send_twice(AddressingOp::Terminate, 0).await?;
        session.send_twice(AddressingOp::Initialise, scope.data(space)).await?;
        session.send_twice(AddressingOp::Randomise, 0).await?;
        Timer::after(Duration::from_millis(RANDOMISE_SETTLE_MS)).await;

        let result = session.search_all(occupied).await;
        // Always leave initialisation state, even after a bus error
        let terminated = session.send(AddressingOp::Terminate, 0).await;
        let report = result?;
        terminated?;

        dali_log!(
            info,
            "Commissioning {:?} done: {} assigned, {} without address",
            space,
            report.assigned.len(),
            report.overflow
        );
        Ok(report)
    }
}

struct Session<'t, 'a, M: RawMutex, T: BusTransport> {
    tx: &'t mut Transaction<'a, M, T>,
    space: AddressSpace,
}

impl<M: RawMutex, T: BusTransport> Session<'_, '_, M, T> {
    async fn send(&mut self, op: AddressingOp, data: u8) -> Result<()> {
        match self.space {
            AddressSpace::ControlGear => self.tx.special(op.gear(), data).await,
            AddressSpace::InputDevice => self.tx.input_special(op.input(), data).await,
        }
    }

    async fn send_twice(&mut self, op: AddressingOp, data: u8) -> Result<()> {
        match self.space {
            AddressSpace::ControlGear => self.tx.special_twice(op.gear(), data).await,
            AddressSpace::InputDevice => {
                self.send(op, data).await?;
                self.send(op, data).await
            }
        }
    }

    async fn ask(&mut self, op: AddressingOp, data: u8) -> Result<bool> {
        let reply = match self.space {
            AddressSpace::ControlGear => self.tx.special_query(op.gear(), data).await?,
            AddressSpace::InputDevice => self.tx.input_special_query(op.input(), data).await?,
        };
        Ok(reply.is_some())
    }

    async fn compare_at(&mut self, address: u32) -> Result<bool> {
        let [_, high, mid, low] = address.to_be_bytes();
        self.send(AddressingOp::SearchH, high).await?;
        self.send(AddressingOp::SearchM, mid).await?;
        self.send(AddressingOp::SearchL, low).await?;
        self.ask(AddressingOp::Compare, 0).await
    }

    /// Lowest random address among devices still taking part.
    async fn find_lowest(&mut self) -> Result<Option<u32>> {
        if !self.compare_at(LongAddress::MAX).await? {
            return Ok(None);
        }
        let (mut low, mut high) = (0u32, LongAddress::MAX);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.compare_at(mid).await? {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        Ok(Some(low))
    }

    /// Short address argument of `PROGRAM` / `VERIFY SHORT ADDRESS`.
    fn short_data(&self, short: ShortAddress) -> u8 {
        match self.space {
            AddressSpace::ControlGear => (short.value() << 1) | 1,
            AddressSpace::InputDevice => short.value(),
        }
    }

    async fn search_all(&mut self, mut occupied: u64) -> Result<CommissioningReport> {
        let mut report = CommissioningReport {
            space: self.space,
            assigned: heapless::Vec::new(),
            overflow: 0,
        };
        let mut failures = 0u8;

        while let Some(found) = self.find_lowest().await? {
            // The search address already sits on `found` unless it was the top
            if !self.compare_at(found).await? {
                failures += 1;
                dali_log!(warn, "Verification of {:#x} failed ({}/{})", found, failures, MAX_VERIFY_FAILURES);
                if failures >= MAX_VERIFY_FAILURES {
                    dali_log!(error, "Commissioning aborted after repeated verification failures");
                    break;
                }
                continue;
            }
            failures = 0;
            let long = LongAddress::from_bytes((found >> 16) as u8, (found >> 8) as u8, found as u8);

            let Some(short) = ShortAddress::all().find(|s| occupied & s.mask_bit() == 0) else {
                dali_log!(warn, "No free short address for {}, withdrawing it unaddressed", long.to_hex().as_str());
                report.overflow += 1;
                self.send(AddressingOp::Withdraw, 0).await?;
                continue;
            };

            self.send(AddressingOp::ProgramShort, self.short_data(short)).await?;
            if !self.ask(AddressingOp::VerifyShort, self.short_data(short)).await? {
                dali_log!(warn, "Device {} did not confirm short address {}", long.to_hex().as_str(), short.value());
            }
            self.send(AddressingOp::Withdraw, 0).await?;

            occupied |= short.mask_bit();
            // Capacity equals the number of short addresses
            let _ = report.assigned.push((long, short));
            dali_log!(info, "Assigned short {} to {}", short.value(), long.to_hex().as_str());
        }
        Ok(report)
    }
}
