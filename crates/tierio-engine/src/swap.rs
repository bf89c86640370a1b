//! Crash-safe exchange of two physical sectors
//!
//! ```text
//!            backend a             backend b
//!          ┌───────────┐         ┌───────────┐
//!  A ────► │ sa        │         │ sb        │ ◄──── B
//!          │           │         │           │
//!          │ move-help │    ┌──► │ move-help │
//!          └───────────┘    │    └───────────┘
//!                           │
//!  1. A's data  → b.move-help, A points there
//!  2. B's data  → sa,          B points there
//!  3. A's data  → sb,          A points there
//! ```
//!
//! Every data write lands in a sector no persisted entry points at, and every
//! entry is persisted only after its data is in place. Whenever the process
//! stops, both sectors can be read through the persisted index; a sector left
//! on a move-help sector is relocated when the set is assembled again.
//!
//! A step that fails brings the first sector back off the move-help sector
//! before the error is returned. If that is impossible the sector stays
//! parked, and the next swap relocates it before reusing any move-help
//! sector.

use crate::state::EngineCore;
use bytes::Bytes;
use tierio_common::{Error, Result, SectorIndexEntry};
use tracing::{debug, error, warn};

/// Last completed step of a swap
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SwapStage {
    /// First sector's data is on the move-help sector
    ScratchWritten,
    /// First sector's entry points at the move-help sector
    ScratchPersisted,
    /// Second sector's data is at the first sector's old place
    SecondMoved,
    /// Second sector's entry points at its new place
    SecondPersisted,
    /// First sector's data is at the second sector's old place
    FirstMoved,
    /// Both entries point at their new places
    Complete,
}

impl EngineCore {
    /// Exchange the physical locations of two logical sectors
    ///
    /// Access counts travel with their sectors.
    pub async fn swap(&mut self, first: u64, second: u64) -> Result<()> {
        self.swap_until(first, second, SwapStage::Complete)
            .await
            .map(|_| ())
    }

    /// Run a swap up to and including `stop_after`, leaving the index
    /// exactly as an interruption at that point would
    pub async fn swap_until(
        &mut self,
        first: u64,
        second: u64,
        stop_after: SwapStage,
    ) -> Result<SwapStage> {
        if !self.parked_sectors().is_empty() {
            self.recover_scratch_sectors().await?;
        }

        let a = self.table.lookup(first)?;
        let b = self.table.lookup(second)?;
        if !a.is_used() || !b.is_used() {
            return Err(Error::invalid_argument(format!(
                "swap of {first} and {second} needs two used sectors"
            )));
        }
        if first == second {
            return Ok(SwapStage::Complete);
        }
        if (a.backend_id, a.physical_sector) == (b.backend_id, b.physical_sector) {
            return Err(Error::IndexCorruption(format!(
                "logical sectors {first} and {second} share {}:{}",
                a.backend(),
                a.physical_sector
            )));
        }

        let blocksize = self.blocksize() as usize;
        let backend_a = self.backend(a.backend())?;
        let backend_b = self.backend(b.backend())?;
        let scratch = backend_b.move_help_sector();
        if a.physical_sector == backend_a.move_help_sector() || b.physical_sector == scratch {
            return Err(Error::internal(format!(
                "cannot swap {first} and {second} while one is parked on a move-help sector"
            )));
        }

        let (data_a, data_b) = futures::try_join!(
            backend_a.read_sector(a.physical_sector, 0, blocksize),
            backend_b.read_sector(b.physical_sector, 0, blocksize),
        )?;

        let steps = [
            (
                SwapStage::ScratchWritten,
                SwapStage::ScratchPersisted,
                first,
                a.relocated(b.backend(), scratch),
                &data_a,
                &backend_b,
            ),
            (
                SwapStage::SecondMoved,
                SwapStage::SecondPersisted,
                second,
                b.relocated(a.backend(), a.physical_sector),
                &data_b,
                &backend_a,
            ),
            (
                SwapStage::FirstMoved,
                SwapStage::Complete,
                first,
                a.relocated(b.backend(), b.physical_sector),
                &data_a,
                &backend_b,
            ),
        ];

        for (written, persisted, logical, target, data, backend) in steps {
            if let Err(e) = backend.write_sector(target.physical_sector, 0, data).await {
                return Err(self.abandon_swap(first, second, a, b, &data_a, e).await);
            }
            if stop_after == written {
                return Ok(written);
            }

            if let Err(e) = self.place(logical, target).await {
                return Err(self.abandon_swap(first, second, a, b, &data_a, e).await);
            }
            if stop_after == persisted {
                return Ok(persisted);
            }
        }

        debug!(
            "swapped logical sectors {first} ({}:{}) and {second} ({}:{})",
            a.backend(),
            a.physical_sector,
            b.backend(),
            b.physical_sector
        );
        Ok(SwapStage::Complete)
    }

    /// Take the first sector of a failed swap off the move-help sector
    ///
    /// Its home is its own old place while the second sector has not moved
    /// there, and the second sector's old place after. Returns `error`.
    async fn abandon_swap(
        &mut self,
        first: u64,
        second: u64,
        a: SectorIndexEntry,
        b: SectorIndexEntry,
        data_a: &Bytes,
        error: Error,
    ) -> Error {
        let Ok(current) = self.table.lookup(first) else {
            return error;
        };
        let parked = self
            .backends
            .get(b.backend())
            .is_ok_and(|backend| backend.move_help_sector() == current.physical_sector);
        if current.backend() != b.backend() || !parked {
            return error;
        }

        let second_moved = self.table.lookup(second).is_ok_and(|entry| {
            (entry.backend_id, entry.physical_sector) == (a.backend_id, a.physical_sector)
        });
        let home = if second_moved { b } else { a };
        match self.restore(first, current, home, data_a).await {
            Ok(()) => {
                warn!(
                    "swap of {first} and {second} failed, {first} is back on {}:{}",
                    home.backend(),
                    home.physical_sector
                );
                return error;
            }
            Err(e) => warn!(
                "cannot put logical sector {first} back on {}:{}: {e}",
                home.backend(),
                home.physical_sector
            ),
        }

        let order = self.allocation_order();
        match self.free.take_first(&order) {
            Some((target, slot)) => match self.relocate(first, target, slot).await {
                Ok(()) => {}
                Err(e) => {
                    self.free.release(target, slot);
                    error!("logical sector {first} stays on a move-help sector: {e}");
                }
            },
            None => error!("logical sector {first} stays on a move-help sector, no free slot"),
        }
        // nothing points at home any more
        self.release_slot(home);
        error
    }

    async fn restore(
        &self,
        logical: u64,
        current: SectorIndexEntry,
        home: SectorIndexEntry,
        data: &Bytes,
    ) -> Result<()> {
        self.backend(home.backend())?
            .write_sector(home.physical_sector, 0, data)
            .await?;
        self.place(logical, current.relocated(home.backend(), home.physical_sector))
            .await
    }
}
