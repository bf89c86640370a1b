//! State owned by the engine worker
//!
//! Exactly one task owns an [`EngineCore`]; every client request, membership
//! change and tiering step runs to completion against it before the next one
//! starts. That makes the index, the free slots and the backend set
//! consistent at every await point the worker does not itself interleave.

use crate::sector::SectorMapper;
use crate::tiering::TieringOptimizer;
use std::sync::Arc;
use tierio_common::config::{EngineConfig, TieringConfig};
use tierio_common::{BackendId, Config, Error, Result, SectorIndexEntry};
use tierio_plugin::RpcClient;
use tierio_storage::{BackendHandle, BackendSet, FreeSlots, IndexTable};
use tracing::{debug, warn};

pub struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) tiering: TieringConfig,
    pub(crate) table: IndexTable,
    pub(crate) backends: BackendSet,
    pub(crate) free: FreeSlots,
    pub(crate) optimizer: TieringOptimizer,
    pub(crate) mapper: SectorMapper,
    pub(crate) rpc: Option<Arc<RpcClient>>,
    /// Member count of the header the index was loaded from
    pub(crate) expected_members: Option<usize>,
}

impl EngineCore {
    pub fn new(config: &Config, rpc: Option<Arc<RpcClient>>) -> Self {
        let engine = config.engine.clone();
        Self {
            table: IndexTable::new(engine.blocksize, engine.cache_percent, engine.rescale_floor),
            mapper: SectorMapper::new(engine.blocksize),
            optimizer: TieringOptimizer::new(config.tiering.sort_slice()),
            tiering: config.tiering.clone(),
            backends: BackendSet::new(),
            free: FreeSlots::default(),
            rpc,
            expected_members: None,
            config: engine,
        }
    }

    pub const fn blocksize(&self) -> u32 {
        self.config.blocksize
    }

    /// Every member recorded in the loaded header has been added again
    pub fn is_assembled(&self) -> bool {
        self.expected_members
            .is_none_or(|members| self.backends.len() >= members)
    }

    /// Bytes exposed to clients
    pub fn logical_bytes(&self) -> u64 {
        self.table.logical_sector_count() * u64::from(self.blocksize())
    }

    /// Backend by id; a member that has not been added yet is unreachable
    pub(crate) fn backend(&self, id: BackendId) -> Result<Arc<BackendHandle>> {
        self.backends.get(id).cloned().map_err(surface)
    }

    /// Ready backends, fastest first
    pub(crate) fn allocation_order(&self) -> Vec<BackendId> {
        self.backends
            .ranked()
            .into_iter()
            .filter(|&id| self.backends.get(id).is_ok_and(|b| b.is_ready()))
            .collect()
    }

    /// Whether `sector` on `backend` is a data slot the free sets track
    pub(crate) fn is_data_slot(&self, backend: &BackendHandle, sector: u64) -> bool {
        sector >= self.table.header_sector_count() && sector < backend.move_help_sector()
    }

    /// Put a physical sector back into the free set of its backend
    pub(crate) fn release_slot(&mut self, entry: SectorIndexEntry) {
        if !entry.is_used() {
            return;
        }
        let Ok(backend) = self.backends.get(entry.backend()) else {
            return;
        };
        if self.is_data_slot(backend, entry.physical_sector) {
            self.free.release(entry.backend(), entry.physical_sector);
        }
    }

    /// Replace an entry and persist it to every ready backend
    pub(crate) async fn place(&self, logical: u64, entry: SectorIndexEntry) -> Result<()> {
        self.table
            .update(logical, entry, Some(&self.backends))
            .await
    }

    /// Count one access to `logical`
    pub(crate) async fn record_access(&self, logical: u64) -> Result<()> {
        if !self.table.lookup(logical)?.is_used() {
            return Ok(());
        }
        let rescaled = self.table.bump_access_count(logical)?;
        if !self.config.persist_access_counts {
            return Ok(());
        }
        if rescaled {
            self.table.write_all_headers(&self.backends).await;
        } else {
            self.table.persist(logical, &self.backends).await;
        }
        Ok(())
    }

    /// Copy a sector to `(target, slot)` and repoint its entry
    ///
    /// The old location stays intact until the entry is persisted, so an
    /// interrupted move leaves the sector readable at one of the two places.
    pub(crate) async fn relocate(
        &mut self,
        logical: u64,
        target: BackendId,
        slot: u64,
    ) -> Result<()> {
        let entry = self.table.lookup(logical)?;
        if !entry.is_used() {
            return Err(Error::internal(format!(
                "relocating unused logical sector {logical}"
            )));
        }

        let source = self.backend(entry.backend())?;
        let destination = self.backend(target)?;
        let data = source
            .read_sector(entry.physical_sector, 0, self.blocksize() as usize)
            .await?;
        destination.write_sector(slot, 0, &data).await?;

        self.place(logical, entry.relocated(target, slot)).await?;
        self.release_slot(entry);
        debug!(
            "moved logical sector {logical} from {}:{} to {target}:{slot}",
            entry.backend(),
            entry.physical_sector
        );
        Ok(())
    }

    /// Used logical sectors whose entry points at a move-help sector
    pub(crate) fn parked_sectors(&self) -> Vec<u64> {
        self.table
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.is_used()
                    && self
                        .backends
                        .get(entry.backend())
                        .is_ok_and(|b| b.move_help_sector() == entry.physical_sector)
            })
            .map(|(logical, _)| logical as u64)
            .collect()
    }

    /// Relocate every sector parked on a move-help sector to a free slot
    pub(crate) async fn recover_scratch_sectors(&mut self) -> Result<()> {
        let parked = self.parked_sectors();
        for logical in parked {
            let order = self.allocation_order();
            let Some((target, slot)) = self.free.take_first(&order) else {
                return Err(Error::CapacityExceeded {
                    required: 1,
                    available: 0,
                });
            };
            warn!("logical sector {logical} was left on a move-help sector, relocating");
            if let Err(e) = self.relocate(logical, target, slot).await {
                self.free.release(target, slot);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Errors as clients see them: a backend that cannot serve the request right
/// now is unreachable, whatever the reason
pub(crate) fn surface(error: Error) -> Error {
    match error {
        Error::NotReady(name) => Error::BackendUnreachable(name),
        Error::Timeout => Error::BackendUnreachable("request timed out".into()),
        Error::BackendNotFound(id) => {
            Error::BackendUnreachable(format!("backend {id} has not been added yet"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_maps_transient_errors() {
        assert!(matches!(
            surface(Error::NotReady("a".into())),
            Error::BackendUnreachable(_)
        ));
        assert!(matches!(
            surface(Error::BackendNotFound(3)),
            Error::BackendUnreachable(_)
        ));
        assert!(matches!(
            surface(Error::OutOfRange { sector: 1, count: 1 }),
            Error::OutOfRange { .. }
        ));
    }

    #[test]
    fn test_new_core_is_empty_and_assembled() {
        let core = EngineCore::new(&Config::default(), None);
        assert!(core.is_assembled());
        assert_eq!(core.logical_bytes(), 0);
        assert!(core.backends.is_empty());
    }
}
