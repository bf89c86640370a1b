//! Adding and removing backends
//!
//! A backend without a header joins by growing the set: the header region
//! is resized so the index covers every data slot, sectors sitting in the
//! part of the old data area the header now claims are moved out, and every
//! backend gets the new header.
//!
//! A backend with a header rejoins the set it was part of. The first one
//! added after a restart supplies the index; the others must follow in
//! ordinal order and are checked against it. Once every recorded member is
//! back the set is assembled and normal operation resumes.

use crate::state::EngineCore;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tierio_common::config::BackendConfig;
use tierio_common::{BackendId, Error, Result, SectorIndexEntry};
use tierio_plugin::RemoteBackend;
use tierio_storage::layout::parse_entries;
use tierio_storage::{
    Backend, BackendHandle, FreeSlots, HEADER_RECORD_SIZE, HeaderProbe, HeaderRecord,
    LocalBackend, solve_geometry,
};
use tracing::{error, info, warn};

/// Smallest usable backend: one header, one data and one move-help sector
const MIN_BACKEND_SECTORS: u64 = 3;

/// Where a new backend comes from
#[derive(Clone)]
pub enum BackendDescriptor {
    /// File or block device
    Local {
        path: PathBuf,
        /// Create or grow a file to this many bytes
        create_size: Option<u64>,
        direct_io: bool,
    },
    /// Store served by a registered plugin
    Remote { name: String },
    /// Any other [`Backend`] implementation
    Device(Arc<dyn Backend>),
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local {
                path,
                create_size,
                direct_io,
            } => f
                .debug_struct("Local")
                .field("path", path)
                .field("create_size", create_size)
                .field("direct_io", direct_io)
                .finish(),
            Self::Remote { name } => f.debug_struct("Remote").field("name", name).finish(),
            Self::Device(device) => f.debug_tuple("Device").field(&device.name()).finish(),
        }
    }
}

impl BackendDescriptor {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        match (&config.path, &config.plugin) {
            (Some(path), None) => Ok(Self::Local {
                path: path.clone(),
                create_size: config.create_size,
                direct_io: config.direct_io,
            }),
            (None, Some(name)) => Ok(Self::Remote { name: name.clone() }),
            _ => Err(Error::Configuration(
                "a backend needs exactly one of `path` or `plugin`".into(),
            )),
        }
    }
}

impl EngineCore {
    async fn open_descriptor(&self, descriptor: BackendDescriptor) -> Result<Arc<dyn Backend>> {
        match descriptor {
            BackendDescriptor::Local {
                path,
                create_size,
                direct_io,
            } => {
                let device = match create_size {
                    Some(size) => LocalBackend::create(&path, size, direct_io)?,
                    None => LocalBackend::open(&path, direct_io)?,
                };
                Ok(Arc::new(device))
            }
            BackendDescriptor::Remote { name } => {
                let rpc = self.rpc.as_ref().ok_or_else(|| {
                    Error::Configuration(format!(
                        "remote backend '{name}' needs the plugin listener"
                    ))
                })?;
                let backend = RemoteBackend::new(name.clone(), Arc::clone(rpc));
                if !backend.is_ready() {
                    return Err(Error::NotReady(format!("plugin '{name}' is not registered")));
                }
                Ok(Arc::new(backend))
            }
            BackendDescriptor::Device(device) => Ok(device),
        }
    }

    /// Add a backend to the set
    pub async fn add_backend(&mut self, descriptor: BackendDescriptor) -> Result<BackendId> {
        let max = self.config.max_backends;
        if self.backends.len() >= max {
            return Err(Error::BackendLimit { max });
        }

        let device = self.open_descriptor(descriptor).await?;
        let handle = Arc::new(
            BackendHandle::new(device, self.blocksize(), self.config.measure_shift).await?,
        );
        if handle.capacity_sectors() < MIN_BACKEND_SECTORS {
            return Err(Error::CapacityExceeded {
                required: MIN_BACKEND_SECTORS,
                available: handle.capacity_sectors(),
            });
        }

        let head = handle.read_at(0, HEADER_RECORD_SIZE).await?;
        let record = match HeaderRecord::probe(&head)? {
            HeaderProbe::Fresh => None,
            HeaderProbe::Compatible(record) => Some(record),
            HeaderProbe::Newer(record) => {
                warn!(
                    "backend {} has header version {}.{}, newer than this engine; using it best-effort",
                    handle.name(),
                    record.version_major,
                    record.version_minor
                );
                Some(record)
            }
        };

        match record {
            Some(record) if self.backends.is_empty() => self.load_first_member(handle, &record).await,
            Some(record) if !self.is_assembled() => self.rejoin_member(handle, &record).await,
            Some(record) => {
                warn!(
                    "backend {} carries a header of another set (member {} of {}), reinitializing it",
                    handle.name(),
                    record.ordinal,
                    record.member_count
                );
                self.grow_with(handle).await
            }
            None if !self.is_assembled() => Err(Error::HeaderIncompatible(format!(
                "backend {} has no header while member {} of {} is still missing",
                handle.name(),
                self.backends.len() + 1,
                self.expected_members.unwrap_or_default()
            ))),
            None => self.grow_with(handle).await,
        }
    }

    async fn read_index(
        &self,
        handle: &BackendHandle,
        record: &HeaderRecord,
    ) -> Result<Vec<SectorIndexEntry>> {
        record.validate(self.blocksize(), handle.capacity_sectors())?;
        let region_len = usize::try_from(record.header_sector_count * u64::from(self.blocksize()))
            .map_err(|_| Error::HeaderIncompatible("header region too large".into()))?;
        let region = handle.read_at(0, region_len).await?;
        let entries = parse_entries(&region[HEADER_RECORD_SIZE..], record.logical_sector_count)?;

        let members = record.member_count.max(record.ordinal);
        if let Some((logical, entry)) = entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.is_used() && e.backend_id > members)
        {
            return Err(Error::IndexCorruption(format!(
                "logical sector {logical} on {} points at backend {} of a {members} member set",
                handle.name(),
                entry.backend_id
            )));
        }
        Ok(entries)
    }

    /// First backend after a restart: its index becomes the table
    async fn load_first_member(
        &mut self,
        handle: Arc<BackendHandle>,
        record: &HeaderRecord,
    ) -> Result<BackendId> {
        if record.ordinal != 1 {
            return Err(Error::HeaderIncompatible(format!(
                "{} is member {} of {}; add the members in order starting with member 1",
                handle.name(),
                record.ordinal,
                record.member_count
            )));
        }
        let entries = self.read_index(&handle, record).await?;

        self.table
            .set_geometry(record.header_sector_count, record.logical_sector_count)?;
        self.table.load(&entries)?;
        handle.restore_performance(record.performance);
        let id = self.backends.push(handle);
        self.expected_members = Some(usize::from(record.member_count.max(1)));

        info!(
            "loaded index from backend {id} ({}): {} logical sectors, {} header sectors, {} members",
            self.backends.get(id)?.name(),
            record.logical_sector_count,
            record.header_sector_count,
            record.member_count
        );
        self.finish_assembly().await?;
        Ok(id)
    }

    /// Further member of a set being reassembled
    async fn rejoin_member(
        &mut self,
        handle: Arc<BackendHandle>,
        record: &HeaderRecord,
    ) -> Result<BackendId> {
        let expected = self.backends.len() + 1;
        if usize::from(record.ordinal) != expected {
            return Err(Error::HeaderIncompatible(format!(
                "expected member {expected}, {} is member {}",
                handle.name(),
                record.ordinal
            )));
        }
        if record.header_sector_count != self.table.header_sector_count()
            || record.logical_sector_count != self.table.logical_sector_count()
        {
            return Err(Error::HeaderIncompatible(format!(
                "{} describes {} logical / {} header sectors, the set has {} / {}",
                handle.name(),
                record.logical_sector_count,
                record.header_sector_count,
                self.table.logical_sector_count(),
                self.table.header_sector_count()
            )));
        }

        let theirs = self.read_index(&handle, record).await?;
        let corrected = self.reconcile(BackendId::new(record.ordinal), &theirs)?;
        if corrected > 0 {
            error!(
                "{}",
                Error::IndexCorruption(format!(
                    "{} disagrees with the loaded index on {corrected} of its sectors; using its own entries",
                    handle.name()
                ))
            );
        }

        handle.restore_performance(record.performance);
        let id = self.backends.push(handle);
        info!(
            "backend {id} ({}) rejoined ({} of {} members)",
            self.backends.get(id)?.name(),
            self.backends.len(),
            self.expected_members.unwrap_or_default()
        );
        self.finish_assembly().await?;
        Ok(id)
    }

    /// Merge a member's copy of the index into the table
    ///
    /// A backend is the authority on entries that place a sector on it,
    /// whichever copy says so. Returns the number of entries taken from
    /// `theirs`.
    fn reconcile(&self, member: BackendId, theirs: &[SectorIndexEntry]) -> Result<u64> {
        let ours = self.table.entries();
        let mut corrected = 0;
        for (logical, (mine, other)) in ours.iter().zip(theirs).enumerate() {
            let same_place = (mine.backend_id, mine.physical_sector)
                == (other.backend_id, other.physical_sector);
            if same_place || (mine.backend() != member && other.backend() != member) {
                continue;
            }
            self.table.set(logical as u64, *other)?;
            corrected += 1;
        }
        Ok(corrected)
    }

    async fn finish_assembly(&mut self) -> Result<()> {
        if let Some(expected) = self.expected_members {
            if self.backends.len() < expected {
                info!(
                    "waiting for {} more members before resuming",
                    expected - self.backends.len()
                );
                return Ok(());
            }
        }

        self.expected_members = None;
        self.free = FreeSlots::rebuild(&self.table, &self.backends);
        self.recover_scratch_sectors().await?;
        self.table.write_all_headers(&self.backends).await;
        self.optimizer.invalidate();
        info!(
            "backend set assembled: {} members, {} logical sectors, {} free slots",
            self.backends.len(),
            self.table.logical_sector_count(),
            self.free.total_free()
        );
        Ok(())
    }

    /// Add a backend without a usable header, growing the logical space
    async fn grow_with(&mut self, handle: Arc<BackendHandle>) -> Result<BackendId> {
        let header_old = self.table.header_sector_count();
        let logical_old = self.table.logical_sector_count();

        let mut capacities = self.backends.capacities();
        capacities.push(handle.capacity_sectors());
        let geometry = solve_geometry(&capacities, header_old, self.blocksize())?;
        if geometry.logical_sectors < logical_old {
            return Err(Error::CapacityExceeded {
                required: logical_old,
                available: geometry.logical_sectors,
            });
        }

        let id = self.backends.push(Arc::clone(&handle));
        let installed = match self
            .table
            .set_geometry(geometry.header_sectors, geometry.logical_sectors)
        {
            Ok(()) => self.table.write_header(&handle, self.backends.len()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            self.backends.remove(id)?;
            self.table.set_geometry(header_old, logical_old)?;
            return Err(e);
        }

        self.free = FreeSlots::rebuild(&self.table, &self.backends);
        if geometry.header_sectors > header_old && header_old > 0 {
            self.relocate_header_band(header_old, geometry.header_sectors, id)
                .await?;
        }
        if geometry.header_sectors > header_old {
            self.table.write_all_headers(&self.backends).await;
        } else {
            for backend in self.backends.iter().filter(|b| b.id() != id && b.is_ready()) {
                if let Err(e) = self.table.write_record(backend, self.backends.len()).await {
                    warn!("header record of backend {} not updated: {e}", backend.id());
                }
            }
        }
        self.optimizer.invalidate();

        info!(
            "backend {id} ({}) added: {} sectors, header {} sectors, {} logical sectors",
            handle.name(),
            handle.capacity_sectors(),
            geometry.header_sectors,
            geometry.logical_sectors
        );
        Ok(id)
    }

    /// Move every sector stored in `[from, to)` of an existing backend, the
    /// range the grown header now occupies
    async fn relocate_header_band(&mut self, from: u64, to: u64, added: BackendId) -> Result<()> {
        let banded: Vec<u64> = self
            .table
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.is_used()
                    && e.backend() != added
                    && (from..to).contains(&e.physical_sector)
            })
            .map(|(logical, _)| logical as u64)
            .collect();

        if !banded.is_empty() {
            info!(
                "header grows from {from} to {to} sectors, moving {} sectors out of the way",
                banded.len()
            );
        }
        for logical in banded {
            let order = self.allocation_order();
            let Some((target, slot)) = self.free.take_first(&order) else {
                return Err(Error::CapacityExceeded {
                    required: 1,
                    available: 0,
                });
            };
            if let Err(e) = self.relocate(logical, target, slot).await {
                self.free.release(target, slot);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove a backend, moving its sectors onto the others
    ///
    /// The logical space shrinks by the backend's contribution; sectors past
    /// the new end are dropped. Nothing is dropped before every sector below
    /// the new end is off the backend, so a failed removal loses no data and
    /// can be run again.
    pub async fn remove_backend(&mut self, id: BackendId) -> Result<()> {
        let handle = Arc::clone(self.backends.get(id)?);
        if !handle.is_ready() {
            return Err(Error::NotReady(format!(
                "backend {id} ({}) must be reachable to be removed",
                handle.name()
            )));
        }
        if !self.is_assembled() {
            return Err(Error::NotReady(
                "the backend set is still being reassembled".into(),
            ));
        }
        if !self.parked_sectors().is_empty() {
            self.recover_scratch_sectors().await?;
        }

        let header = self.table.header_sector_count();
        let logical_old = self.table.logical_sector_count();
        let contribution = handle.capacity_sectors().saturating_sub(header + 1);
        let logical_new = logical_old.saturating_sub(contribution);

        let order: Vec<BackendId> = self
            .allocation_order()
            .into_iter()
            .filter(|&b| b != id)
            .collect();
        // tail sectors elsewhere trade places with sectors that must leave
        let mut partners = (logical_new..logical_old).rev();
        let mut moved = 0u64;
        for logical in (0..logical_new).rev() {
            let entry = self.table.lookup(logical)?;
            if !entry.is_used() || entry.backend() != id {
                continue;
            }
            if let Some((target, slot)) = self.free.take_first(&order) {
                if let Err(e) = self.relocate(logical, target, slot).await {
                    self.free.release(target, slot);
                    return Err(e);
                }
            } else {
                let Some(partner) = self.next_partner(&mut partners, id)? else {
                    return Err(Error::CapacityExceeded {
                        required: self.table.count_on(id),
                        available: 0,
                    });
                };
                self.swap(logical, partner).await?;
            }
            moved += 1;
        }

        let mut dropped = 0u64;
        for logical in logical_new..logical_old {
            let entry = self.table.lookup(logical)?;
            if entry.is_used() {
                self.place(logical, SectorIndexEntry::UNUSED).await?;
                self.release_slot(entry);
                dropped += 1;
            }
        }

        self.backends.remove(id)?;
        self.table.close_id_gap(id);
        self.table.set_geometry(header, logical_new)?;
        self.table.write_all_headers(&self.backends).await;
        if let Err(e) = handle.write_at(0, &[0u8; HEADER_RECORD_SIZE]).await {
            warn!("could not clear the header of removed backend {}: {e}", handle.name());
        }
        self.free = FreeSlots::rebuild(&self.table, &self.backends);
        self.optimizer.invalidate();

        if dropped > 0 {
            warn!("{dropped} sectors past the new end of the device were dropped");
        }
        info!(
            "backend {id} ({}) removed: {moved} sectors moved, {logical_new} logical sectors remain",
            handle.name()
        );
        Ok(())
    }

    /// Next used tail sector that is not on `id`
    fn next_partner(
        &self,
        partners: &mut impl Iterator<Item = u64>,
        id: BackendId,
    ) -> Result<Option<u64>> {
        for logical in partners {
            let entry = self.table.lookup(logical)?;
            if entry.is_used() && entry.backend() != id {
                return Ok(Some(logical));
            }
        }
        Ok(None)
    }
}
