//! Adding, removing and reassembling backends

mod common;

use common::{BLOCKSIZE, MemoryBackend, device, fill, pattern, test_config, verify};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tierio_common::{BackendId, Error};
use tierio_engine::{BackendDescriptor, Engine, SwapStage};

const SIZES: [u64; 3] = [100, 50, 20];

fn local(dir: &Path, index: usize, create: bool) -> BackendDescriptor {
    BackendDescriptor::Local {
        path: dir.join(format!("backend{index}.img")),
        create_size: create.then(|| SIZES[index] * u64::from(BLOCKSIZE)),
        direct_io: false,
    }
}

/// Create a three member set of files, fill it and shut it down
async fn build_local_set(dir: &Path) -> u64 {
    let engine = Engine::start(&test_config(), None).unwrap();
    for index in 0..SIZES.len() {
        engine.add_backend(local(dir, index, true)).await.unwrap();
    }
    let logical = engine.stats().await.unwrap().logical_sectors;
    fill(&engine, logical).await;
    engine.shutdown().await.unwrap();
    logical
}

async fn reassemble(dir: &Path) -> Engine {
    let engine = Engine::start(&test_config(), None).unwrap();
    for index in 0..SIZES.len() {
        let id = engine.add_backend(local(dir, index, false)).await.unwrap();
        assert_eq!(id, BackendId::from_index(index));
    }
    engine
}

/// No entry points at a move-help sector and no two entries share a place
async fn assert_placement_sane(engine: &Engine) {
    let stats = engine.stats().await.unwrap();
    let entries = engine.all_sector_info().await.unwrap();
    let mut places = Vec::new();
    for (logical, entry) in entries.iter().enumerate().filter(|(_, e)| e.is_used()) {
        let backend = &stats.backends[entry.backend().index()];
        assert!(
            entry.physical_sector >= stats.header_sectors
                && entry.physical_sector < backend.capacity_sectors - 1,
            "logical sector {logical} at {}:{}",
            entry.backend_id,
            entry.physical_sector
        );
        places.push((entry.backend_id, entry.physical_sector));
    }
    let used = places.len();
    places.sort_unstable();
    places.dedup();
    assert_eq!(places.len(), used, "two logical sectors share a physical sector");
}

#[tokio::test]
async fn test_remove_middle_backend() {
    let engine = Engine::start(&test_config(), None).unwrap();
    let backends: Vec<_> = SIZES
        .iter()
        .enumerate()
        .map(|(i, &size)| MemoryBackend::new(&format!("mem{i}"), size, Duration::ZERO))
        .collect();
    for backend in &backends {
        engine.add_backend(device(backend)).await.unwrap();
    }
    fill(&engine, 155).await;

    engine.remove_backend(BackendId::new(2)).await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.logical_sectors, 110);
    let names: Vec<_> = stats.backends.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, ["mem0", "mem2"]);
    assert_eq!(stats.backends[1].id, BackendId::new(2));

    let entries = engine.all_sector_info().await.unwrap();
    assert_eq!(entries.len(), 110);
    assert!(entries.iter().all(|e| e.backend_id == 1 || e.backend_id == 2));
    verify(&engine, 110).await;
    assert_placement_sane(&engine).await;

    // the removed backend no longer carries a header and can join as new
    assert!(backends[1].head(128).iter().all(|&b| b == 0));
    assert_eq!(
        engine.add_backend(device(&backends[1])).await.unwrap(),
        BackendId::new(3)
    );
    assert_eq!(engine.stats().await.unwrap().logical_sectors, 155);
    verify(&engine, 110).await;
}

#[tokio::test]
async fn test_remove_checks_the_backend() {
    let engine = Engine::start(&test_config(), None).unwrap();
    let only = MemoryBackend::new("only", 64, Duration::ZERO);
    engine.add_backend(device(&only)).await.unwrap();

    let err = engine.remove_backend(BackendId::new(4)).await.unwrap_err();
    assert!(matches!(err, Error::BackendNotFound(4)), "{err}");

    only.set_online(false);
    let err = engine.remove_backend(BackendId::new(1)).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)), "{err}");
}

#[tokio::test]
async fn test_backend_limit() {
    let mut config = test_config();
    config.engine.max_backends = 2;
    let engine = Engine::start(&config, None).unwrap();
    for i in 0..2 {
        let backend = MemoryBackend::new(&format!("mem{i}"), 32, Duration::ZERO);
        engine.add_backend(device(&backend)).await.unwrap();
    }

    let extra = MemoryBackend::new("extra", 32, Duration::ZERO);
    let err = engine.add_backend(device(&extra)).await.unwrap_err();
    assert!(matches!(err, Error::BackendLimit { max: 2 }), "{err}");
}

#[tokio::test]
async fn test_restart_reloads_index() {
    let dir = tempfile::tempdir().unwrap();
    let logical = build_local_set(dir.path()).await;
    assert_eq!(logical, 155);

    let engine = Engine::start(&test_config(), None).unwrap();
    engine.add_backend(local(dir.path(), 0, false)).await.unwrap();
    let partial = engine.stats().await.unwrap();
    assert!(!partial.assembled);
    assert_eq!(partial.logical_sectors, 155);
    let err = engine.optimize(10).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)), "{err}");

    engine.add_backend(local(dir.path(), 1, false)).await.unwrap();
    engine.add_backend(local(dir.path(), 2, false)).await.unwrap();
    assert!(engine.stats().await.unwrap().assembled);

    verify(&engine, logical).await;
    assert_placement_sane(&engine).await;
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_members_must_rejoin_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let logical = build_local_set(dir.path()).await;

    let engine = Engine::start(&test_config(), None).unwrap();
    let err = engine.add_backend(local(dir.path(), 1, false)).await.unwrap_err();
    assert!(matches!(err, Error::HeaderIncompatible(_)), "{err}");

    engine.add_backend(local(dir.path(), 0, false)).await.unwrap();
    let err = engine.add_backend(local(dir.path(), 2, false)).await.unwrap_err();
    assert!(matches!(err, Error::HeaderIncompatible(_)), "{err}");

    let blank = MemoryBackend::new("blank", 64, Duration::ZERO);
    let err = engine.add_backend(device(&blank)).await.unwrap_err();
    assert!(matches!(err, Error::HeaderIncompatible(_)), "{err}");

    engine.add_backend(local(dir.path(), 1, false)).await.unwrap();
    engine.add_backend(local(dir.path(), 2, false)).await.unwrap();
    verify(&engine, logical).await;
}

#[tokio::test]
async fn test_interrupted_swap_survives_restart() {
    let stages = [
        SwapStage::ScratchWritten,
        SwapStage::ScratchPersisted,
        SwapStage::SecondMoved,
        SwapStage::SecondPersisted,
        SwapStage::FirstMoved,
    ];
    for stage in stages {
        let dir = tempfile::tempdir().unwrap();
        let logical = build_local_set(dir.path()).await;

        let engine = reassemble(dir.path()).await;
        let first = engine.sector_info(0).await.unwrap().entry;
        let second = engine.sector_info(logical - 1).await.unwrap().entry;
        assert_ne!(first.backend(), second.backend());

        let reached = engine.swap_until(0, logical - 1, stage).await.unwrap();
        assert_eq!(reached, stage);
        engine.shutdown().await.unwrap();

        let engine = reassemble(dir.path()).await;
        verify(&engine, logical).await;
        assert_placement_sane(&engine).await;
        assert_eq!(&engine.read_sectors(0, 1).await.unwrap()[..], &pattern(0)[..]);
        engine.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_completed_swap_exchanges_places() {
    let dir = tempfile::tempdir().unwrap();
    let logical = build_local_set(dir.path()).await;
    let engine = reassemble(dir.path()).await;

    let first = engine.sector_info(3).await.unwrap().entry;
    let second = engine.sector_info(logical - 2).await.unwrap().entry;
    engine.swap(3, logical - 2).await.unwrap();

    let first_after = engine.sector_info(3).await.unwrap().entry;
    let second_after = engine.sector_info(logical - 2).await.unwrap().entry;
    assert_eq!(
        (first_after.backend_id, first_after.physical_sector),
        (second.backend_id, second.physical_sector)
    );
    assert_eq!(
        (second_after.backend_id, second_after.physical_sector),
        (first.backend_id, first.physical_sector)
    );
    assert_eq!(first_after.access_count, first.access_count);
    verify(&engine, logical).await;

    let err = engine.swap(3, logical + 5).await.unwrap_err();
    assert!(matches!(err, Error::OutOfRange { .. }), "{err}");
}

/// Two equally fast 64 sector members, completely filled
async fn full_pair() -> (Engine, Vec<Arc<MemoryBackend>>, u64) {
    let engine = Engine::start(&test_config(), None).unwrap();
    let backends = vec![
        MemoryBackend::new("left", 64, Duration::ZERO),
        MemoryBackend::new("right", 64, Duration::ZERO),
    ];
    for backend in &backends {
        engine.add_backend(device(backend)).await.unwrap();
    }
    let logical = engine.stats().await.unwrap().logical_sectors;
    fill(&engine, logical).await;
    (engine, backends, logical)
}

/// Logical sectors stored on `backend`, lowest first
async fn sectors_on(engine: &Engine, backend: BackendId) -> Vec<u64> {
    engine
        .all_sector_info()
        .await
        .unwrap()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_used() && e.backend() == backend)
        .map(|(logical, _)| logical as u64)
        .collect()
}

#[tokio::test]
async fn test_failed_swap_puts_sector_back() {
    let (engine, backends, logical) = full_pair().await;
    let left = sectors_on(&engine, BackendId::new(1)).await;
    let right = sectors_on(&engine, BackendId::new(2)).await;
    let (x, y) = (left[3], right[3]);
    let before = engine.sector_info(x).await.unwrap().entry;

    // the second sector cannot land on the first one's place, once
    backends[0].fail_writes(before.physical_sector, 1);
    assert!(engine.swap(x, y).await.is_err());

    let after = engine.sector_info(x).await.unwrap().entry;
    assert_eq!(
        (after.backend_id, after.physical_sector),
        (before.backend_id, before.physical_sector)
    );
    verify(&engine, logical).await;
    assert_placement_sane(&engine).await;

    engine.swap(x, y).await.unwrap();
    assert_eq!(engine.sector_info(x).await.unwrap().entry.backend(), BackendId::new(2));
    verify(&engine, logical).await;
}

#[tokio::test]
async fn test_sector_left_on_move_help_is_not_overwritten() {
    let (engine, backends, logical) = full_pair().await;
    let left = sectors_on(&engine, BackendId::new(1)).await;
    let right = sectors_on(&engine, BackendId::new(2)).await;
    let (x, y) = (left[3], right[3]);
    let (z, w) = (left[10], right[10]);
    let home = engine.sector_info(x).await.unwrap().entry.physical_sector;

    // x's place keeps failing and there is no free slot to take it instead
    backends[0].fail_writes(home, u32::MAX);
    assert!(engine.swap(x, y).await.is_err());
    verify(&engine, logical).await;

    // the next swap through the same move-help sector must move x out first
    assert!(engine.swap(z, w).await.is_err());
    verify(&engine, logical).await;

    backends[0].clear_faults();
    engine.swap(z, w).await.unwrap();
    assert_eq!(engine.sector_info(z).await.unwrap().entry.backend(), BackendId::new(2));
    assert_eq!(engine.sector_info(x).await.unwrap().entry.physical_sector, home);
    verify(&engine, logical).await;
    assert_placement_sane(&engine).await;
}

#[tokio::test]
async fn test_failed_removal_keeps_every_sector() {
    let engine = Engine::start(&test_config(), None).unwrap();
    let backends: Vec<_> = SIZES
        .iter()
        .enumerate()
        .map(|(i, &size)| MemoryBackend::new(&format!("mem{i}"), size, Duration::ZERO))
        .collect();
    for backend in &backends {
        engine.add_backend(device(backend)).await.unwrap();
    }
    fill(&engine, 155).await;

    // sectors 95..110 trade places with 154, 153, ...; the third trade fails
    let partner = engine.sector_info(152).await.unwrap().entry;
    assert_eq!(partner.backend(), BackendId::new(3));
    backends[2].fail_writes(partner.physical_sector, u32::MAX);
    assert!(engine.remove_backend(BackendId::new(2)).await.is_err());

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.logical_sectors, 155);
    assert_eq!(stats.backends.len(), 3);
    verify(&engine, 155).await;

    backends[2].clear_faults();
    engine.remove_backend(BackendId::new(2)).await.unwrap();
    assert_eq!(engine.stats().await.unwrap().logical_sectors, 110);
    verify(&engine, 110).await;
    assert_placement_sane(&engine).await;
}
