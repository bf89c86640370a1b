//! Background tiering optimizer
//!
//! Runs only while no client work is queued. Each call to
//! [`EngineCore::tiering_step`] does a bounded amount of work:
//!
//! ```text
//!   Idle ──► Sorting ──► Assigning ──► Swapping ──► Idle
//!              │  ▲          │            │  ▲
//!              └──┘          │            └──┘
//!         one time slice     │        one move per step
//!                            └──► Idle (nothing misplaced)
//! ```
//!
//! Sorting keeps a view of the logical sectors ordered hottest first and
//! refines it with an incremental insertion sort, which is cheap on a view
//! that was sorted before and has only drifted. Assigning walks the view
//! (cache tier first) and fills the backends fastest first. Swapping moves
//! the hottest misplaced sector of the slowest backend towards its
//! preferred backend, one relocation or swap per step.

use crate::state::EngineCore;
use serde::Serialize;
use std::cmp::Reverse;
use std::time::{Duration, Instant};
use tierio_common::{BackendId, Error, Result, SectorIndexEntry};
use tracing::{debug, error, info};

/// Phase of the optimizer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TieringState {
    #[default]
    Idle,
    Sorting,
    Assigning,
    Swapping,
}

/// Outcome of one optimizer step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieringProgress {
    /// Call again when the engine is idle
    More,
    /// Every sector is on its preferred backend
    Finished,
}

/// Outcome of one sort slice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortProgress {
    Paused,
    Sorted,
}

/// Logical sectors ordered by descending access count, then ascending number
#[derive(Debug, Default)]
pub struct SortedView {
    order: Vec<u64>,
    cursor: usize,
    moved: bool,
}

fn sort_key(entries: &[SectorIndexEntry], logical: u64) -> (Reverse<u16>, u64) {
    let heat = entries
        .get(logical as usize)
        .filter(|e| e.is_used())
        .map_or(0, |e| e.access_count);
    (Reverse(heat), logical)
}

impl SortedView {
    /// Start over with the identity order of `count` sectors
    pub fn reset(&mut self, count: usize) {
        self.order = (0..count as u64).collect();
        self.cursor = 1;
        self.moved = false;
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.cursor = 1;
        self.moved = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Rank of `logical` in the view, hottest first
    #[must_use]
    pub fn position(&self, logical: u64) -> Option<usize> {
        self.order.iter().position(|&l| l == logical)
    }

    #[must_use]
    pub fn order(&self) -> &[u64] {
        &self.order
    }

    /// Continue the insertion sort until the deadline passes or
    /// `interrupted` reports new work
    ///
    /// The view is sorted once a complete pass moved nothing.
    pub fn sort_step(
        &mut self,
        entries: &[SectorIndexEntry],
        deadline: Instant,
        interrupted: &dyn Fn() -> bool,
    ) -> SortProgress {
        const CHECK_EVERY: usize = 256;
        let len = self.order.len();
        let mut steps = 0usize;

        loop {
            if self.cursor >= len {
                if !self.moved {
                    self.cursor = 1;
                    return SortProgress::Sorted;
                }
                self.cursor = 1;
                self.moved = false;
            }

            let item = self.order[self.cursor];
            let key = sort_key(entries, item);
            let mut hole = self.cursor;
            while hole > 0 && key < sort_key(entries, self.order[hole - 1]) {
                self.order[hole] = self.order[hole - 1];
                hole -= 1;
            }
            self.order[hole] = item;
            self.moved |= hole != self.cursor;
            self.cursor += 1;

            steps += 1;
            if steps % CHECK_EVERY == 0 && (Instant::now() >= deadline || interrupted()) {
                return SortProgress::Paused;
            }
        }
    }
}

/// Preferred backend of every used sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Indexed by logical sector; `UNUSED` where no preference exists
    preferred: Vec<BackendId>,
    misplaced: u64,
}

impl Assignment {
    #[must_use]
    pub fn preferred(&self, logical: u64) -> BackendId {
        self.preferred
            .get(logical as usize)
            .copied()
            .unwrap_or(BackendId::UNUSED)
    }

    /// Used sectors not on their preferred backend
    #[must_use]
    pub const fn misplaced(&self) -> u64 {
        self.misplaced
    }

    /// Leave `logical` where it is for the rest of the pass
    pub fn settle(&mut self, logical: u64) {
        if let Some(preferred) = self.preferred.get_mut(logical as usize) {
            *preferred = BackendId::UNUSED;
        }
    }
}

/// Fill the backends fastest first, walking the cache tier and then the
/// rest of the view hottest first
///
/// `slots` lists every backend fastest first with its number of data slots.
/// The result depends only on its inputs.
#[must_use]
pub fn assign(
    order: &[u64],
    entries: &[SectorIndexEntry],
    slots: &[(BackendId, u64)],
    cache_start: u64,
) -> Assignment {
    let mut preferred = vec![BackendId::UNUSED; entries.len()];
    let mut remaining = slots.to_vec();
    let mut tier = 0;
    let mut misplaced = 0;

    let cache = order.iter().filter(|&&logical| logical >= cache_start);
    let rest = order.iter().filter(|&&logical| logical < cache_start);
    for &logical in cache.chain(rest) {
        let Some(entry) = entries.get(logical as usize).filter(|e| e.is_used()) else {
            continue;
        };
        while remaining.get(tier).is_some_and(|&(_, left)| left == 0) {
            tier += 1;
        }
        let Some((backend, left)) = remaining.get_mut(tier) else {
            break;
        };
        *left -= 1;
        preferred[logical as usize] = *backend;
        if entry.backend() != *backend {
            misplaced += 1;
        }
    }

    Assignment {
        preferred,
        misplaced,
    }
}

/// A single placement change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Move {
    /// Copy a sector into a free slot of `target`
    Relocate { logical: u64, target: BackendId },
    /// Exchange two sectors
    Swap { first: u64, second: u64 },
}

impl Move {
    /// Logical sectors the move changes
    #[must_use]
    pub fn sectors(self) -> Vec<u64> {
        match self {
            Self::Relocate { logical, .. } => vec![logical],
            Self::Swap { first, second } => vec![first, second],
        }
    }
}

/// Pick the next move
///
/// The hottest misplaced sector of the slowest backend that has one goes to
/// its preferred backend: into a free slot if there is one, otherwise in
/// exchange for a sector that prefers the source backend, otherwise for any
/// misplaced sector there.
#[must_use]
pub fn plan_move(
    assignment: &Assignment,
    order: &[u64],
    entries: &[SectorIndexEntry],
    ranked: &[BackendId],
    has_free: impl Fn(BackendId) -> bool,
) -> Option<Move> {
    let backend_count = ranked.iter().map(|id| id.index() + 1).max().unwrap_or(0);
    let mut misplaced: Vec<Vec<u64>> = vec![Vec::new(); backend_count];
    for &logical in order {
        let Some(entry) = entries.get(logical as usize).filter(|e| e.is_used()) else {
            continue;
        };
        let preferred = assignment.preferred(logical);
        if preferred.is_unused() || preferred == entry.backend() {
            continue;
        }
        if let Some(list) = misplaced.get_mut(entry.backend().index()) {
            list.push(logical);
        }
    }

    for &source in ranked.iter().rev() {
        let Some(candidates) = misplaced.get(source.index()) else {
            continue;
        };
        for &logical in candidates {
            let target = assignment.preferred(logical);
            if has_free(target) {
                return Some(Move::Relocate { logical, target });
            }
            let on_target = misplaced.get(target.index()).map_or(&[][..], Vec::as_slice);
            let partner = on_target
                .iter()
                .find(|&&other| assignment.preferred(other) == source)
                .or_else(|| on_target.first());
            if let Some(&second) = partner {
                return Some(Move::Swap {
                    first: logical,
                    second,
                });
            }
        }
    }
    None
}

/// Optimizer state kept between steps
#[derive(Debug)]
pub struct TieringOptimizer {
    state: TieringState,
    view: SortedView,
    assignment: Option<Assignment>,
    slice: Duration,
    moves: u64,
    failures: u64,
}

impl TieringOptimizer {
    #[must_use]
    pub fn new(slice: Duration) -> Self {
        Self {
            state: TieringState::Idle,
            view: SortedView::default(),
            assignment: None,
            slice,
            moves: 0,
            failures: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TieringState {
        self.state
    }

    /// Latest hottest-first view of the logical sectors
    #[must_use]
    pub const fn view(&self) -> &SortedView {
        &self.view
    }

    /// Moves done in the current pass
    #[must_use]
    pub const fn moves(&self) -> u64 {
        self.moves
    }

    /// Moves that failed and were skipped in the current pass
    #[must_use]
    pub const fn failures(&self) -> u64 {
        self.failures
    }

    /// Forget everything derived from the current geometry
    pub fn invalidate(&mut self) {
        self.state = TieringState::Idle;
        self.view.clear();
        self.assignment = None;
        self.moves = 0;
        self.failures = 0;
    }
}

impl EngineCore {
    /// Backends fastest first with their data slot counts
    fn slot_budget(&self) -> Vec<(BackendId, u64)> {
        let header = self.table.header_sector_count();
        self.backends
            .ranked()
            .into_iter()
            .filter_map(|id| {
                let backend = self.backends.get(id).ok()?;
                Some((id, backend.capacity_sectors().saturating_sub(header + 1)))
            })
            .collect()
    }

    /// Advance the optimizer by one bounded step
    pub async fn tiering_step(
        &mut self,
        interrupted: &(dyn Fn() -> bool + Sync),
    ) -> Result<TieringProgress> {
        if self.backends.iter().any(|b| !b.is_ready()) {
            debug!("tiering paused: not every backend is ready");
            self.optimizer.state = TieringState::Idle;
            return Ok(TieringProgress::Finished);
        }

        match self.optimizer.state {
            TieringState::Idle => {
                self.optimizer.state = TieringState::Sorting;
                self.optimizer.moves = 0;
                self.optimizer.failures = 0;
                Ok(TieringProgress::More)
            }
            TieringState::Sorting => {
                let entries = self.table.entries();
                if self.optimizer.view.len() != entries.len() {
                    self.optimizer.view.reset(entries.len());
                }
                let deadline = Instant::now() + self.optimizer.slice;
                if self.optimizer.view.sort_step(&entries, deadline, interrupted)
                    == SortProgress::Sorted
                {
                    self.optimizer.state = TieringState::Assigning;
                }
                Ok(TieringProgress::More)
            }
            TieringState::Assigning => {
                let entries = self.table.entries();
                let cache_start =
                    self.table.logical_sector_count() - self.table.cache_sector_count();
                let assignment = assign(
                    self.optimizer.view.order(),
                    &entries,
                    &self.slot_budget(),
                    cache_start,
                );
                if assignment.misplaced() == 0 {
                    self.optimizer.state = TieringState::Idle;
                    self.optimizer.assignment = None;
                    return Ok(TieringProgress::Finished);
                }
                debug!("tiering: {} sectors misplaced", assignment.misplaced());
                self.optimizer.assignment = Some(assignment);
                self.optimizer.state = TieringState::Swapping;
                Ok(TieringProgress::More)
            }
            TieringState::Swapping => self.swapping_step().await,
        }
    }

    async fn swapping_step(&mut self) -> Result<TieringProgress> {
        let Some(assignment) = self.optimizer.assignment.as_ref() else {
            self.optimizer.state = TieringState::Sorting;
            return Ok(TieringProgress::More);
        };

        let entries = self.table.entries();
        let ranked = self.backends.ranked();
        let next = plan_move(
            assignment,
            self.optimizer.view.order(),
            &entries,
            &ranked,
            |id| self.free.has_free(id),
        );

        match next {
            None => {
                if self.optimizer.moves > 0 || self.optimizer.failures > 0 {
                    info!(
                        "tiering pass finished after {} moves, {} skipped",
                        self.optimizer.moves, self.optimizer.failures
                    );
                }
                self.optimizer.state = TieringState::Idle;
                self.optimizer.assignment = None;
                return Ok(TieringProgress::Finished);
            }
            Some(planned) => {
                if let Err(e) = self.apply(planned).await {
                    error!("tiering move {planned:?} failed, skipping it this pass: {e}");
                    if let Some(assignment) = self.optimizer.assignment.as_mut() {
                        for logical in planned.sectors() {
                            assignment.settle(logical);
                        }
                    }
                    self.optimizer.failures += 1;
                    return Ok(TieringProgress::More);
                }
            }
        }

        self.optimizer.moves += 1;
        Ok(TieringProgress::More)
    }

    async fn apply(&mut self, planned: Move) -> Result<()> {
        match planned {
            Move::Relocate { logical, target } => {
                let slot = self.free.take(target).ok_or_else(|| {
                    Error::internal(format!("backend {target} has no free slot"))
                })?;
                if let Err(e) = self.relocate(logical, target, slot).await {
                    self.free.release(target, slot);
                    return Err(e);
                }
                Ok(())
            }
            Move::Swap { first, second } => self.swap(first, second).await,
        }
    }

    /// Run the optimizer until it finishes or `max_steps` steps were taken
    ///
    /// Returns the number of moves made.
    pub async fn optimize(&mut self, max_steps: usize) -> Result<u64> {
        let mut moves = 0;
        for _ in 0..max_steps {
            let before = self.optimizer.moves;
            let progress = self.tiering_step(&|| false).await?;
            moves += self.optimizer.moves.saturating_sub(before);
            if progress == TieringProgress::Finished {
                break;
            }
        }
        Ok(moves)
    }
}
