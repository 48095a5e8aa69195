//! The decision engine.
//!
//! One invocation picks the next vendor for a scope (round-robin), picks one
//! of that vendor's unscheduled combinations (hard capacity filter, then
//! weighted random tie-break), derives guest resources, and commits the
//! rotation update atomically. `--fill` repeats the decision against the
//! shrinking capacity until the scope is packed.

pub mod resources;

pub use resources::{derive_resources, pick_weighted, GuestResources};

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError, Combination};
use crate::config::{Arch, GuestType, ImageFormat, SchedulerConfig};
use crate::registry::{Capacity, Registry, RegistryError, Scope};
use crate::state::{ClassCursor, StateError, StateStore};

/// Result type for scheduling operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Errors from a scheduling invocation.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("no eligible combination for {scope}: {detail}")]
    NoEligibleCombination { scope: String, detail: String },

    #[error("nothing to schedule: no enabled testee class in the registry")]
    NoEnabledClass,
}

impl ScheduleError {
    /// Whether the caller may simply retry (lock contention).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScheduleError::State(StateError::Conflict { .. }))
    }
}

/// One scheduled guest: what to run, where, and with what resources.
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    /// Stable identifier for traceability through the execution system.
    pub id: Uuid,
    /// Scope the guest was scheduled for, e.g. `host:unicorn`.
    pub scope: String,
    pub vendor: String,
    pub image: String,
    pub image_format: ImageFormat,
    pub arch: Arch,
    pub guest_type: GuestType,
    pub test: String,
    pub test_command: String,
    pub timeout_secs: u64,
    /// Derived guest memory in MiB.
    pub memory_mib: u64,
    /// Derived vcpu count.
    pub vcpus: u32,
    /// Position of the guest within its test run, starting at 1.
    pub run_index: u32,
    /// VNC display number, starting at 0.
    pub vnc_display: u32,
    /// Generated guest NIC MAC address.
    pub mac_address: String,
    pub created_at: DateTime<Utc>,
}

/// The full output of one scheduling invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub run_id: Uuid,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub assignments: Vec<Assignment>,
}

/// The scheduler. Owns the RNG; everything else is borrowed read-only
/// except the rotation state, which it mutates transactionally.
pub struct Scheduler<'a> {
    catalog: &'a Catalog,
    registry: &'a Registry,
    store: &'a StateStore,
    tuning: &'a SchedulerConfig,
    rng: StdRng,
}

impl<'a> Scheduler<'a> {
    /// Scheduler with entropy-seeded randomness.
    pub fn new(
        catalog: &'a Catalog,
        registry: &'a Registry,
        store: &'a StateStore,
        tuning: &'a SchedulerConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            store,
            tuning,
            rng: StdRng::from_entropy(),
        }
    }

    /// Scheduler with a fixed seed, for reproducible runs and tests.
    /// The seed only affects tie-breaks and resource perturbation, never
    /// rotation order.
    pub fn with_seed(
        catalog: &'a Catalog,
        registry: &'a Registry,
        store: &'a StateStore,
        tuning: &'a SchedulerConfig,
        seed: u64,
    ) -> Self {
        Self {
            catalog,
            registry,
            store,
            tuning,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Schedule exactly one guest for the scope.
    pub fn schedule(&mut self, scope: &Scope) -> ScheduleResult<TestRun> {
        self.run(scope, false)
    }

    /// Schedule guests until the scope's capacity is exhausted.
    pub fn schedule_fill(&mut self, scope: &Scope) -> ScheduleResult<TestRun> {
        self.run(scope, true)
    }

    /// Schedule for the next enabled testee class in fleet-wide rotation.
    ///
    /// The class cursor is held locked across the whole run and committed
    /// only once the scope's own state commit succeeded; a run that fails
    /// does not consume the class's rotation turn.
    pub fn schedule_auto(&mut self, fill: bool) -> ScheduleResult<TestRun> {
        let _lock = self.store.lock_cursor()?;
        let mut cursor = self.store.load_cursor()?;
        let next = self.class_after(&cursor)?;

        let run = self.run(&Scope::Class(next.clone()), fill)?;

        cursor.last_class = Some(next);
        self.store.save_cursor(&cursor)?;
        debug!(class = %run.scope, "automatic rotation advanced");
        Ok(run)
    }

    fn class_after(&self, cursor: &ClassCursor) -> ScheduleResult<String> {
        let classes = self.registry.classes_in_order();
        let start = cursor
            .last_class
            .as_deref()
            .and_then(|last| classes.iter().position(|(name, _)| name == last))
            .map(|i| i + 1)
            .unwrap_or(0);

        let count = classes.len();
        (0..count)
            .map(|offset| &classes[(start + offset) % count])
            .find(|(_, enabled)| *enabled)
            .map(|(name, _)| name.clone())
            .ok_or(ScheduleError::NoEnabledClass)
    }

    fn run(&mut self, scope: &Scope, fill: bool) -> ScheduleResult<TestRun> {
        let capacity = self.registry.capacity_of(scope)?;
        let _lock = self.store.lock(scope)?;
        let mut record = self.store.load(scope)?;

        let mut remaining = capacity.clone();
        let mut used_images: HashSet<String> = HashSet::new();
        let mut assignments = Vec::new();
        let created_at = Utc::now();
        let run_id = Uuid::new_v4();

        loop {
            let picked = self.pick_one(&capacity, &remaining, &used_images, &mut record)?;
            match picked {
                Some((combination, guest)) => {
                    let index = assignments.len() as u32;
                    used_images.insert(combination.image.name.clone());
                    remaining.memory_mib -= guest.memory_mib;
                    remaining.vcpus -= guest.vcpus;
                    assignments.push(self.assignment(scope, &combination, guest, index, created_at));
                    if !fill
                        || remaining.vcpus == 0
                        || remaining.memory_mib < self.tuning.min_guest_memory_mib
                    {
                        break;
                    }
                }
                None if assignments.is_empty() => {
                    return Err(ScheduleError::NoEligibleCombination {
                        scope: scope.to_string(),
                        detail: self.diagnose(&capacity, &record),
                    });
                }
                // A partially filled run is still a run.
                None => break,
            }
        }

        // Single atomic commit: either the whole run's rotation update
        // lands, or none of it does.
        self.store.save(scope, &record)?;
        info!(
            scope = %scope,
            guests = assignments.len(),
            run_id = %run_id,
            "scheduled test run"
        );

        Ok(TestRun {
            run_id,
            scope: scope.to_string(),
            created_at,
            assignments,
        })
    }

    /// One decision: next vendor in rotation, one combination, resources.
    ///
    /// Mutates `record` (cursor, scheduled set, cycle reset) but does not
    /// persist it; the caller commits.
    fn pick_one(
        &mut self,
        capacity: &Capacity,
        remaining: &Capacity,
        used_images: &HashSet<String>,
        record: &mut crate::state::ScopeRecord,
    ) -> ScheduleResult<Option<(Combination, GuestResources)>> {
        let vendors = self.catalog.vendors();
        if vendors.is_empty() {
            return Ok(None);
        }

        let start = record
            .last_vendor
            .as_deref()
            .and_then(|last| vendors.iter().position(|v| v == last))
            .map(|i| i + 1)
            .unwrap_or(0);

        for offset in 0..vendors.len() {
            let vendor = &vendors[(start + offset) % vendors.len()];
            let all = self.catalog.combinations_for(vendor)?;

            // Eligibility for cycle accounting is judged against the scope's
            // full capacity; the shrinking fill-mode capacity must not make
            // a cycle look complete early.
            let cycle_eligible: Vec<&Combination> = all
                .iter()
                .filter(|c| capacity.admits(c.image.arch, c.image.min_memory_mib))
                .collect();
            if cycle_eligible.is_empty() {
                // Vendor has nothing this scope could ever run: skip without
                // consuming a rotation turn.
                continue;
            }

            let candidates: Vec<&Combination> = cycle_eligible
                .iter()
                .copied()
                .filter(|c| {
                    !record.is_scheduled(vendor, &c.id())
                        && remaining.admits(c.image.arch, c.image.min_memory_mib)
                        && !used_images.contains(&c.image.name)
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let chosen = pick_weighted(
                &mut self.rng,
                &candidates,
                remaining,
                self.tuning.bigmem_boundary_mib,
            )
            .cloned();
            let Some(chosen) = chosen else { continue };

            let guest = derive_resources(&mut self.rng, &chosen.image, remaining, self.tuning);

            record.last_vendor = Some(vendor.clone());
            record.mark_scheduled(vendor, &chosen.id());
            let eligible_ids: BTreeSet<String> =
                cycle_eligible.iter().map(|c| c.id()).collect();
            if record.reset_if_complete(vendor, &eligible_ids) {
                info!(vendor = %vendor, "rotation cycle complete, starting over");
            }

            debug!(
                vendor = %vendor,
                combination = %chosen.id(),
                memory_mib = guest.memory_mib,
                vcpus = guest.vcpus,
                "picked combination"
            );
            return Ok(Some((chosen, guest)));
        }

        Ok(None)
    }

    fn assignment(
        &self,
        scope: &Scope,
        combination: &Combination,
        guest: GuestResources,
        index: u32,
        created_at: DateTime<Utc>,
    ) -> Assignment {
        Assignment {
            id: Uuid::new_v4(),
            scope: scope.to_string(),
            vendor: combination.vendor.clone(),
            image: combination.image.name.clone(),
            image_format: combination.image.format,
            arch: combination.image.arch,
            guest_type: combination.image.guest_type,
            test: combination.test.name.clone(),
            test_command: combination.test.command.clone(),
            timeout_secs: combination.test.timeout_secs,
            memory_mib: guest.memory_mib,
            vcpus: guest.vcpus,
            run_index: index + 1,
            vnc_display: index,
            mac_address: mac_address(scope, self.tuning.mac_site_octets, index + 1),
            created_at,
        }
    }

    fn diagnose(&self, capacity: &Capacity, record: &crate::state::ScopeRecord) -> String {
        if self.catalog.is_empty() {
            return "the catalog has no combinations at all".to_string();
        }
        let mut parts = Vec::new();
        for vendor in self.catalog.vendors() {
            let all = self
                .catalog
                .combinations_for(vendor)
                .map(|combos| combos.len())
                .unwrap_or(0);
            let fitting = self
                .catalog
                .combinations_for(vendor)
                .map(|combos| {
                    combos
                        .iter()
                        .filter(|c| capacity.admits(c.image.arch, c.image.min_memory_mib))
                        .count()
                })
                .unwrap_or(0);
            parts.push(format!(
                "{vendor}: {fitting}/{all} fit capacity, {} already scheduled this cycle",
                record.scheduled_count(vendor)
            ));
        }
        format!(
            "capacity {} MiB / {} vcpus admits nothing schedulable ({})",
            capacity.memory_mib,
            capacity.vcpus,
            parts.join("; ")
        )
    }
}

/// Generate a guest NIC MAC address: `52:54:00:<scope octets>:<run index>`.
///
/// The middle octets fold an FNV-1a hash of the scope key into the
/// configured site octets, so concurrent runs on different scopes mint
/// distinct addresses.
pub fn mac_address(scope: &Scope, site_octets: [u8; 2], run_index: u32) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in scope.key().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!(
        "52:54:00:{:02X}:{:02X}:{:02X}",
        site_octets[0] ^ ((hash >> 8) as u8),
        site_octets[1] ^ (hash as u8),
        run_index % 256
    )
}
