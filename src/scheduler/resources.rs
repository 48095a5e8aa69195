//! Resource weighing and derivation.
//!
//! Candidates that survived the hard capacity filter are bucketed by their
//! (bigmem, smp) profile and the bucket best matching the remaining capacity
//! wins; the final choice inside a bucket is uniform random. Memory and vcpu
//! counts are then drawn from the valid range so repeated runs exercise
//! varied guest configurations.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::catalog::Combination;
use crate::config::{ImageConfig, SchedulerConfig};
use crate::registry::Capacity;

/// Memory and vcpus derived for one guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestResources {
    pub memory_mib: u64,
    pub vcpus: u32,
}

/// Pick one combination among equally-eligible survivors.
///
/// The preference ladder mirrors how capacity is best spent: a host with
/// lots of memory should run a bigmem guest, an SMP host an SMP guest.
/// Randomness only breaks ties inside the chosen bucket.
pub fn pick_weighted<'a, R: Rng>(
    rng: &mut R,
    candidates: &[&'a Combination],
    remaining: &Capacity,
    boundary_mib: u64,
) -> Option<&'a Combination> {
    if candidates.is_empty() {
        return None;
    }

    let mut small_up = Vec::new();
    let mut small_smp = Vec::new();
    let mut big_up = Vec::new();
    let mut big_smp = Vec::new();
    for combination in candidates {
        match (combination.image.bigmem, combination.image.smp) {
            (false, false) => small_up.push(*combination),
            (false, true) => small_smp.push(*combination),
            (true, false) => big_up.push(*combination),
            (true, true) => big_smp.push(*combination),
        }
    }

    let smp_host = remaining.vcpus > 1;
    let bigmem_host = remaining.memory_mib > boundary_mib;

    let bucket: Vec<&Combination> = if bigmem_host && !(big_up.is_empty() && big_smp.is_empty()) {
        if smp_host && !big_smp.is_empty() {
            big_smp
        } else if !smp_host && !big_up.is_empty() {
            big_up
        } else {
            big_up.into_iter().chain(big_smp).collect()
        }
    } else if smp_host && !small_smp.is_empty() {
        small_smp
    } else if smp_host && !small_up.is_empty() {
        small_up
    } else if smp_host && !big_smp.is_empty() {
        big_smp
    } else if !smp_host && !small_up.is_empty() {
        small_up
    } else if !smp_host && !big_up.is_empty() {
        big_up
    } else if !smp_host && !small_smp.is_empty() {
        small_smp
    } else {
        candidates.to_vec()
    };

    bucket.choose(rng).copied()
}

/// Derive memory and vcpus for a chosen image within the remaining capacity.
///
/// Invariants: memory never exceeds `remaining.memory_mib` and never falls
/// below the image's documented minimum; vcpus stay within
/// `1..=remaining.vcpus`, and a non-SMP image always gets exactly one.
pub fn derive_resources<R: Rng>(
    rng: &mut R,
    image: &ImageConfig,
    remaining: &Capacity,
    tuning: &SchedulerConfig,
) -> GuestResources {
    let vcpus = if !image.smp || remaining.vcpus == 1 {
        1
    } else {
        rng.gen_range(2..=remaining.vcpus)
    };

    let step = tuning.memory_step_mib.max(1);
    let boundary = tuning.bigmem_boundary_mib;

    let mut floor = image
        .min_memory_mib
        .max(tuning.min_guest_memory_mib)
        .min(remaining.memory_mib);
    // Bigmem guests on a bigmem host start above the boundary, so the
    // capability actually gets exercised.
    if image.bigmem && remaining.memory_mib > boundary {
        floor = floor.max(boundary.min(remaining.memory_mib));
    }
    floor = round_up(floor, step).min(remaining.memory_mib);

    let ceiling_raw = if remaining.memory_mib > boundary && !image.bigmem {
        boundary
    } else {
        remaining.memory_mib
    };
    let ceiling = round_down(ceiling_raw, step).max(floor);

    let steps = (ceiling - floor) / step;
    let memory_mib = floor + rng.gen_range(0..=steps) * step;

    GuestResources { memory_mib, vcpus }
}

fn round_up(value: u64, step: u64) -> u64 {
    value.div_ceil(step) * step
}

fn round_down(value: u64, step: u64) -> u64 {
    value / step * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Arch, DurationClass, GuestType, ImageFormat, TestConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn image(name: &str, bigmem: bool, smp: bool) -> ImageConfig {
        ImageConfig {
            name: name.into(),
            vendor: "redhat".into(),
            format: ImageFormat::Qcow2,
            arch: Arch::X86_64,
            guest_type: GuestType::FullyVirtualized,
            os_family: "linux".into(),
            min_memory_mib: 1024,
            bigmem,
            smp,
            enabled: true,
        }
    }

    fn combination(name: &str, bigmem: bool, smp: bool) -> Combination {
        Combination {
            vendor: "redhat".into(),
            image: image(name, bigmem, smp),
            test: TestConfig {
                name: "LTP".into(),
                command: "run_ltp".into(),
                os_family: "linux".into(),
                guest_types: Vec::new(),
                duration: DurationClass::Long,
                timeout_secs: 36_000,
            },
        }
    }

    fn capacity(memory_mib: u64, vcpus: u32) -> Capacity {
        Capacity {
            memory_mib,
            vcpus,
            arches: BTreeSet::from([Arch::X86_64, Arch::I686]),
        }
    }

    #[test]
    fn test_bigmem_smp_host_prefers_bigmem_smp_guests() {
        let mut rng = StdRng::seed_from_u64(7);
        let combos = [
            combination("small-up", false, false),
            combination("big-smp", true, true),
        ];
        let refs: Vec<&Combination> = combos.iter().collect();
        for _ in 0..20 {
            let picked = pick_weighted(&mut rng, &refs, &capacity(8192, 4), 4096).unwrap();
            assert_eq!(picked.image.name, "big-smp");
        }
    }

    #[test]
    fn test_single_core_host_prefers_up_guests() {
        let mut rng = StdRng::seed_from_u64(7);
        let combos = [
            combination("small-up", false, false),
            combination("small-smp", false, true),
        ];
        let refs: Vec<&Combination> = combos.iter().collect();
        for _ in 0..20 {
            let picked = pick_weighted(&mut rng, &refs, &capacity(2048, 1), 4096).unwrap();
            assert_eq!(picked.image.name, "small-up");
        }
    }

    #[test]
    fn test_falls_back_to_all_candidates_when_no_bucket_matches() {
        let mut rng = StdRng::seed_from_u64(7);
        let combos = [combination("big-smp", true, true)];
        let refs: Vec<&Combination> = combos.iter().collect();
        // Small single-core host, only a bigmem SMP guest available.
        let picked = pick_weighted(&mut rng, &refs, &capacity(2048, 1), 4096).unwrap();
        assert_eq!(picked.image.name, "big-smp");
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(pick_weighted(&mut rng, &[], &capacity(4096, 2), 4096).is_none());
    }

    #[test]
    fn test_derived_resources_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let tuning = SchedulerConfig::default();
        for seed_round in 0..200 {
            let remaining = capacity(1024 + seed_round * 37, 1 + (seed_round % 8) as u32);
            let img = image("img", seed_round % 3 == 0, seed_round % 2 == 0);
            let res = derive_resources(&mut rng, &img, &remaining, &tuning);
            assert!(res.memory_mib <= remaining.memory_mib, "memory over capacity");
            assert!(
                res.memory_mib >= img.min_memory_mib.min(remaining.memory_mib),
                "memory below image minimum"
            );
            assert!(res.vcpus >= 1 && res.vcpus <= remaining.vcpus.max(1));
            if !img.smp {
                assert_eq!(res.vcpus, 1);
            }
        }
    }

    #[test]
    fn test_memory_lands_on_step_multiples() {
        let mut rng = StdRng::seed_from_u64(3);
        let tuning = SchedulerConfig::default();
        let img = image("img", false, true);
        for _ in 0..50 {
            let res = derive_resources(&mut rng, &img, &capacity(7168, 4), &tuning);
            assert_eq!(res.memory_mib % 256, 0);
        }
    }

    #[test]
    fn test_bigmem_guest_starts_above_boundary_on_big_host() {
        let mut rng = StdRng::seed_from_u64(9);
        let tuning = SchedulerConfig::default();
        let img = image("img", true, true);
        for _ in 0..50 {
            let res = derive_resources(&mut rng, &img, &capacity(8192, 4), &tuning);
            assert!(res.memory_mib >= 4096);
        }
    }

    #[test]
    fn test_non_bigmem_guest_capped_at_boundary() {
        let mut rng = StdRng::seed_from_u64(9);
        let tuning = SchedulerConfig::default();
        let img = image("img", false, true);
        for _ in 0..50 {
            let res = derive_resources(&mut rng, &img, &capacity(8192, 4), &tuning);
            assert!(res.memory_mib <= 4096);
        }
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let tuning = SchedulerConfig::default();
        let img = image("img", false, true);
        let a = derive_resources(&mut StdRng::seed_from_u64(5), &img, &capacity(7168, 4), &tuning);
        let b = derive_resources(&mut StdRng::seed_from_u64(5), &img, &capacity(7168, 4), &tuning);
        assert_eq!(a, b);
    }
}
