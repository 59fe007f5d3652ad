use crate::config::LaneConfig;
use foldgate_model::{JobInput, Lane, ResourceEstimate};

// Advisory cost model; tuned against observed executor runtimes, not a
// billing source.
const BASE_GPU_SECONDS: f64 = 45.0;
const REFERENCE_PROTEIN_LENGTH: f64 = 256.0;
const LENGTH_EXPONENT: f64 = 1.4;
const LIGAND_GPU_FACTOR: f64 = 0.35;
const MSA_SURCHARGE_GPU_SECONDS: f64 = 180.0;
const BASE_MEMORY_GB: f64 = 2.0;
const BASE_STORAGE_GB: f64 = 0.05;

/// Pure cost estimate from declared inputs; never fails for validated input.
#[must_use]
pub fn estimate_resources(input: &JobInput) -> ResourceEstimate {
    let protein_length = input.total_protein_length();
    let ligand_count = input.ligand_count();

    let length_factor = (f64::from(protein_length) / REFERENCE_PROTEIN_LENGTH)
        .powf(LENGTH_EXPONENT)
        .max(0.2);
    let ligand_factor = 1.0 + LIGAND_GPU_FACTOR * f64::from(ligand_count);
    let mut gpu_seconds = BASE_GPU_SECONDS * length_factor * ligand_factor;
    if input.use_msa_server {
        // MSA lookup dominates latency for small jobs.
        gpu_seconds += MSA_SURCHARGE_GPU_SECONDS;
    }

    let memory_gb = BASE_MEMORY_GB
        + f64::from(protein_length).sqrt() * 0.35
        + f64::from(ligand_count) * 0.05;
    let storage_gb = BASE_STORAGE_GB
        + f64::from(protein_length).sqrt() * 0.002
        + f64::from(ligand_count) * 0.001;

    ResourceEstimate {
        gpu_seconds,
        memory_gb,
        storage_gb,
        ligand_count,
        protein_length,
    }
}

/// Lane selection: interactive is a privilege, bulk the safe fallback.
///
/// Over any hard threshold the job is bulk regardless of hint. Under the
/// borderline band it is interactive unless the requester asked for bulk.
/// Inside the band (between `borderline_fraction` of a threshold and the
/// threshold itself) the hint decides, defaulting to bulk.
#[must_use]
pub fn classify_lane(
    estimate: &ResourceEstimate,
    hint: Option<Lane>,
    lanes: &LaneConfig,
) -> Lane {
    let under_hard = estimate.ligand_count <= lanes.interactive_max_ligands
        && estimate.gpu_seconds <= lanes.interactive_max_gpu_seconds;
    if !under_hard {
        return Lane::Bulk;
    }
    if hint == Some(Lane::Bulk) {
        return Lane::Bulk;
    }
    let borderline = f64::from(estimate.ligand_count)
        > lanes.borderline_fraction * f64::from(lanes.interactive_max_ligands)
        || estimate.gpu_seconds > lanes.borderline_fraction * lanes.interactive_max_gpu_seconds;
    if borderline {
        return hint.unwrap_or(Lane::Bulk);
    }
    Lane::Interactive
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(residues: usize, ligands: usize, msa: bool) -> JobInput {
        JobInput {
            protein_sequences: vec!["M".repeat(residues)],
            ligands: (0..ligands).map(|i| format!("CC{i}")).collect(),
            use_msa_server: msa,
        }
    }

    #[test]
    fn longer_proteins_cost_more_than_linear() {
        let short = estimate_resources(&input(128, 0, false));
        let long = estimate_resources(&input(512, 0, false));
        // 4x the residues should cost more than 4x the GPU time.
        assert!(long.gpu_seconds > 4.0 * short.gpu_seconds);
    }

    #[test]
    fn msa_surcharge_is_additive() {
        let without = estimate_resources(&input(200, 1, false));
        let with = estimate_resources(&input(200, 1, true));
        assert!((with.gpu_seconds - without.gpu_seconds - MSA_SURCHARGE_GPU_SECONDS).abs() < 1e-9);
    }

    #[test]
    fn small_jobs_classify_interactive_without_a_hint() {
        let est = estimate_resources(&input(100, 1, false));
        let lanes = LaneConfig::default();
        assert!(est.gpu_seconds <= lanes.borderline_fraction * lanes.interactive_max_gpu_seconds);
        assert_eq!(classify_lane(&est, None, &lanes), Lane::Interactive);
    }

    #[test]
    fn over_threshold_jobs_ignore_an_interactive_hint() {
        let est = estimate_resources(&input(2000, 12, true));
        let lanes = LaneConfig::default();
        assert_eq!(
            classify_lane(&est, Some(Lane::Interactive), &lanes),
            Lane::Bulk
        );
    }

    #[test]
    fn borderline_jobs_follow_the_hint_and_default_bulk() {
        let lanes = LaneConfig::default();
        let est = ResourceEstimate {
            gpu_seconds: lanes.interactive_max_gpu_seconds * 0.9,
            memory_gb: 4.0,
            storage_gb: 0.1,
            ligand_count: 1,
            protein_length: 400,
        };
        assert_eq!(classify_lane(&est, None, &lanes), Lane::Bulk);
        assert_eq!(
            classify_lane(&est, Some(Lane::Interactive), &lanes),
            Lane::Interactive
        );
    }

    #[test]
    fn bulk_hint_is_always_honored() {
        let est = estimate_resources(&input(80, 0, false));
        assert_eq!(
            classify_lane(&est, Some(Lane::Bulk), &LaneConfig::default()),
            Lane::Bulk
        );
    }
}
