//! Plan command implementation

use crate::cli::logging::log;
use crate::cli::LogLevel;
use crate::config::{build_sampler, load_spec, PlanArgs};
use crate::data::{partition_for_replica, AudioSource, DynamicBatchSampler, ManifestSource};

/// One line per batch: index, size and total seconds
pub fn format_plan(sampler: &DynamicBatchSampler, batches: &[Vec<usize>]) -> String {
    batches
        .iter()
        .enumerate()
        .map(|(i, batch)| {
            format!("  {i:>5}  {:>4} utts  {:>8.2} s", batch.len(), sampler.batch_seconds(batch))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn run_plan(args: PlanArgs, level: LogLevel) -> Result<(), String> {
    let spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let source = ManifestSource::from_jsonl(
        &spec.data.train_manifest,
        spec.data.duration_filter(),
        spec.data.sample_rate_hz,
    )
    .map_err(|e| format!("Data error: {e}"))?;
    let sampler =
        build_sampler(&spec, source.durations()).map_err(|e| format!("Config error: {e}"))?;

    let batches = sampler.batches(args.epoch);
    let part = partition_for_replica(&batches, args.rank, spec.distributed.world_size)
        .map_err(|e| format!("Config error: {e}"))?;

    log(
        level,
        LogLevel::Normal,
        &format!(
            "Epoch {}: {} utterances ({:.1} h) in {} batches, {} on replica {}",
            args.epoch,
            source.len(),
            source.total_seconds() / 3600.0,
            batches.len(),
            part.len(),
            args.rank
        ),
    );
    log(
        level,
        LogLevel::Verbose,
        &format!("Bucket boundaries: {:?}", sampler.bucket_boundaries()),
    );
    log(level, LogLevel::Normal, &format_plan(&sampler, &part));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_plan() {
        let sampler = DynamicBatchSampler::new(vec![1.0, 2.0, 3.0], 10.0, 1, 0).unwrap();
        let text = format_plan(&sampler, &[vec![0, 2], vec![1]]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("2 utts"));
        assert!(lines[0].contains("4.00 s"));
        assert!(lines[1].contains("1 utts"));
    }
}
