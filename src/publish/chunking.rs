use anyhow::{Context, Result};

use crate::queue::{JobOptions, NewJob};
use crate::services::contracts::SubmissionRef;

use super::types::{chunk_job_id, Chunk, ChunkJobRef, CHUNK_JOB_NAME};

/// Splits the eligible set into fixed-size chunks. Every submission lands in
/// exactly one chunk and `chunk_index` runs 0..total_chunks in input order,
/// so the same eligible set always partitions identically.
pub(crate) fn partition(
    exam_id: &str,
    server_id: &str,
    submissions: Vec<SubmissionRef>,
    chunk_size: usize,
) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let total_chunks = submissions.len().div_ceil(chunk_size) as u32;

    let mut chunks = Vec::with_capacity(total_chunks as usize);
    let mut iter = submissions.into_iter().peekable();
    let mut chunk_index = 0;
    while iter.peek().is_some() {
        let submission_refs: Vec<SubmissionRef> = iter.by_ref().take(chunk_size).collect();
        chunks.push(Chunk {
            exam_id: exam_id.to_owned(),
            chunk_index,
            total_chunks,
            submission_refs,
            server_id: server_id.to_owned(),
        });
        chunk_index += 1;
    }
    chunks
}

/// Earlier groups of `max_concurrency` chunks get a smaller priority number
/// and are claimed first, so dispatch roughly follows chunk order without
/// serializing it.
pub(crate) fn chunk_priority(chunk_index: u32, max_concurrency: usize) -> i64 {
    (chunk_index as i64 / max_concurrency.max(1) as i64) + 1
}

/// Turns chunks into broker jobs: deterministic ids, grouped priorities.
/// Stagger delays are assigned by the bulk enqueue from each job's index.
pub(crate) fn plan_chunk_jobs(chunks: &[Chunk], max_concurrency: usize) -> Result<Vec<NewJob>> {
    chunks
        .iter()
        .map(|chunk| {
            let payload = serde_json::to_value(chunk)
                .with_context(|| format!("Failed to serialize chunk {}", chunk.chunk_index))?;
            Ok(NewJob {
                name: CHUNK_JOB_NAME.to_owned(),
                payload,
                opts: JobOptions {
                    job_id: Some(chunk_job_id(&chunk.exam_id, chunk.chunk_index)),
                    priority: Some(chunk_priority(chunk.chunk_index, max_concurrency)),
                    ..JobOptions::default()
                },
            })
        })
        .collect()
}

pub(crate) fn chunk_refs(chunks: &[Chunk]) -> Vec<ChunkJobRef> {
    chunks
        .iter()
        .map(|chunk| ChunkJobRef {
            job_id: chunk_job_id(&chunk.exam_id, chunk.chunk_index),
            chunk_index: chunk.chunk_index,
            submissions: chunk.submission_refs.len() as u64,
        })
        .collect()
}

/// Rough wall-clock estimate for the run: chunks execute in waves of
/// `max_concurrency`. Any non-empty run reports at least one minute.
pub(crate) fn estimate_minutes(
    total_chunks: u32,
    max_concurrency: usize,
    seconds_per_chunk: u64,
) -> u64 {
    if total_chunks == 0 {
        return 0;
    }
    let waves = (total_chunks as u64).div_ceil(max_concurrency.max(1) as u64);
    (waves * seconds_per_chunk).div_ceil(60).max(1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn submissions(count: usize) -> Vec<SubmissionRef> {
        (0..count)
            .map(|i| SubmissionRef {
                submission_id: format!("sub-{i}"),
                student_id: format!("student-{i}"),
                raw_score: i as f64,
            })
            .collect()
    }

    #[test]
    fn partition_is_exact_with_a_ragged_tail() {
        let chunks = partition("e1", "srv-1", submissions(1200), 500);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].submission_refs.len(), 500);
        assert_eq!(chunks[1].submission_refs.len(), 500);
        assert_eq!(chunks[2].submission_refs.len(), 200);
        assert!(chunks.iter().all(|chunk| chunk.total_chunks == 3));
        assert_eq!(
            chunks.iter().map(|chunk| chunk.chunk_index).collect::<Vec<_>>(),
            [0, 1, 2]
        );

        let mut seen = HashSet::new();
        for chunk in &chunks {
            for submission in &chunk.submission_refs {
                assert!(seen.insert(submission.submission_id.clone()), "duplicated submission");
            }
        }
        assert_eq!(seen.len(), 1200, "all submissions present exactly once");
    }

    #[test]
    fn partition_counts_match_ceiling_division() {
        for (count, chunk_size, expected) in
            [(0, 500, 0), (1, 500, 1), (500, 500, 1), (501, 500, 2), (999, 100, 10)]
        {
            let chunks = partition("e1", "srv-1", submissions(count), chunk_size);
            assert_eq!(chunks.len(), expected, "count={count} chunk_size={chunk_size}");
        }
    }

    #[test]
    fn priorities_step_up_in_groups_of_max_concurrency() {
        assert_eq!(chunk_priority(0, 5), 1);
        assert_eq!(chunk_priority(4, 5), 1);
        assert_eq!(chunk_priority(5, 5), 2);
        assert_eq!(chunk_priority(14, 5), 3);
    }

    #[test]
    fn planned_jobs_carry_deterministic_ids_and_payloads() {
        let chunks = partition("e1", "srv-1", submissions(1200), 500);
        let jobs = plan_chunk_jobs(&chunks, 20).unwrap();

        assert_eq!(jobs.len(), 3);
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.opts.job_id.as_deref(), Some(format!("bulk-publish-e1-chunk-{i}").as_str()));
            // 3 chunks at concurrency 20 all fit the first dispatch group.
            assert_eq!(job.opts.priority, Some(1));
            assert_eq!(job.opts.delay_ms, None, "stagger comes from the bulk enqueue");
            assert_eq!(job.payload["chunk_index"], i as u64);
            assert_eq!(job.payload["exam_id"], "e1");
        }
    }

    #[test]
    fn chunk_refs_record_each_span() {
        let chunks = partition("e1", "srv-1", submissions(1200), 500);
        let refs = chunk_refs(&chunks);

        assert_eq!(refs.len(), 3);
        assert_eq!(refs[2].job_id, "bulk-publish-e1-chunk-2");
        assert_eq!(refs.iter().map(|r| r.submissions).collect::<Vec<_>>(), [500, 500, 200]);
    }

    #[test]
    fn estimate_rounds_up_and_floors_at_one_minute() {
        assert_eq!(estimate_minutes(0, 20, 30), 0);
        assert_eq!(estimate_minutes(3, 20, 30), 1);
        assert_eq!(estimate_minutes(40, 20, 30), 1);
        assert_eq!(estimate_minutes(41, 20, 30), 2);
        assert_eq!(estimate_minutes(100, 5, 30), 10);
    }
}
