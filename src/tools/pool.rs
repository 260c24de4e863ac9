//! A bounded worker pool for per-disk jobs.
//!
//! Jobs are distributed over a fixed number of scoped threads; every job
//! reports its own result and a failing job never takes the pool down
//! with it. The orchestrator aggregates the per-disk results into the
//! run's exit state.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{format_err, Error};
use crossbeam_channel::{bounded, unbounded};

/// Run `jobs` on up to `threads` worker threads and wait for all of
/// them.
///
/// The handler receives the job's index in submission order, which is
/// also the disk's port slot for offline remote backups. When the
/// cancel token flips, queued jobs are skipped and reported as
/// interrupted; the job currently running on each thread finishes on
/// its own.
pub fn run_jobs<J, F>(
    name: &str,
    threads: usize,
    jobs: Vec<J>,
    cancel: &AtomicBool,
    handler: F,
) -> Vec<(usize, Result<(), Error>)>
where
    J: Send,
    F: Fn(usize, J) -> Result<(), Error> + Send + Sync,
{
    let job_count = jobs.len();
    let threads = threads.clamp(1, job_count.max(1));

    let (input_tx, input_rx) = bounded::<(usize, J)>(job_count);
    let (result_tx, result_rx) = unbounded::<(usize, Result<(), Error>)>();
    for job in jobs.into_iter().enumerate() {
        input_tx.send(job).expect("channel bounded to job count");
    }
    drop(input_tx);

    let handler = &handler;
    std::thread::scope(|scope| {
        for thread_index in 0..threads {
            let input_rx = input_rx.clone();
            let result_tx = result_tx.clone();
            std::thread::Builder::new()
                .name(format!("{} ({})", name, thread_index))
                .spawn_scoped(scope, move || {
                    while let Ok((index, job)) = input_rx.recv() {
                        if cancel.load(Ordering::SeqCst) {
                            let _ = result_tx
                                .send((index, Err(format_err!("interrupted before start"))));
                            continue;
                        }
                        let result = handler(index, job);
                        if result_tx.send((index, result)).is_err() {
                            return;
                        }
                    }
                })
                .expect("spawning worker threads");
        }
        drop(result_tx);
    });

    let mut results: Vec<Option<Result<(), Error>>> = (0..job_count).map(|_| None).collect();
    while let Ok((index, result)) = result_rx.try_recv() {
        results[index] = Some(result);
    }

    // a panicking worker thread leaves its job without a result
    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            (
                index,
                result.unwrap_or_else(|| Err(format_err!("worker thread panicked"))),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_all_results_in_order() {
        let jobs = vec![1u64, 2, 3, 4, 5];
        let results = run_jobs(
            "test",
            3,
            jobs,
            &AtomicBool::new(false),
            |_index, job| {
                if job == 3 {
                    anyhow::bail!("job three fails");
                }
                Ok(())
            },
        );

        assert_eq!(results.len(), 5);
        for (index, result) in &results {
            if *index == 2 {
                assert!(result.is_err());
            } else {
                assert!(result.is_ok(), "job {} failed", index);
            }
        }
    }

    #[test]
    fn cancel_skips_queued_jobs() {
        let cancel = AtomicBool::new(true);
        let results = run_jobs("test", 1, vec![(), ()], &cancel, |_, _| Ok(()));
        assert!(results.iter().all(|(_, result)| result.is_err()));
    }

    #[test]
    fn single_failure_does_not_stop_others() {
        let results = run_jobs(
            "test",
            1,
            vec![0, 1, 2],
            &AtomicBool::new(false),
            |index, _| {
                if index == 0 {
                    anyhow::bail!("first job fails");
                }
                Ok(())
            },
        );
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert!(results[2].1.is_ok());
    }

    #[test]
    fn jobs_can_borrow_run_state() {
        let shared = String::from("borrowed");
        let results = run_jobs("test", 2, vec![(), ()], &AtomicBool::new(false), |_, _| {
            assert_eq!(shared.as_str(), "borrowed");
            Ok(())
        });
        assert!(results.iter().all(|(_, result)| result.is_ok()));
    }
}
