//! Two-phase aggregate driver.
//!
//! Sequences the reductions that turn a dataset into its summary statistics:
//!
//! ```text
//! Idle -> Uploaded -> FirstWaveDispatched -> FirstWaveComplete -> MeanKnown
//!      -> VarianceDispatched -> VarianceComplete -> Finalized
//! ```
//!
//! Each state is a value consumed by the next transition, so the variance
//! kernel can only be dispatched from a [`MeanKnown`], which carries the
//! encoded mean it is parameterized with. First-wave reductions (min, max,
//! sum and the optional atomic comparisons) have no dependency on each other
//! and run concurrently on the blocking pool.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::accel::ops::{DeviationInput, ReduceInput, Reduction, SquaredDeviation};
use crate::accel::{pad, AccelError, AcceleratedOp, AccelerationManager, ReduceOp, SquareLimbs};
use crate::fixed;
use crate::report::{Report, StageTiming};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("dataset of {count} values exceeds the {max} value limit")]
    DatasetTooLarge { count: usize, max: usize },

    #[error(transparent)]
    Accel(#[from] AccelError),

    #[error("run cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("{op} disagrees between strategies: tree {tree}, atomic {atomic}")]
    StrategyMismatch { op: ReduceOp, tree: i64, atomic: i64 },

    #[error("dispatch task failed during {stage}: {source}")]
    Join {
        stage: Stage,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Driver state, used for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Uploaded,
    FirstWaveDispatched,
    FirstWaveComplete,
    MeanKnown,
    VarianceDispatched,
    VarianceComplete,
    Finalized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Idle => "idle",
            Stage::Uploaded => "upload",
            Stage::FirstWaveDispatched => "first wave dispatch",
            Stage::FirstWaveComplete => "first wave read-back",
            Stage::MeanKnown => "mean",
            Stage::VarianceDispatched => "variance dispatch",
            Stage::VarianceComplete => "variance reduction",
            Stage::Finalized => "finalize",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub local_size: usize,
    /// Also run atomic min/max in the first wave and require agreement.
    pub compare_atomic: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            local_size: 32,
            compare_atomic: false,
        }
    }
}

/// Dataset padded per operator, ready for dispatch.
#[derive(Debug)]
pub struct Uploaded {
    started_at: chrono::DateTime<Utc>,
    count: usize,
    min_lanes: Arc<[i32]>,
    max_lanes: Arc<[i32]>,
    sum_lanes: Arc<[i64]>,
    deviation_lanes: Arc<[i32]>,
    timings: Vec<StageTiming>,
}

impl Uploaded {
    pub fn padded_len(&self) -> usize {
        self.min_lanes.len()
    }
}

/// Min, max, and sum read back from the device.
#[derive(Debug)]
pub struct FirstWave {
    uploaded: Uploaded,
    pub min: i32,
    pub max: i32,
    pub sum: i64,
    pub atomic_min: Option<i32>,
    pub atomic_max: Option<i32>,
}

/// The mean is known on the host; the variance kernel may now be dispatched.
#[derive(Debug)]
pub struct MeanKnown {
    first: FirstWave,
    /// Kernel argument for the variance dispatch.
    pub mean_encoded: i64,
    pub mean: f64,
}

/// Sum of squared deviations from the encoded mean, at scale `SCALE^2`.
#[derive(Debug)]
pub struct VarianceComplete {
    known: MeanKnown,
    pub sum_squares: i128,
}

pub struct Pipeline {
    manager: Arc<AccelerationManager>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate the work-group size against the selected device.
    pub fn new(
        manager: Arc<AccelerationManager>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let max = manager.device().max_work_group_size;
        if options.local_size < 2 || options.local_size > max {
            return Err(PipelineError::Config(format!(
                "work-group size {} outside 2..={} for device '{}'",
                options.local_size,
                max,
                manager.device().name
            )));
        }

        Ok(Self {
            manager,
            options,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort before the next dispatch boundary once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every stage and assemble the report.
    pub async fn run(&self, dataset: impl Into<Arc<[i32]>>) -> Result<Report, PipelineError> {
        let uploaded = self.upload(dataset.into())?;
        let first = self.first_wave(uploaded).await?;
        let known = self.mean(first);
        let variance = self.variance(known).await?;
        Ok(self.finalize(variance))
    }

    /// `Idle -> Uploaded`: pad a private copy per operator with its identity.
    pub fn upload(&self, dataset: Arc<[i32]>) -> Result<Uploaded, PipelineError> {
        self.check_cancelled(Stage::Uploaded)?;
        if dataset.is_empty() {
            return Err(PipelineError::EmptyDataset);
        }
        check_dataset_len(dataset.len())?;

        let local_size = self.options.local_size;
        let wide: Vec<i64> = dataset.iter().map(|&x| x as i64).collect();
        let uploaded = Uploaded {
            started_at: Utc::now(),
            count: dataset.len(),
            min_lanes: pad::pad_for(ReduceOp::Min, &dataset, local_size).into(),
            max_lanes: pad::pad_for(ReduceOp::Max, &dataset, local_size).into(),
            sum_lanes: pad::pad_for(ReduceOp::Sum, &wide, local_size).into(),
            deviation_lanes: pad::pad(&dataset, local_size, 0).into(),
            timings: Vec::new(),
        };

        info!(
            count = uploaded.count,
            padded = uploaded.padded_len(),
            local_size,
            "dataset uploaded"
        );
        Ok(uploaded)
    }

    /// `Uploaded -> FirstWaveComplete`: min, max, sum (and atomic min/max)
    /// dispatched together and all read back before returning.
    pub async fn first_wave(&self, mut uploaded: Uploaded) -> Result<FirstWave, PipelineError> {
        let stage = Stage::FirstWaveDispatched;
        let local_size = self.options.local_size;
        let min_input = ReduceInput {
            data: Arc::clone(&uploaded.min_lanes),
            local_size,
        };
        let max_input = ReduceInput {
            data: Arc::clone(&uploaded.max_lanes),
            local_size,
        };
        let sum_input = ReduceInput {
            data: Arc::clone(&uploaded.sum_lanes),
            local_size,
        };

        let atomic = |op: ReduceOp, input: ReduceInput<i32>| async move {
            if self.options.compare_atomic {
                self.dispatch::<_, _, i32>(stage, Reduction::atomic(op), input)
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };

        info!(
            stage = %stage,
            compare_atomic = self.options.compare_atomic,
            "dispatching first wave"
        );
        let ((min, min_t), (max, max_t), (sum, sum_t), atomic_min, atomic_max) = tokio::try_join!(
            self.dispatch::<_, _, i32>(stage, Reduction::tree(ReduceOp::Min), min_input.clone()),
            self.dispatch::<_, _, i32>(stage, Reduction::tree(ReduceOp::Max), max_input.clone()),
            self.dispatch::<_, _, i64>(stage, Reduction::tree(ReduceOp::Sum), sum_input),
            atomic(ReduceOp::Min, min_input),
            atomic(ReduceOp::Max, max_input),
        )?;

        uploaded.timings.extend([min_t, max_t, sum_t]);
        let atomic_min = self.compare(ReduceOp::Min, min, atomic_min, &mut uploaded.timings)?;
        let atomic_max = self.compare(ReduceOp::Max, max, atomic_max, &mut uploaded.timings)?;

        info!(stage = %Stage::FirstWaveComplete, min, max, sum, "first wave read back");
        Ok(FirstWave {
            uploaded,
            min,
            max,
            sum,
            atomic_min,
            atomic_max,
        })
    }

    fn compare(
        &self,
        op: ReduceOp,
        tree: i32,
        atomic: Option<(i32, StageTiming)>,
        timings: &mut Vec<StageTiming>,
    ) -> Result<Option<i32>, PipelineError> {
        let Some((value, timing)) = atomic else {
            return Ok(None);
        };
        timings.push(timing);
        if value != tree {
            return Err(PipelineError::StrategyMismatch {
                op,
                tree: tree as i64,
                atomic: value as i64,
            });
        }
        Ok(Some(value))
    }

    /// `FirstWaveComplete -> MeanKnown`, over the unpadded count.
    pub fn mean(&self, first: FirstWave) -> MeanKnown {
        let count = first.uploaded.count;
        let mean = fixed::decode(first.sum) / count as f64;
        let mean_encoded = fixed::encode_mean(first.sum, count);
        info!(stage = %Stage::MeanKnown, mean, mean_encoded, "mean computed");
        MeanKnown {
            first,
            mean_encoded,
            mean,
        }
    }

    /// `MeanKnown -> VarianceComplete`: squared deviations as limbs, then
    /// both limb sums concurrently.
    pub async fn variance(&self, mut known: MeanKnown) -> Result<VarianceComplete, PipelineError> {
        let local_size = self.options.local_size;
        let uploaded = &known.first.uploaded;
        let input = DeviationInput {
            data: Arc::clone(&uploaded.deviation_lanes),
            logical_len: uploaded.count,
            local_size,
        };

        let (squares, deviation_t) = self
            .dispatch::<_, _, SquareLimbs>(
                Stage::VarianceDispatched,
                SquaredDeviation {
                    mean: known.mean_encoded,
                },
                input,
            )
            .await?;

        let limb_input = |limbs: &[i64]| ReduceInput {
            data: pad::pad_for(ReduceOp::Sum, limbs, local_size).into(),
            local_size,
        };
        let sum = || Reduction::tree(ReduceOp::Sum);
        let ((lo_sum, lo_t), (hi_sum, hi_t)) = tokio::try_join!(
            self.dispatch::<_, _, i64>(Stage::VarianceComplete, sum(), limb_input(&squares.lo)),
            self.dispatch::<_, _, i64>(Stage::VarianceComplete, sum(), limb_input(&squares.hi)),
        )?;

        let sum_squares = SquareLimbs::join(lo_sum, hi_sum);
        known.first.uploaded.timings.extend([deviation_t, lo_t, hi_t]);
        info!(stage = %Stage::VarianceComplete, %sum_squares, "variance reduced");
        Ok(VarianceComplete { known, sum_squares })
    }

    /// `VarianceComplete -> Finalized`: population variance over the unpadded
    /// count, corrected for the truncated kernel mean, decoded into the report.
    pub fn finalize(&self, done: VarianceComplete) -> Report {
        let VarianceComplete { known, sum_squares } = done;
        let MeanKnown {
            first,
            mean,
            mean_encoded,
        } = known;
        let count = first.uploaded.count;
        let variance = fixed::population_variance(first.sum, mean_encoded, sum_squares, count);

        let report = Report {
            run_id: uuid::Uuid::new_v4(),
            started_at: first.uploaded.started_at,
            backend: self.manager.backend(),
            device: self.manager.device().name.clone(),
            count,
            padded_count: first.uploaded.padded_len(),
            local_size: self.options.local_size,
            min: fixed::decode(first.min as i64),
            max: fixed::decode(first.max as i64),
            sum: fixed::decode(first.sum),
            mean,
            variance,
            stdev: variance.sqrt(),
            atomic_min: first.atomic_min.map(|v| fixed::decode(v as i64)),
            atomic_max: first.atomic_max.map(|v| fixed::decode(v as i64)),
            timings: first.uploaded.timings,
        };
        info!(stage = %Stage::Finalized, run_id = %report.run_id, "pipeline finalized");
        report
    }

    fn check_cancelled(&self, stage: Stage) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }

    /// Run one dispatch on the blocking pool and record its timing.
    async fn dispatch<Op, I, O>(
        &self,
        stage: Stage,
        op: Op,
        input: I,
    ) -> Result<(O, StageTiming), PipelineError>
    where
        Op: AcceleratedOp<I, O> + Send + 'static,
        I: Send + 'static,
        O: PartialEq + fmt::Debug + Send + 'static,
    {
        self.check_cancelled(stage)?;
        let manager = Arc::clone(&self.manager);
        let label = op.label();

        let (value, meta) = tokio::task::spawn_blocking(move || manager.execute(&op, &input))
            .await
            .map_err(|source| PipelineError::Join { stage, source })??;

        debug!(%stage, op = %label, duration_us = meta.duration_us, "dispatch complete");
        Ok((
            value,
            StageTiming {
                stage: label,
                backend: meta.path_used,
                duration_us: meta.duration_us,
            },
        ))
    }
}

/// Largest dataset whose limb sums cannot overflow an `i64` lane: each real
/// element adds less than `2^32` to a limb sum.
pub const MAX_DATASET_LEN: usize = i32::MAX as usize;

fn check_dataset_len(count: usize) -> Result<(), PipelineError> {
    if count > MAX_DATASET_LEN {
        return Err(PipelineError::DatasetTooLarge {
            count,
            max: MAX_DATASET_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(local_size: usize, compare_atomic: bool) -> Pipeline {
        Pipeline::new(
            Arc::new(AccelerationManager::emulated()),
            PipelineOptions {
                local_size,
                compare_atomic,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_local_size() {
        let manager = Arc::new(AccelerationManager::emulated());
        for local_size in [0, 1, 4096] {
            let result = Pipeline::new(
                Arc::clone(&manager),
                PipelineOptions {
                    local_size,
                    compare_atomic: false,
                },
            );
            assert!(matches!(result, Err(PipelineError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_mean_uses_unpadded_count() {
        let p = pipeline(10, false);
        let uploaded = p.upload(vec![100, 100, 100, 100, 100].into()).unwrap();
        assert_eq!(uploaded.padded_len(), 10);

        let first = p.first_wave(uploaded).await.unwrap();
        assert_eq!(first.min, 100);
        assert_eq!(first.sum, 500);

        let known = p.mean(first);
        assert_eq!(known.mean, 1.0);
        assert_eq!(known.mean_encoded, 100);

        let done = p.variance(known).await.unwrap();
        assert_eq!(done.sum_squares, 0);
    }

    #[tokio::test]
    async fn test_empty_dataset() {
        let p = pipeline(4, false);
        let result = p.run(Vec::<i32>::new()).await;
        assert!(matches!(result, Err(PipelineError::EmptyDataset)));
    }

    #[tokio::test]
    async fn test_cancelled_before_upload() {
        let cancel = CancellationToken::new();
        let p = pipeline(4, false).with_cancellation(cancel.clone());
        cancel.cancel();
        let result = p.run(vec![1, 2, 3]).await;
        assert!(matches!(
            result,
            Err(PipelineError::Cancelled {
                stage: Stage::Uploaded
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_between_waves() {
        let cancel = CancellationToken::new();
        let p = pipeline(4, false).with_cancellation(cancel.clone());
        let uploaded = p.upload(vec![1, 2, 3].into()).unwrap();
        let first = p.first_wave(uploaded).await.unwrap();
        let known = p.mean(first);

        cancel.cancel();
        let result = p.variance(known).await;
        assert!(matches!(
            result,
            Err(PipelineError::Cancelled {
                stage: Stage::VarianceDispatched
            })
        ));
    }

    #[tokio::test]
    async fn test_atomic_comparison_recorded() {
        let p = pipeline(8, true);
        let report = p.run(vec![-500, 250, 1200, 3, 3, 3, 3, 3, 3, 7]).await.unwrap();
        assert_eq!(report.atomic_min, Some(report.min));
        assert_eq!(report.atomic_max, Some(report.max));
        assert!(report.timings.iter().any(|t| t.stage == "atomic_min"));
    }

    #[test]
    fn test_dataset_length_limit() {
        assert!(check_dataset_len(MAX_DATASET_LEN).is_ok());
        assert!(matches!(
            check_dataset_len(MAX_DATASET_LEN + 1),
            Err(PipelineError::DatasetTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_mean_is_corrected() {
        // 0.01, 0.02: the kernel mean truncates 1.5 to 1
        let report = pipeline(2, false).run(vec![1, 2]).await.unwrap();
        assert_eq!(report.variance, 0.000025);
        assert!((report.stdev - 0.005).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_square_sums_do_not_overflow() {
        let data: Vec<i32> = (0..2000)
            .map(|i| if i % 2 == 0 { 100_000_000 } else { -100_000_000 })
            .collect();
        let report = pipeline(32, false).run(data).await.unwrap();
        assert_eq!(report.variance, 1e12);
        assert_eq!(report.stdev, 1e6);
    }
}
