//! parastat -- data-parallel summary statistics over work-group reductions.
//!
//! A dataset of decimal measurements is fixed-point encoded, padded to whole
//! work-groups, and reduced on an OpenCL device or a host emulation of the
//! work-group model. The two-phase driver produces min, max, sum, mean,
//! population variance and standard deviation.

pub mod accel;
pub mod config;
pub mod fixed;
pub mod ingest;
pub mod pipeline;
pub mod report;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use accel::{AccelerationManager, Backend, PlatformInfo};
use config::PipelineConfig;
use pipeline::Pipeline;
use report::Report;

/// Read the dataset at `input`, select the device, and run the pipeline.
pub async fn run(
    config: &PipelineConfig,
    input: &Path,
    cancel: CancellationToken,
) -> Result<Report> {
    config.validate()?;

    let path = input.to_path_buf();
    let column = config.input.column;
    let dataset = tokio::task::spawn_blocking(move || ingest::read_dataset(&path, column))
        .await
        .context("ingestion task failed")??;

    let manager = AccelerationManager::new(&config.manager_options())
        .context("device selection failed")?;
    let pipeline =
        Pipeline::new(Arc::new(manager), config.pipeline_options())?.with_cancellation(cancel);

    tracing::info!(input = %input.display(), count = dataset.len(), "starting pipeline");
    let report = pipeline.run(dataset).await?;
    Ok(report)
}

/// Every backend's platforms and devices, OpenCL first.
pub fn list_devices() -> Vec<(Backend, Vec<PlatformInfo>)> {
    [Backend::OpenCl, Backend::Emulated, Backend::Scalar]
        .into_iter()
        .map(|backend| (backend, accel::enumerate(backend)))
        .collect()
}
