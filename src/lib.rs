//! Expectation Truncation EM for binary sparse coding
//!
//! One EM iteration selects `Hprime` candidate causes per datapoint, scores every admissible
//! activation pattern over them, drops the lowest-evidence part of the batch and updates the
//! dictionary `W`, the activation probability `pi`, the noise scale `sigma` and the offset
//! `mu` from posterior-weighted sufficient statistics. The batch is split across workers that
//! meet in the collectives of a [Communicator](comm::Communicator).

pub mod algorithms;
pub mod comm;
pub mod error;
pub mod routines;
pub mod structs;

pub mod prelude {
    pub use crate::algorithms::{DbscEt, Em, EmResult, MStepOutput, Status};
    pub use crate::comm::{Communicator, LocalComm, LocalGroup, Payload, SingleProcess};
    pub use crate::error::EtError;
    pub use crate::routines::anneal::{Annealing, ConstantAnnealing, LinearAnnealing, Ramp};
    pub use crate::routines::candidates::LabelMask;
    pub use crate::routines::datalog::{DataLog, Metric, MetricsSink, NullSink};
    pub use crate::routines::generate::{generate_from_hidden, generate_hidden};
    pub use crate::routines::logger::setup_log;
    pub use crate::routines::settings::Settings;
    pub use crate::structs::params::{ModelParameters, Param, ParamValue, ToLearn};
    pub use crate::structs::shard::DataShard;
    pub use crate::structs::states::StateMatrix;
    pub use crate::structs::suffstats::SufficientStatistics;
}

use eyre::Result;

use prelude::*;

/// Fit the model to this worker's shard, configured by the settings file at `settings_path`.
///
/// Sets up logging, so call it once per process.
pub fn start<C: Communicator>(settings_path: &str, comm: C, shard: DataShard) -> Result<EmResult> {
    let settings = Settings::read(settings_path)?;
    setup_log(&settings)?;
    tracing::info!(
        "Fitting H = {} causes to {} local datapoints on worker {}/{}",
        settings.model.h,
        shard.len(),
        comm.rank(),
        comm.size()
    );
    Em::from_settings(&settings, comm, shard)?.fit()
}
