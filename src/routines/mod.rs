// Annealing schedules
pub mod anneal;
// Candidate selection and label masks
pub mod candidates;
// Per-iteration metrics
pub mod datalog;
// Posterior scoring
pub mod estep;
// Synthetic data
pub mod generate;
// Routines for logging
pub mod logger;
// Numerical helpers
pub mod math;
// Sufficient statistics and parameter updates
pub mod mstep;
// Truncated prior correction
pub mod prior;
// Routines for settings
pub mod settings;
// Evidence-based truncation
pub mod truncation;
