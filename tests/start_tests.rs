use dbsc_et::prelude::*;
use dbsc_et::routines::generate::single_cause_data;
use eyre::Result;
use ndarray::array;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Installs the global subscriber, so it lives in its own test binary
#[test]
fn test_start_from_settings_file() -> Result<()> {
    let w_true = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let mut shard = single_cause_data(&ModelParameters::new(w_true, 0.5, 1.0), 45);
    let mut rng = StdRng::seed_from_u64(12);
    let normal = Normal::new(0.0, 0.05)?;
    shard.y.mapv_inplace(|v| v + normal.sample(&mut rng));

    let result = dbsc_et::start("tests/data/settings.toml", SingleProcess, shard)?;
    assert_eq!(result.iterations, 10);
    assert_eq!(result.status, Status::ScheduleFinished);
    assert_eq!(result.log.series("L").len(), 10);

    // Logging is set up once per process
    let settings = Settings::read("tests/data/settings.toml")?;
    assert!(setup_log(&settings).is_err());

    Ok(())
}
