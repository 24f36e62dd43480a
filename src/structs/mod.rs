pub mod params;
pub mod shard;
pub mod states;
pub mod suffstats;
