pub mod candidate;
pub mod generator;
pub mod intent;
pub mod materialize;
