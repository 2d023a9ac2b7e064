pub mod error;
pub mod timetools;
pub mod indexing;
pub mod interpolation;
pub mod nc_utils;
pub mod range_reader;
pub mod multi_read;
pub mod climatology;
pub mod model_files;
pub mod obs_reader;
pub mod host_config;
pub mod logging;
pub mod retrieval;

#[cfg(test)]
mod test_utils;
