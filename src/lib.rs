pub mod calibrate;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod gpu;
pub mod ingest;
pub mod pipeline;
pub mod preprocess;
pub mod ring;
pub mod server;
pub mod sino;
pub mod stats;
pub mod surface;
