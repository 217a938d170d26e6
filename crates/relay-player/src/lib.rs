pub mod codec;
pub mod config;
pub mod controller;
pub mod decode;
pub mod demux;
pub mod encode;
pub mod error;
pub mod hls;
pub mod pipeline;
pub mod resample;
pub mod source;
