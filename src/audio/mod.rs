pub mod adapter;
pub mod chroma;
pub mod control;
pub mod decode;
pub mod features;
pub mod history;
pub mod novelty;
pub mod pipeline;
pub mod spectral;
pub mod tempo;
pub mod vu;
pub mod window;
