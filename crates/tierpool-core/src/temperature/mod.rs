//! Temperature Sampler: decayed access scores per file and per drive.

mod decay;
mod sampler;
mod source;

pub use decay::DecayModel;
pub use sampler::{unix_now, SampleReport, TemperatureEntry, TemperatureSampler, TemperatureSnapshot};
pub use source::{AccessEvent, AccessSource, AtimeSource, JournalSource, SourceBatch};
