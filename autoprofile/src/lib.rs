pub mod allocation;
pub mod callsite;
pub mod config;
pub mod error;
pub mod flag;
pub mod process;
pub mod profile;
pub mod profiler;
pub mod recorder;
pub mod sampler;
pub mod scheduler;
pub mod symbolicate;
pub mod timer;

pub use allocation::*;
pub use callsite::*;
pub use config::*;
pub use error::*;
pub use flag::*;
pub use process::*;
pub use profile::*;
pub use profiler::*;
pub use recorder::*;
pub use sampler::*;
pub use scheduler::*;
pub use symbolicate::*;
pub use timer::*;

pub use autoprofile_common::{Line, Location, Sample, Snapshot, SnapshotError, ValueType};
