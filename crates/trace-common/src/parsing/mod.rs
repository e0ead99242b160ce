pub mod procfs;

pub use procfs::{MountNsId, ProcessSource, Procfs, ProcfsError};
