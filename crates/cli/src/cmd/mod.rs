mod build;
mod export;
mod run;

pub use build::{BuildArgs, cmd_build};
pub use export::{ExportArgs, cmd_export};
pub use run::{RunArgs, cmd_run};
