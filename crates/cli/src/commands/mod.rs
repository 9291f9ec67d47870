//! CLI command implementations

pub mod run;
pub mod validate;

pub use run::RunCommand;
pub use validate::ValidateCommand;
