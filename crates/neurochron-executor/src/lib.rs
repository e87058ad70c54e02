//! Collaborator backends for the NeuroChron pipeline.
//!
//! - Docker-isolated preprocessing tool
//! - Subprocess converter and age model
//! - Log and SendGrid notifiers

pub mod docker;
pub mod notifier;
pub mod process;

pub use docker::DockerPreprocessor;
pub use notifier::{LogNotifier, SendGridNotifier, build_notifier};
pub use process::{CommandConverter, CommandPredictor};
