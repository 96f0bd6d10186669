//! Collaborator adapters for k0s clusters running on footloose machines
//!
//! - [`ssh::SshShell`]: remote shell over SSH
//! - [`k0s::K0sBootstrap`]: controller/worker bootstrap and image import
//! - [`token::PodExecTokenIssuer`]: join tokens from a control-plane pod

#![deny(missing_docs)]

pub mod k0s;
pub mod ssh;
pub mod token;

pub use k0s::{K0sBootstrap, K0sSettings};
pub use ssh::{SshSettings, SshShell};
pub use token::PodExecTokenIssuer;
