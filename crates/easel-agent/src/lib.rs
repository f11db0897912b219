//! Provisioning and supervision of isolated ComfyUI project installs.

pub mod best_effort;
pub mod command;
pub mod config;
pub mod context;
pub mod download;
pub mod pipeline;
pub mod port_alloc;
pub mod process_tree;
pub mod project_dir;
pub mod projects;
pub mod queue;
pub mod state_store;
pub mod supervisor;
pub mod toolchain;
pub mod workflow;
