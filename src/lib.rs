pub mod action;
pub mod canon;
pub mod cancel;
pub mod cas;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod densemap;
pub mod depinfo;
pub mod description;
pub mod description_cache;
pub mod diagnostic;
pub mod engine;
pub mod error;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod memo;
pub mod module_graph;
pub mod process;
pub mod producer;
pub mod project;
pub mod run;
pub mod settings;
mod signal;
pub mod validity;
pub mod verify;
pub mod work;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
