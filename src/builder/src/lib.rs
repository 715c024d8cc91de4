//! Kiln Build - multi-stage OCI image build executor.
//!
//! Takes already-parsed stages, runs their instructions against working
//! containers, reuses cached layers where it can and commits images into
//! an [`ImageStore`].

#![allow(clippy::result_large_err)]

pub mod args;
pub mod cache;
pub mod container;
pub mod context;
pub mod coordinator;
pub mod copier;
pub mod dispatch;
pub mod history;
pub mod image;
pub mod passwd;
pub mod progress;
pub mod runtime;
pub mod securepath;
pub mod stage;
pub mod stage_runner;
pub mod state;
pub mod storage;
pub mod store;
pub mod volumes;
pub mod words;

// Re-export common types
pub use cache::{CacheMatcher, CacheQuery, CacheState};
pub use context::BuildContext;
pub use coordinator::{BuildCoordinator, BuildOutcome, SCRATCH};
pub use image::{CommitOptions, HistoryEntry, ImageConfig, ImageRecord};
pub use runtime::{ChrootRuntime, ContainerRuntime, RunRequest};
pub use stage::{Instruction, InstructionKind, MountKind, RunMount, Stage, Step};
pub use stage_runner::{StageEnv, StagePlan, StageResult, StageRunner};
pub use storage::LocalStore;
pub use store::ImageStore;
pub use volumes::VolumeCache;

pub use kiln_core::{BuildError, BuildOptions, Result};
