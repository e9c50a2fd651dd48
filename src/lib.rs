//! Lifecycle acceptance harness
//!
//! Provisions the ephemeral infrastructure a lifecycle phase needs for an
//! acceptance test (daemon fixture images, an ephemeral registry with
//! permission-restricted images, registry credentials and a test image
//! carrying the freshly compiled phase binary) and tears it down again.

pub mod backoff;
pub mod builder;
pub mod compiler;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod fsutil;
pub mod metadata;
pub mod phase;
pub mod registry;
pub mod testing;

pub use error::{CleanupFailure, Error, Result};

pub use builder::{unique_name, FixtureImageBuilder, FixtureTemplate};
pub use compiler::{BinaryCompiler, MakeCompiler};
pub use config::{
    validate_phase_name, HarnessConfig, PhaseTestOptions, Validate, ValidationResult,
};
pub use credentials::{
    build_registry_auth, DockerConfig, RegistryCredentials, ScopedEnvVar, DOCKER_CONFIG_ENV,
};
pub use daemon::TargetDaemon;
pub use engine::{BuildRequest, DaemonInfo, DockerCli, ImageEngine};
pub use fixtures::{
    cleanup_fixtures, is_deliberately_inaccessible, DaemonFixtures, FixtureSet, FixtureState,
    RegistryFixtures, INACCESSIBLE_MARKER,
};
pub use metadata::PreparedMetadata;
pub use phase::{Collaborators, PhaseEnv, PhaseTest, RegistryEnv, StartHook};
pub use registry::{
    network_mode_for, DockerRegistry, NetworkMode, Privilege, PrivilegeTable, RegistryHandle,
    TargetRegistry,
};
