// ABOUTME: Shared configuration surface for SBPanel binaries
// ABOUTME: Exposes environment variable names and their default values

pub mod constants;

pub mod defaults {
    pub const DATABASE_URL: &str = "sqlite://sbpanel.db?mode=rwc";
    pub const BASE_IMAGE: &str = "ubuntu:20.04";
    pub const RUNTIME_PREFIX: &str = "sbpanel";
    pub const STOP_TIMEOUT_SECS: u64 = 10;
    pub const PULL_TIMEOUT_SECS: u64 = 600;
    pub const PROVISION_WORKERS: usize = 2;
    pub const PROVISION_QUEUE_CAPACITY: usize = 32;
}
