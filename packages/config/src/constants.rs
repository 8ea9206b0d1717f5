// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across SBPanel

// Database Configuration
pub const SBPANEL_DATABASE_URL: &str = "SBPANEL_DATABASE_URL";
pub const DATABASE_URL: &str = "DATABASE_URL"; // Legacy fallback

// Runtime Configuration
pub const SBPANEL_BASE_IMAGE: &str = "SBPANEL_BASE_IMAGE";
pub const SBPANEL_RUNTIME_PREFIX: &str = "SBPANEL_RUNTIME_PREFIX";
pub const SBPANEL_STOP_TIMEOUT_SECS: &str = "SBPANEL_STOP_TIMEOUT_SECS";
pub const SBPANEL_PULL_TIMEOUT_SECS: &str = "SBPANEL_PULL_TIMEOUT_SECS";

// Provisioning Worker Pool
pub const SBPANEL_PROVISION_WORKERS: &str = "SBPANEL_PROVISION_WORKERS";
pub const SBPANEL_PROVISION_QUEUE_CAPACITY: &str = "SBPANEL_PROVISION_QUEUE_CAPACITY";

// CLI
pub const SBPANEL_ACCOUNT: &str = "SBPANEL_ACCOUNT";
