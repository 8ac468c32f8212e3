//! Host platform (linux for example) utility functions

use std::env;
use std::path::PathBuf;

/// Environment variable pointing at the root of the software tree. Parameter files are found
/// under `<root>/params` and sessions are created under `<root>/<sessions_dir>`.
pub const SW_ROOT_ENV_VAR: &str = "CAMROT_SW_ROOT";

/// Retrieve uname information.
pub fn get_uname() -> std::io::Result<uname::Info> {
    uname::uname()
}

/// Get the software root directory from the environment.
pub fn get_sw_root() -> Result<PathBuf, env::VarError> {
    env::var(SW_ROOT_ENV_VAR).map(PathBuf::from)
}

/// Whether the process is running on a Raspberry Pi class host (linux on an ARM core).
pub fn is_pi_target() -> bool {
    cfg!(all(
        target_os = "linux",
        any(target_arch = "arm", target_arch = "aarch64")
    ))
}
