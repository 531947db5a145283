//! Well-known filesystem paths.

use std::path::PathBuf;

/// Default listening socket of the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/run/sid.sock";

/// Default on-disk snapshot of the main key-value store.
pub const DEFAULT_DB_PATH: &str = "/run/sid.db";

/// Resolves the daemon socket path, honoring `SID_SOCKET`.
#[must_use]
pub fn socket_path() -> PathBuf {
	std::env::var_os("SID_SOCKET")
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Resolves the store snapshot path, honoring `SID_DB`.
#[must_use]
pub fn db_path() -> PathBuf {
	std::env::var_os("SID_DB")
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}
