// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Logging bootstrap for binaries that embed the task-distribution layer.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber. `RUST_LOG` wins over `default_level` when set.
///
/// Uses `try_init`, so calling it more than once is harmless.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
