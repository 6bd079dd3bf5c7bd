use std::env;
use std::sync::LazyLock;

macro_rules! define_env_vars {
    ($(($name:ident, $env_name:expr, $type:ty)),* $(,)?) => {
        $(
            pub static $name: LazyLock<$type> = LazyLock::new(|| {
                let val = env::var($env_name).unwrap_or_else(|_| {
                    panic!("Missing required environment variable: {}", $env_name)
                });
                val.parse::<$type>().unwrap_or_else(|_| {
                    panic!(
                        "Failed to parse environment variable {} with value '{}' as {}",
                        $env_name,
                        val,
                        stringify!($type)
                    )
                })
            });
        )*

        /// Force initialization of all required environment variables at startup
        /// Call this early in main() to fail fast if any env vars are missing
        pub fn check_env() {
            $(
                let _ = *$name;
            )*
            check_optional_env();
        }
    };
}

/// Same as `define_env_vars!`, but a missing variable is `None`. A variable
/// that is set but can't be parsed still panics.
macro_rules! define_optional_env_vars {
    ($(($name:ident, $env_name:expr, $type:ty)),* $(,)?) => {
        $(
            pub static $name: LazyLock<Option<$type>> = LazyLock::new(|| {
                let val = env::var($env_name).ok().filter(|v| !v.trim().is_empty())?;
                Some(val.parse::<$type>().unwrap_or_else(|_| {
                    panic!(
                        "Failed to parse environment variable {} with value '{}' as {}",
                        $env_name,
                        val,
                        stringify!($type)
                    )
                }))
            });
        )*

        fn check_optional_env() {
            $(
                let _ = *$name;
            )*
        }
    };
}

define_env_vars!(
    (PORT, "PORT", u16),
    (PEER_NAME, "PEER_NAME", String),
    (IPAM_UNIVERSE, "IPAM_UNIVERSE", String),
    (INTERNAL_PASSWORD, "INTERNAL_PASSWORD", String),
);

define_optional_env_vars!(
    (PEER_NICKNAME, "PEER_NICKNAME", String),
    (IPAM_DEFAULT_SUBNET, "IPAM_DEFAULT_SUBNET", String),
    (IPAM_MODE, "IPAM_MODE", String),
    (IPAM_QUORUM, "IPAM_QUORUM", u32),
    (
        IPAM_REQUEST_TIMEOUT_SECONDS,
        "IPAM_REQUEST_TIMEOUT_SECONDS",
        u64
    ),
    (IPAM_DATA_DIR, "IPAM_DATA_DIR", String),
    (IPAM_GOSSIP_PEERS, "IPAM_GOSSIP_PEERS", String),
    (IPAM_TRACK_RANGES, "IPAM_TRACK_RANGES", bool),
);
