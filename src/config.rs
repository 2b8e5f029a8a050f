use ::config::Config;
use std::time::Duration;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

/// Socket-level options applied to every descriptor a socket creates.
///
/// Options are applied when a connection attempt creates its descriptor and
/// inherited by sockets returned from [`ListenSocket::accept()`]. They can be
/// built explicitly, taken from [`Default`], or read from a
/// [`config`](https://docs.rs/config/) namespace.
///
/// # Configuration Keys
///
/// | Key | Description |
/// |-----|-------------|
/// | `nodelay` | Disable Nagle's algorithm (default: true) |
/// | `keepalive_interval_secs` | Enable TCP keepalive with this idle interval; absent means disabled |
/// | `recv_buffer_size` | Requested `SO_RCVBUF`; absent leaves the kernel default |
/// | `send_buffer_size` | Requested `SO_SNDBUF`; absent leaves the kernel default |
/// | `listen_backlog` | Pending-connection backlog for listeners (default: 64) |
///
/// Keys follow the `{name}.{key}` / `{key}` lookup priority, so several
/// engine instances can be configured from one file.
///
/// [`ListenSocket::accept()`]: crate::ListenSocket::accept
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub listen_backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
            recv_buffer_size: None,
            send_buffer_size: None,
            listen_backlog: 64,
        }
    }
}

impl SocketOptions {
    /// Reads socket options from a configuration namespace.
    ///
    /// Missing keys fall back to the defaults; only present keys override.
    pub fn from_config(config: &Config, name: &str) -> Self {
        let defaults = Self::default();
        Self {
            nodelay: get_namespaced_bool(config, name, "nodelay").unwrap_or(defaults.nodelay),
            keepalive: get_namespaced_u64(config, name, "keepalive_interval_secs")
                .ok()
                .map(Duration::from_secs),
            recv_buffer_size: get_namespaced_usize(config, name, "recv_buffer_size").ok(),
            send_buffer_size: get_namespaced_usize(config, name, "send_buffer_size").ok(),
            listen_backlog: get_namespaced_usize(config, name, "listen_backlog")
                .map(|v| v as i32)
                .unwrap_or(defaults.listen_backlog),
        }
    }
}
