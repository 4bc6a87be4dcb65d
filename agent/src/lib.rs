use env_logger::Env;

/// Initializes the global logger.
///
/// The default level is `info`, or `debug` if `debug` is true.
/// `RUST_LOG` takes precedence over both.
///
/// # Example
///
/// ```
/// use kube_service_selectors::init_logger;
///
/// fn main() {
///     init_logger(false);
///     log::info!("I can log now!");
/// }
/// ```
pub fn init_logger(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    // Print a warning if we are running in debug mode.
    #[cfg(debug_assertions)]
    {
        log::warn!("DEBUG assertions are enabled, this build is fine for debugging, but not for production.");
    }
}
