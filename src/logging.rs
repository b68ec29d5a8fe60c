use env_logger::Env;

/// Install the process-wide logger. `COURTVAULT_LOG` takes the usual
/// `RUST_LOG` filter syntax and defaults to `info`.
pub fn init() {
    let env = Env::default()
        .filter_or("COURTVAULT_LOG", "info")
        .write_style("COURTVAULT_LOG_STYLE");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_secs()
        .format_target(false)
        .try_init();
}
