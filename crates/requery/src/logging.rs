use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};

/// Initializes a JSON-lines subscriber for the embedding process.
///
/// The env-filter string is the level gate; per-module overrides work the
/// usual way (`"info,requery=debug"`).
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_writer(make_writer)
        .init();
}
