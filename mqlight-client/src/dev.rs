use env_logger::Builder;
use std::io::Write;

/// Initialize `env_logger` with millisecond timestamps and colored levels. The filter comes
/// from `RUST_LOG`. Calling it more than once does nothing.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder.format_timestamp_millis().format(|buf, record| {
        let level = buf.default_level_style(record.level()).bold();

        writeln!(
            buf,
            "{} - [{level}{:5}{level:#}] {}:{} - {}",
            buf.timestamp_millis(),
            record.level(),
            record.file().unwrap_or_default(),
            record.line().unwrap_or_default(),
            record.args()
        )
    });

    let _ = builder.try_init();
}
