//! Console + per-level file logging, mirroring the original `spdlog` setup
//! (console + `debug.log` + `info.log`, extended with a `warn.log`/`error.log`
//! split since `fern` dispatches per level directly).

use std::path::Path;

pub fn init(dir: impl AsRef<Path>) -> Result<(), fern::InitError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let format = |out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record| {
        out.finish(format_args!(
            "[{} {} {}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            message
        ))
    };

    let console = fern::Dispatch::new()
        .format(format)
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout());

    let debug_file = fern::Dispatch::new()
        .format(format)
        .level(log::LevelFilter::Debug)
        .chain(fern::log_file(dir.join("debug.log"))?);

    let info_file = fern::Dispatch::new()
        .format(format)
        .level(log::LevelFilter::Info)
        .chain(fern::log_file(dir.join("info.log"))?);

    let warn_file = fern::Dispatch::new()
        .format(format)
        .level(log::LevelFilter::Warn)
        .chain(fern::log_file(dir.join("warn.log"))?);

    let error_file = fern::Dispatch::new()
        .format(format)
        .level(log::LevelFilter::Error)
        .chain(fern::log_file(dir.join("error.log"))?);

    fern::Dispatch::new()
        .chain(console)
        .chain(debug_file)
        .chain(info_file)
        .chain(warn_file)
        .chain(error_file)
        .apply()?;

    Ok(())
}
