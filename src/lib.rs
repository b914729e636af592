use std::io::Write;

use anyhow::Context;
use colored::Colorize;
use structopt::StructOpt;

pub mod config;
pub mod daemon;
pub mod dbus;
pub mod level;
pub mod memlock;
pub mod meminfo;
pub mod monitor;
pub mod psi;
pub mod sysrq;

use crate::config::{Config, Opt};

pub fn dispatch() -> anyhow::Result<()> {
    config_logging();
    let version = env!("CARGO_PKG_VERSION");
    log::info!("low-memory-monitor v{} starting...", version);

    let opt = Opt::from_args();

    // before the heap grows: everything mapped from here on stays resident
    memlock::lock_memory().context("failed to lock memory")?;

    let config = Config::load(&opt.config);
    smolscale::block_on(daemon::run(config))
}

fn config_logging() {
    if let Err(e) = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("low_memory_monitor=info,warn"),
    )
    .format_timestamp_millis()
    .format(|buf, record| {
        writeln!(
            buf,
            "[{} {}]: {}",
            record.module_path().unwrap_or("none").dimmed(),
            match record.level() {
                log::Level::Error => "ERRO".red(),
                log::Level::Warn => "WARN".bright_yellow(),
                log::Level::Info => "INFO".bright_green(),
                log::Level::Debug => "DEBG".bright_blue(),
                log::Level::Trace => "TRAC".bright_black(),
            },
            record.args()
        )
    })
    .format_target(false)
    .try_init()
    {
        log::debug!("{}", e);
    }
}
