//! log 门面的后端: 输出到 stderr, 带 dmesg 风格的相对时间戳和按级别区分的颜色

use chrono::{DateTime, Local};
use lazy_static::*;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct PmdLogger {
    /// 进程启动时刻, 时间戳都相对于它
    started: DateTime<Local>,
}

impl PmdLogger {
    fn color(level: Level) -> u8 {
        match level {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        }
    }
}

impl Log for PmdLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = Local::now().signed_duration_since(self.started);
        let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
        eprintln!(
            "\u{1B}[{}m[{:>5}.{:06}] {:>5} {}\u{1B}[0m",
            Self::color(record.level()),
            micros / 1_000_000,
            micros % 1_000_000,
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

lazy_static! {
    static ref LOGGER: PmdLogger = PmdLogger {
        started: Local::now(),
    };
}

/// -v 的个数 -> 日志级别
pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// 安装 logger; 重复调用时只更新级别
pub fn init(level: LevelFilter) {
    match log::set_logger(&*LOGGER) {
        Ok(()) => {}
        // 已经装过 logger (再次调用 init), 全局 logger 只能设置一次, 沿用它并更新级别
        Err(_) => log::debug!("logger already installed, updating level to {}", level),
    }
    log::set_max_level(level);
}
