use colored::{Color, Colorize};
use common::config::Config;
use common::util;
use flate2::{write::GzEncoder, Compression};
use log::{error, Level, Record};
use log4rs::{
    append::{
        rolling_file::{
            policy::compound::{roll::Roll, trigger::size::SizeTrigger, CompoundPolicy},
            RollingFileAppender,
        },
        Append,
    },
    config::{Appender, Root},
    encode::{self, Encode},
    filter::{Filter, Response},
};
use rustyline::ExternalPrinter;
use std::{
    fmt::{self, Debug, Formatter},
    fs::{self, File},
    io::{self, Write as _},
    path::{Component, Path, PathBuf},
    sync::Mutex,
    thread,
};
use time::OffsetDateTime;

const LOG_DIR: &str = "./logs";
const LATEST_LOG: &str = "./logs/latest.log";
const ROLLING_LOG: &str = "./logs/latest-tmp.log";
const FILE_SIZE_LIMIT: u64 = 50_000_000;
const WORKSPACE_CRATES: [&str; 4] = ["common", "entity", "rest", "engine"];

/// Console output goes through the line editor's printer so log lines never land in the
/// middle of a command being typed. Everything is also written to `logs/latest.log`.
pub fn init_logger<P: ExternalPrinter + Send + 'static>(
    mut printer: P,
) -> Result<(), anyhow::Error> {
    printer.print("\n".to_owned())?;

    let console = ReplAppender {
        printer: Mutex::new(printer),
    };

    let log_file = RollingFileAppender::builder()
        .encoder(Box::new(PlainEncoder))
        .build(
            LATEST_LOG,
            Box::new(CompoundPolicy::new(
                Box::new(SizeTrigger::new(FILE_SIZE_LIMIT)),
                Box::new(ArchiveRoller::new()),
            )),
        )?;

    let config = log4rs::Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(WorkspaceFilter))
                .build("console", Box::new(console)),
        )
        .appender(
            Appender::builder()
                .filter(Box::new(WorkspaceFilter))
                .build("log_file", Box::new(log_file)),
        )
        .build(
            Root::builder()
                .appender("console")
                .appender("log_file")
                .build(Config::get().log_level_filter),
        )?;

    log4rs::init_config(config)?;

    Ok(())
}

/// Archives the session's log. Called once on the way out.
pub fn cleanup() {
    // Nothing left to report a failure to
    let _ = ArchiveRoller::new().archive(Path::new(LATEST_LOG), false);
}

fn local_now() -> OffsetDateTime {
    Config::localize(OffsetDateTime::now_utc())
}

/// `[14:02:11 INFO]: message`, with the source location added below warn level.
fn render(record: &Record<'_>) -> String {
    let time = util::format_or_placeholder(local_now(), &util::TIME_FORMAT);
    let level = record.level();

    match source_location(record) {
        Some((file, line)) => format!("[{time} {level} {file}:{line}]: {}", record.args()),
        None => format!("[{time} {level}]: {}", record.args()),
    }
}

fn source_location(record: &Record<'_>) -> Option<(String, u32)> {
    if record.level() <= Level::Warn {
        return None;
    }

    let file = record.file()?;
    let line = record.line()?;

    let trimmed = Path::new(file)
        .components()
        .skip_while(|component| {
            matches!(
                component,
                Component::Prefix(_)
                    | Component::RootDir
                    | Component::CurDir
                    | Component::ParentDir
            ) || *component == Component::Normal("src".as_ref())
        })
        .collect::<PathBuf>();

    let file = trimmed
        .into_os_string()
        .into_string()
        .unwrap_or_else(|_| file.to_owned());
    Some((file, line))
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::White,
        Level::Debug => Color::BrightCyan,
        Level::Trace => Color::BrightMagenta,
    }
}

// Dependencies are noisy at debug level
#[derive(Debug)]
struct WorkspaceFilter;

impl Filter for WorkspaceFilter {
    fn filter(&self, record: &Record<'_>) -> Response {
        let from_workspace = record.module_path().is_some_and(|path| {
            WORKSPACE_CRATES
                .iter()
                .any(|&krate| path.split("::").next() == Some(krate))
        });

        if from_workspace {
            Response::Accept
        } else {
            Response::Reject
        }
    }
}

struct ReplAppender<P> {
    printer: Mutex<P>,
}

impl<P: ExternalPrinter + Send + 'static> Append for ReplAppender<P> {
    fn append(&self, record: &Record<'_>) -> Result<(), anyhow::Error> {
        let line = format!("{}\n", render(record).color(level_color(record.level())));

        let mut printer = self
            .printer
            .lock()
            .map_err(|_| anyhow::anyhow!("console printer lock poisoned"))?;
        printer.print(line)?;

        Ok(())
    }

    fn flush(&self) {}
}

impl<P> Debug for ReplAppender<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplAppender").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct PlainEncoder;

impl Encode for PlainEncoder {
    fn encode(&self, writer: &mut dyn encode::Write, record: &Record<'_>) -> anyhow::Result<()> {
        writeln!(writer, "{}", render(record))?;
        Ok(())
    }
}

/// Compresses full logs into `logs/<date>-<n>.log.gz`, numbering from 1 each day.
#[derive(Debug)]
struct ArchiveRoller {
    // (day of year, archives written that day)
    sequence: Mutex<(u16, u32)>,
}

impl ArchiveRoller {
    fn new() -> Self {
        let today = local_now();
        let prefix = util::format_or_placeholder(today, &util::DATE_FORMAT);

        let written_today = fs::read_dir(LOG_DIR)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix))
            .filter_map(|name| archive_index(&name))
            .max()
            .unwrap_or(0);

        Self {
            sequence: Mutex::new((today.ordinal(), written_today)),
        }
    }

    fn archive(&self, file: &Path, in_background: bool) -> Result<(), anyhow::Error> {
        let now = local_now();
        let index = {
            let mut sequence = self
                .sequence
                .lock()
                .map_err(|_| anyhow::anyhow!("log roller lock poisoned"))?;

            if sequence.0 == now.ordinal() {
                sequence.1 = sequence.1.wrapping_add(1);
            } else {
                *sequence = (now.ordinal(), 1);
            }
            sequence.1
        };

        // Move the file out of the way first so logging can continue while compressing
        fs::rename(file, ROLLING_LOG)?;

        let output = PathBuf::from(format!(
            "{LOG_DIR}/{}-{index}.log.gz",
            now.format(&*util::DATE_FORMAT)?
        ));

        if in_background {
            thread::spawn(move || compress_logged(Path::new(ROLLING_LOG), &output));
        } else {
            compress_logged(Path::new(ROLLING_LOG), &output);
        }

        Ok(())
    }
}

impl Roll for ArchiveRoller {
    fn roll(&self, file: &Path) -> Result<(), anyhow::Error> {
        self.archive(file, true)
    }
}

/// Parses `n` out of `<date>-<n>.log.gz`.
fn archive_index(name: &str) -> Option<u32> {
    let stem = name.split('.').next()?;
    let (_, index) = stem.rsplit_once('-')?;
    index.parse().ok()
}

fn compress_logged(input: &Path, output: &Path) {
    if let Err(error) = compress(input, output) {
        error!("Failed to compress log file: {error:?}");
    }
}

fn compress(input_path: &Path, output_path: &Path) -> io::Result<()> {
    let mut input = File::open(input_path)?;
    let mut output = GzEncoder::new(File::create(output_path)?, Compression::default());
    io::copy(&mut input, &mut output)?;
    output.finish()?;
    // Some platforms refuse to delete an open file
    drop(input);
    fs::remove_file(input_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names() {
        assert_eq!(archive_index("2024-10-03-7.log.gz"), Some(7));
        assert_eq!(archive_index("2024-10-03-12.log.gz"), Some(12));
        assert_eq!(archive_index("latest.log"), None);
    }

    #[test]
    fn colors_by_level() {
        assert_eq!(level_color(Level::Error), Color::Red);
        assert_eq!(level_color(Level::Warn), Color::Yellow);
    }
}
