use {
    anyhow::Result,
    flexi_logger::{
        DeferredNow, Duplicate, FileSpec, Logger, LoggerHandle, Record,
        WriteMode,
    },
    regex::Regex,
    std::fmt::Write as FmtWrite,
    textwrap::{termwidth, Options},
};

/// Setup console + file logging for a driver bring-up session.
///
/// Console output is duplicated at Debug and above; the full Trace stream
/// goes to a file under `logs/`. Adjust the level by setting RUST_LOG.
///
/// The returned handle flushes buffered log lines when dropped, so keep it
/// alive for the duration of main().
pub fn setup() -> Result<LoggerHandle> {
    let handle = Logger::try_with_env_or_str("info")?
        .log_to_file(FileSpec::default().directory("logs"))
        .format(multiline_format)
        .duplicate_to_stdout(Duplicate::Debug)
        .write_mode(WriteMode::Async)
        .start()?;
    Ok(handle)
}

/// An opinionated formatting function for flexi_logger which automatically
/// wraps content to the terminal width and marks where each record begins
/// and ends.
pub fn multiline_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    let size = termwidth().min(74);
    let wrap_options = Options::new(size)
        .initial_indent("┏ ")
        .subsequent_indent("┃ ");

    let mut full_line = String::new();
    writeln!(
        full_line,
        "{} [{}] [{}:{}]",
        record.level(),
        now.now().format("%H:%M:%S%.6f"),
        record.file().unwrap_or("<unnamed>"),
        record.line().unwrap_or(0),
    )
    .expect("unable to format first log line");

    write!(&mut full_line, "{}", &record.args())
        .expect("unable to format log!");

    let wrapped = textwrap::fill(&full_line, wrap_options);
    let formatted = closing_delimiter()
        .replace(&wrapped, "┗$2")
        .into_owned();

    writeln!(w, "{}", formatted)
}

/// Matches the final wrapped line of a record so its prefix can be swapped
/// for the closing delimiter.
fn closing_delimiter() -> &'static Regex {
    use std::sync::OnceLock;
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| Regex::new(r"(┃)([^┃]*)$").unwrap())
}
