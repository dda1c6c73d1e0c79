use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

// Start time for dmesg-style timestamps
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Installs the global logger.
///
/// Records go to stderr, or to `output` when given ("-" means stdout).
/// `RUST_LOG` overrides the default level.
pub fn log_init(output: Option<&Path>, verbose: bool) -> io::Result<()> {
    START_TIME.get_or_init(Instant::now);

    let log_level = if verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level));

    builder.format(|buf, record| {
        let elapsed = START_TIME.get_or_init(Instant::now).elapsed();

        // [  123.456789] LEVEL message
        writeln!(
            buf,
            "[{:5}.{:06}] {} {}",
            elapsed.as_secs(),
            elapsed.subsec_micros(),
            record.level(),
            record.args()
        )
    });

    match output {
        Some(path) if path == Path::new("-") => {
            builder.target(env_logger::Target::Stdout);
        }
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(0o600)
                .open(path)?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {}
    }

    builder
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Log engine failure: {}", e)))
}
