mod cli;

use cell_self::{Decrypter, Outcome};
use cell_self_util::Config;
use clap::Parser;
use cli::{Cli, Command};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Top-level application errors for cell-self-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to load configuration"))]
    Config {
        source: cell_self_util::ConfigError,
    },

    #[snafu(display("failed to decrypt '{}'", path.display()))]
    Decrypt {
        path: PathBuf,
        source: cell_self::DecryptError,
    },

    #[snafu(display("failed to open SELF file '{}'", path.display()))]
    OpenSelf {
        path: PathBuf,
        source: cell_self_util::OpenSelfError,
    },

    #[snafu(display("failed to write to stdout"))]
    WriteStdout { source: std::io::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Command::Decrypt {
            self_path,
            output,
            keys,
            dev_hdd0,
            profile,
        } => {
            let config = Config {
                keys,
                dev_hdd0,
                profile,
            };

            cmd_decrypt(&self_path, output.as_deref(), &config)
        }
        Command::Info { self_path } => cmd_info(&self_path),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_decrypt(path: &Path, output: Option<&Path>, config: &Config) -> Result<()> {
    let output = output.map_or_else(|| cell_self_util::default_output(path), Path::to_path_buf);
    let vault = config.load_vault().context(ConfigSnafu)?;
    let decrypter = Decrypter::new(&vault, config.licenses());

    println!("Decrypting {} to {}...", path.display(), output.display());

    let start = std::time::Instant::now();
    let outcome = decrypter
        .decrypt_file(path, &output)
        .context(DecryptSnafu { path })?;
    let elapsed = start.elapsed();

    match outcome {
        Outcome::Decrypted => println!("Done in {:.2}s.", elapsed.as_secs_f64()),
        Outcome::DebugPassthrough => println!("Debug SELF, embedded ELF copied."),
    }

    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let container = cell_self_util::open_self(path).context(OpenSelfSnafu { path })?;
    let mut stdout = std::io::stdout().lock();

    cell_self_util::write_info(&mut stdout, path, &container).context(WriteStdoutSnafu)
}
