use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cell-self-util")]
#[command(about = "PS3 SELF file utility", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v: info, -vv: debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decrypt a SELF file into an ELF file
    Decrypt {
        /// Path to the SELF file
        #[arg(value_name = "SELF_FILE")]
        self_path: PathBuf,

        /// Output ELF file (defaults to the input with an .elf extension)
        #[arg(short, long, value_name = "ELF_FILE")]
        output: Option<PathBuf>,

        /// Key file holding the SELF keysets
        #[arg(short, long, value_name = "KEY_FILE")]
        keys: Option<PathBuf>,

        /// Directory holding the emulated dev_hdd0 tree
        #[arg(long, value_name = "DIR", default_value = "dev_hdd0")]
        dev_hdd0: PathBuf,

        /// User profile searched for .rap licenses
        #[arg(long, value_name = "ID", default_value = "00000001")]
        profile: String,
    },

    /// Display the headers of a SELF file
    Info {
        /// Path to the SELF file
        #[arg(value_name = "SELF_FILE")]
        self_path: PathBuf,
    },
}
