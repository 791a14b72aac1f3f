pub mod checksum;
pub mod demo;
pub mod version;

use clap::Subcommand;

use crate::exit::CliResult;
use crate::output::OutputFormat;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scripted provider/consumer handshake over the in-process
    /// transport and print the transcript.
    Demo(demo::DemoArgs),

    /// Compute the protocol's CRC-16 over hex input or a file.
    Checksum(checksum::ChecksumArgs),

    /// Print crate and protocol version information.
    Version,
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Demo(args) => demo::run(args, format),
        Command::Checksum(args) => checksum::run(args, format),
        Command::Version => version::run(format),
    }
}
