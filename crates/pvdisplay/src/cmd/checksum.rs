//! Compute the protocol CRC-16 over arbitrary bytes, for comparing
//! against another implementation's footers.

use clap::Args;
use pvdisplay_wire::crc16_blob;

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::{print_checksum, OutputFormat};

#[derive(Args, Debug)]
pub struct ChecksumArgs {
    /// Hex-encoded bytes to checksum (whitespace allowed).
    #[arg(long, conflicts_with = "file")]
    pub hex: Option<String>,

    /// File whose contents are checksummed.
    #[arg(long)]
    pub file: Option<std::path::PathBuf>,
}

pub fn run(args: ChecksumArgs, format: OutputFormat) -> CliResult<i32> {
    let data = match (&args.hex, &args.file) {
        (Some(hex), None) => parse_hex(hex)?,
        (None, Some(path)) => {
            std::fs::read(path).map_err(|err| io_error("reading checksum input", err))?
        }
        _ => {
            return Err(CliError::new(
                USAGE,
                "exactly one of --hex or --file is required",
            ))
        }
    };

    let crc = crc16_blob(&data);
    print_checksum(crc, data.len(), format);
    Ok(crate::exit::SUCCESS)
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<char> = input.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(USAGE, "hex input has an odd digit count"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16)
                .map_err(|_| CliError::new(USAGE, format!("invalid hex byte {byte:?}")))
        })
        .collect()
}
