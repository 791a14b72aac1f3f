use crate::exit::CliResult;
use crate::output::{print_version, OutputFormat};

pub fn run(format: OutputFormat) -> CliResult<i32> {
    print_version(format);
    Ok(crate::exit::SUCCESS)
}
