use tunwire_speaker::{PREAMBLE, SUPPORTED_VERSIONS};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("tunwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let versions = SUPPORTED_VERSIONS
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    println!("name: tunwire");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("preamble: {PREAMBLE}");
    println!("protocol_versions: {versions}");
    println!(
        "target: {}",
        option_env!("TUNWIRE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("features: speaker={}, cli=true", cfg!(feature = "speaker"));

    Ok(SUCCESS)
}
