use std::env;
use std::path::Path;
use std::process;

use env_logger;

use xxlsort::config;
use xxlsort::SorterBuilder;

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let arg_parser = build_arg_parser();
    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");

    let program = env::args()
        .next()
        .unwrap_or_else(|| String::from("xxlsort"));

    let arena_size = match config::arena_size_from_env() {
        Ok(size) => size,
        Err(err) => {
            eprintln!("{}: {}", program, err);
            process::exit(1);
        }
    };

    let sorter = SorterBuilder::new().with_arena_size(arena_size).build();

    if let Err(err) = sorter.sort(Path::new(input), Path::new(output)) {
        if err.is_internal() {
            eprintln!("{}: Internal error: {}", program, err);
        } else {
            eprintln!("{}: {}", program, err);
        }
        process::exit(1);
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("xxlsort")
        .about("sorts a file of binary records by their 64-byte key")
        .after_help(
            "The AVAILABLE_MEM environment variable sets the memory arena size \
             (a number with an optional k/m/g suffix, default 8g). TMP, TEMP and \
             TMPDIR select the directory for transient runs, in that order.",
        )
        .arg(
            clap::Arg::new("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .get_matches()
}
