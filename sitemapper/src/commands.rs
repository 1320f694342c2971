use crate::CLAP_STYLING;
use clap::{arg, command};
use sitemapper_scanner::sitemap::SITEMAP_PATH;
use url::Url;

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("sitemapper")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("sitemapper")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-v --"verbose" "Show debug logging (RUST_LOG takes precedence)")
                .required(false)
                .global(true),
        )
        .subcommand_required(false)
        .subcommand(
            command!("discover")
                .about(
                    "Read the sitemap.xml of a host or collection of hosts and report every \
                listed URL that really exists.",
                )
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("The URL of the host to read the sitemap from")
                        .value_parser(clap::value_parser!(Url))
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of hosts")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                )
                .arg(
                    arg!(-t --"threads" <NUM_WORKERS>)
                        .required(false)
                        .help("The number of candidate URLs fetched at the same time.")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"timeout" <SECONDS>)
                        .required(false)
                        .help("Request timeout in seconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("10"),
                )
                .arg(
                    arg!(--"sitemap-path" <PATH>)
                        .required(false)
                        .help("Where the sitemap lives, relative to the host root")
                        .default_value(SITEMAP_PATH),
                )
                .arg(
                    arg!(--"skip-sitemap-request")
                        .required(false)
                        .help("Do not report the sitemap itself as a discovered request")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            command!("plugin")
                .about("Inspect the discovery plugin")
                .subcommand_required(true)
                .subcommand(command!("info").about("Describe the sitemap discovery plugin")),
        )
}
