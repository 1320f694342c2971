// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

pub use handlers::{
    DiscoverOptions, HostReport, execute_discovery, generate_discovery_report,
    generate_json_report, load_urls_from_file, load_urls_from_source, parse_url_line,
};
