//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Harvest publicly licensed PDF documentation for a catalog of search terms.
///
/// Candidates are discovered through the search API, scraped engine result
/// pages and seed pages, vetted for robots.txt and reuse rights, then stored
/// under content-addressed names with an append-only manifest.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// JSON catalog of category -> [terms] (built-in data-center catalog if omitted)
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory for stored documents, manifest, log and report
    #[arg(short = 'o', long, value_name = "DIR", default_value = "harvest")]
    pub output_dir: PathBuf,

    /// Candidates per search term (1-1000)
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u16).range(1..=1000))]
    pub max_results: Option<u16>,

    /// Concurrent candidate workers (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Seed page to scan for PDF links (repeatable; replaces configured seeds)
    #[arg(long = "seed", value_name = "URL")]
    pub seeds: Vec<String>,

    /// Search engine to scrape (repeatable; replaces configured engines)
    #[arg(long = "engine", value_name = "NAME")]
    pub engines: Vec<String>,

    /// Skip engine scraping entirely
    #[arg(long, conflicts_with = "engines")]
    pub no_engines: bool,

    /// Only process this catalog category
    #[arg(long, value_name = "NAME")]
    pub category: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Default log filter directive from `-q` / `-v` flags.
    #[must_use]
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}
