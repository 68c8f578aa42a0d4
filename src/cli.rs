use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start recall as a service.
    Daemon {},

    /// Capture a page visit into the store
    Capture {
        /// A url
        url: String,

        /// Page title
        #[clap(short, long)]
        title: Option<String>,

        /// Page body text
        #[clap(short, long)]
        body: Option<String>,

        /// Comma separated keywords
        #[clap(short = 'g', long)]
        keywords: Option<String>,

        /// Browsing session this visit belongs to
        #[clap(short, long)]
        session: Option<String>,

        /// Visit time in epoch milliseconds. Defaults to now.
        #[clap(long)]
        timestamp: Option<u64>,
    },

    /// Search stored records by meaning
    Search {
        query: String,

        /// Max results
        #[clap(short, long)]
        limit: Option<usize>,

        /// Minimum similarity, 0.0 to 1.0
        #[clap(short, long)]
        threshold: Option<f32>,
    },

    /// Show records linked to the given one, strongest first
    Neighbors {
        /// Record id
        id: u64,

        /// Max results
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Delete records by domain or date range, with everything derived
    /// from them
    Forget {
        /// Delete every record from this domain
        #[clap(short, long)]
        domain: Option<String>,

        /// Delete records in start..end, epoch milliseconds or YYYY-MM-DD,
        /// both ends inclusive
        #[clap(long)]
        date_range: Option<String>,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Print every stored record as JSON
    Export {},

    /// Inspect and merge browsing sessions
    Sessions {
        #[clap(subcommand)]
        action: SessionArgs,
    },

    /// Manage privacy rules
    Rules {
        #[clap(subcommand)]
        action: RulesArgs,
    },

    /// Dataset counters and disk usage
    Stats {},

    /// Re-embed every record and rebuild edges and clusters
    Reindex {},

    /// Archive the dataset as tar.gz
    Backup {
        /// Output path. Writes to stdout when piped.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore a dataset archive
    Restore {
        /// Archive path. Reads stdin when piped.
        path: Option<PathBuf>,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionArgs {
    /// Compare two sessions by URL membership
    Diff {
        /// First session id
        a: String,

        /// Second session id
        b: String,
    },
    /// Merge two sessions into one
    Merge {
        /// First session id
        a: String,

        /// Second session id
        b: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RulesArgs {
    /// Create a new rule
    Add {
        /// domain, date or keyword
        kind: String,

        /// Substring or r/regex/ for domain and keyword rules,
        /// start..end for date rules
        value: String,
    },
    /// Delete a rule by id
    Delete {
        /// Rule id
        id: String,
    },
    /// List all rules
    List {},
    /// Flip a rule between active and inactive
    Toggle {
        /// Rule id
        id: String,
    },
}
