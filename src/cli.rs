use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tagplan", version, about = "Terminal client for the AI day-planning backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the blocks scheduled for a day
    Blocks {
        /// Date to list (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
    },
    /// Ask the backend for a plan preview derived from a note
    Preview {
        /// Free-text note
        text: String,
        /// Priority for the note (1-5)
        #[arg(long)]
        priority: Option<u32>,
        /// Confirm the preview into the day plan right away
        #[arg(long)]
        confirm: bool,
    },
    /// Ask the backend for a plan derived from a natural-language command
    Plan {
        /// Command text, e.g. "Plane 2 Stunden Lernen ein."
        text: String,
        /// Confirm the resulting preview right away
        #[arg(long)]
        confirm: bool,
    },
    /// Shift or extend an existing block
    Adjust {
        /// Id of the block to adjust
        block_id: String,
        /// Date the block lives on (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
        /// Move the block by this many minutes (may be negative)
        #[arg(long, allow_hyphen_values = true, conflicts_with = "extend")]
        shift: Option<i64>,
        /// Grow the block by this many minutes
        #[arg(long)]
        extend: Option<i64>,
    },
    /// Launch the interactive planner view
    Tui,
}
