use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "A resilient direct-messaging client with a durable offline outbox")]
pub struct Cli {
    /// Account name on the message server
    #[arg(short, long, global = true)]
    pub username: Option<String>,

    /// Account password
    #[arg(short, long, global = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a direct message
    ///
    /// The message is written to the durable outbox before anything touches
    /// the network, so it survives a crash or an offline server and is
    /// delivered on the next successful connection.
    ///
    /// Example: courier -u alice send bob "see you at 5"
    Send {
        /// Recipient identity
        recipient: String,
        /// Message body
        message: String,
    },

    /// Run the client interactively
    ///
    /// Keeps a connection up (reconnecting with backoff), delivers queued
    /// mail, and prints incoming messages and delivery reports until
    /// interrupted with Ctrl-C.
    Watch,

    /// List known contacts
    Contacts,

    /// Show message history with a peer
    History {
        /// Conversation partner
        peer: String,
        /// Maximum number of messages to show
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
        /// Fetch the server-side history instead of the local database
        /// (requires credentials and a reachable server)
        #[arg(long)]
        remote: bool,
    },

    /// Show pending and failed outbox entries
    Outbox {
        /// Re-queue a failed entry by id for delivery on the next run
        #[arg(long)]
        retry: Option<i64>,
    },

    /// Import a legacy .dsu profile file (one-time)
    ///
    /// Converts the flat-file profile's account, friends and message
    /// history into local records. The file itself is left untouched and
    /// never used as a live store.
    Import {
        /// Path to the .dsu profile file
        path: PathBuf,
    },

    /// Show the active configuration
    Config,
}
