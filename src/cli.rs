use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a generation request and place it on the queue.
    Enqueue(EnqueueArgs),
    /// Consume queued tasks until interrupted.
    Worker(WorkerArgs),
    /// Print a book record and its page states.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Generation request file (YAML). A missing `book_id` is generated.
    #[arg(long)]
    pub request: String,

    /// Configuration file (YAML). Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Configuration file (YAML). Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Book identifier to inspect.
    #[arg(long)]
    pub book_id: String,

    /// Configuration file (YAML). Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<String>,
}
