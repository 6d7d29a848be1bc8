//! MCP Insider CLI: harvest MCP server repositories, annotate them with an
//! LLM, and curate the resulting catalog.
//!
//! Runs the pipeline stages directly (`collect`, `analyze`), on a schedule
//! (`watch`), or behind the admin HTTP server (`serve`).

mod commands;
mod server;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::{Cli, Context};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let ctx = Context::load(&cli)?;
    commands::init_tracing(&cli, &ctx);
    commands::run(cli, ctx).await
}
