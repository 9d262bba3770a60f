use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::runtime::Builder;

use treesync::cli::{Cli, Commands};
use treesync::client::{self, PushOptions};
use treesync::util::format_size;
use treesync::{logging, server};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Serve { path, port, bind } => {
            // one thread: the multiplexer owns every connection
            let rt = Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            rt.block_on(server::run_server(path, &bind, port))?;
        }
        Commands::Push {
            path,
            host,
            port,
            excludes,
            max_transfers,
            json,
        } => {
            let mut opts = PushOptions::new(path, host, port);
            opts.excludes = client::compile_excludes(&excludes).context("Invalid --exclude pattern")?;
            opts.max_transfers = max_transfers;

            let rt = Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            let outcome = rt
                .block_on(client::push_tree(&opts))
                .context("Sync aborted")?;

            let s = &outcome.summary;
            if json {
                println!("{}", serde_json::to_string(s)?);
            } else {
                println!(
                    "Done! Entries: {}, Up to date: {}, Files sent: {}, Dirs created: {}, Size: {}, Failures: {}",
                    s.entries,
                    s.up_to_date,
                    s.transferred_files,
                    s.created_dirs,
                    format_size(s.transferred_bytes),
                    s.failures
                );
            }
            if let Some(first) = outcome.first_failure() {
                bail!(
                    "Sync finished with {} failure(s), first: {}",
                    outcome.failures.len(),
                    first
                );
            }
        }
    }

    Ok(())
}
