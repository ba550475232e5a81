use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::blocklist::BlockList;

/// Line-oriented admin console. Each line either blocks a host, is reported
/// as invalid, or (`exit`, case-insensitive) initiates shutdown by
/// cancelling the shared token. EOF on the reader ends the loop.
pub async fn run<R>(reader: R, blocklist: Arc<BlockList>, shutdown: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        println!("\nPROXY SERVER MENU");
        print!("Enter new site to block (hostname or URL) (or type 'exit' to quit): ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("admin console read failed: {}", e);
                break;
            }
        };

        let input = line.trim();
        if input.eq_ignore_ascii_case("exit") {
            println!("Shutting down proxy server...");
            shutdown.cancel();
            break;
        }
        if input.is_empty() {
            println!("No input entered.");
            continue;
        }
        match blocklist.block(input) {
            Some(host) => println!("Blocked Host: {}", host),
            None => println!("Invalid hostname or URL."),
        }
    }
}
