//! Follows a set of files and prints their lines.
//!
//! Usage:
//!     follow [--last N] /path/to/file1 /path/to/file2 ...
//!
//! Each file is seeded with its last N lines (default 10) and then followed
//! across rotation and recreation.

use futures_util::stream::{SelectAll, StreamExt};
use linefan::TailWatcher;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut last = 10;
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(|s| s.as_str()) == Some("--last") {
        args.remove(0);
        last = args.remove(0).parse()?;
    }

    let (watcher, mut errors) = TailWatcher::new()?;
    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            eprintln!("follow: {err}");
        }
    });

    let mut streams = SelectAll::new();
    for f in &args {
        let reader = watcher.add(f, 1000, None, last).await?;
        let name = reader.name().display().to_string();
        streams.push(reader.into_stream().map(move |line| (name.clone(), line)).boxed());
    }

    while let Some((name, line)) = streams.next().await {
        println!("({name}) {}", String::from_utf8_lossy(&line));
    }

    Ok(())
}
