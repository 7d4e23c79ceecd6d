//! Workload generator for filemon
//!
//! Creates and deletes files from several threads at once, plus one failing
//! delete per round, so every kind of record shows up:
//! - Successful unlinks (RET: 0)
//! - Failed unlinks of missing files (RET: -2)
//! - Writes (with `--writes`)
//!
//! Run with: cargo run --example unlink-burst -- [THREADS] [ROUNDS]
//! Monitor with: sudo filemon run --pid <pid> --writes

use std::io::Write;
use std::time::Duration;

fn main() -> std::io::Result<()> {
    let mut args = std::env::args().skip(1);
    let threads: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);
    let rounds: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(10);

    let dir = tempfile::tempdir()?;
    println!("🚀 unlink-burst pid={}", std::process::id());
    println!("   {threads} threads × {rounds} rounds in {}\n", dir.path().display());

    // Give the monitor time to attach to this PID
    std::thread::sleep(Duration::from_secs(2));

    for round in 0..rounds {
        std::thread::scope(|s| {
            for t in 0..threads {
                let dir = dir.path();
                s.spawn(move || -> std::io::Result<()> {
                    let path = dir.join(format!("r{round}-t{t}.tmp"));
                    let mut file = std::fs::File::create(&path)?;
                    writeln!(file, "round {round} thread {t}")?;
                    drop(file);
                    std::fs::remove_file(&path)
                });
            }
        });

        // Deleting a missing file still reaches do_unlinkat and fails with ENOENT
        let missing = dir.path().join(format!("missing-{round}"));
        if let Err(e) = std::fs::remove_file(&missing) {
            println!("[round {round}] expected failure: {e}");
        }

        std::thread::sleep(Duration::from_millis(250));
    }

    println!("\n✅ Done");
    Ok(())
}
