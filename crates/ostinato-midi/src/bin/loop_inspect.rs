//! Dump the contents of a loop file for debugging
//!
//! Usage: loop-inspect <file.mid>

use anyhow::{bail, Context, Result};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        bail!("usage: loop-inspect <file.mid>");
    }
    let path = std::path::Path::new(&args[1]);

    let (store, bpm) = ostinato_midi::load_loops(path)
        .with_context(|| format!("Cannot read loop file {:?}", path))?;

    println!(
        "{}: {:.1} BPM, {} events, master loop {:.3}s",
        path.display(),
        bpm,
        store.total_events(),
        store.max_loop_time()
    );

    for ch in 0..ostinato_core::NUM_CHANNELS {
        let events = store.channel(ch);
        if events.is_empty() {
            continue;
        }
        println!(
            "channel {:2}: {} events, {:.3}s",
            ch,
            events.len(),
            store.channel_len_secs(ch)
        );
        for ev in events {
            println!(
                "  {:9.3}s  +{:7.3}  {:02x?}",
                ev.at,
                ev.delta,
                ev.message.as_bytes()
            );
        }
    }
    Ok(())
}
