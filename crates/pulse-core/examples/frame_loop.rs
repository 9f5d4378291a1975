//! Minimal host loop driving a runner once per simulated frame.
//!
//! Run with: `cargo run --example frame_loop`

use std::sync::Arc;

use pulse_core::{poll_fn, Advance, Frames, Runner, SimpleSource, SourcePool, Status};

fn main() {
    let runner = Runner::new("update");
    let pool: SourcePool<u64> = SourcePool::with_capacity(16);

    // A pooled operation that produces a value on its fourth frame.
    let (source, token) = pool.acquire();
    let completer = source.clone();
    let mut frame = 0u64;
    runner.register(Box::new(poll_fn(move || {
        frame += 1;
        if frame == 4 {
            completer.try_set_result(frame * frame);
            Ok(Advance::Finished)
        } else {
            Ok(Advance::Running)
        }
    })));

    // A fire-and-forget frame delay signaling a bare source.
    let delay_done = Arc::new(SimpleSource::new());
    let delay_token = delay_done.token();
    runner.register(Box::new(Frames::with_signal(2, delay_done.clone())));

    // The host frame loop: tick once per frame until idle.
    let mut frames = 0;
    while !runner.is_empty() {
        frames += 1;
        runner.tick();
        println!("frame {frames}: {} operations still live", runner.len());
    }

    assert_eq!(delay_done.status(delay_token).unwrap(), Status::Succeeded);
    delay_done.consume(delay_token).unwrap();

    let value = source.get_result(token).unwrap();
    println!("pooled operation produced {value} after {frames} frames");

    // Recycle the source; the next acquire reuses it without allocating.
    pool.release(source).unwrap();
    println!("pool now retains {} source(s)", pool.pooled());
}
